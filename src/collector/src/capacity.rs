// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The capacity scrape loop.
//!
//! One cursor per service. Resources that declare a need for the demand
//! signal receive the aggregate of all projects' usage and commitments in
//! the scan request; the response replaces the service's cluster capacity
//! image wholesale.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use limes_liquid::{CapacityRequest, DemandSignal, LiquidRegistry};
use limes_ore::now::{EpochMillis, NowFn};
use limes_repr::{ClusterConfig, ResourceName};
use limes_store::entities::Service;
use limes_store::{
    CapacityScrapeCommit, ObservedClusterAz, ObservedClusterResource, Store, StoreError,
};

use crate::info::ServiceInfoCache;
use crate::jobs::{backoff_interval, jittered, JobDefinition, JobError};
use crate::metrics::CollectorMetrics;

/// The C6 job: scrape cluster capacity per service.
pub struct CapacityScrapeJob {
    store: Arc<dyn Store>,
    liquids: LiquidRegistry,
    infos: Arc<ServiceInfoCache>,
    config: ClusterConfig,
    clock: NowFn,
    metrics: CollectorMetrics,
}

impl CapacityScrapeJob {
    /// Creates the job.
    pub fn new(
        store: Arc<dyn Store>,
        liquids: LiquidRegistry,
        infos: Arc<ServiceInfoCache>,
        config: ClusterConfig,
        clock: NowFn,
        metrics: CollectorMetrics,
    ) -> CapacityScrapeJob {
        CapacityScrapeJob {
            store,
            liquids,
            infos,
            config,
            clock,
            metrics,
        }
    }
}

#[async_trait]
impl JobDefinition for CapacityScrapeJob {
    type Claim = Service;

    fn name(&self) -> &'static str {
        "capacity"
    }

    fn max_runtime(&self) -> Duration {
        self.config.intervals.max_runtime()
    }

    fn idle_interval(&self) -> Duration {
        Duration::from_secs(10)
    }

    async fn claim(&self, now: EpochMillis) -> Result<Option<Service>, StoreError> {
        self.store.claim_due_capacity(now).await
    }

    async fn run(&self, claim: &Service) -> Result<(), JobError> {
        let service_type = &claim.service_type;
        let info = self
            .infos
            .get(service_type)
            .ok_or_else(|| JobError::Invariant(format!("no service info for {service_type}")))?;
        let liquid = self
            .liquids
            .get(service_type)
            .map_err(|e| JobError::Invariant(e.to_string()))?;

        let demand_resources: Vec<ResourceName> = info
            .resources
            .keys()
            .filter(|name| {
                self.config
                    .resource(service_type, name)
                    .needs_demand_signal
            })
            .cloned()
            .collect();
        let demands = if demand_resources.is_empty() {
            Default::default()
        } else {
            self.store
                .aggregate_demand(service_type, &demand_resources)
                .await?
                .into_iter()
                .map(|(resource, per_az)| {
                    let per_az = per_az
                        .into_iter()
                        .map(|(az, demand)| {
                            (
                                az,
                                DemandSignal {
                                    usage: demand.usage,
                                    unused_commitments: demand.unused_commitments,
                                    pending_commitments: demand.pending_commitments,
                                },
                            )
                        })
                        .collect();
                    (resource, per_az)
                })
                .collect()
        };

        let request = CapacityRequest {
            info_version: info.version,
            all_azs: self.config.availability_zones.clone(),
            demands,
        };
        let report = liquid.scan_capacity(request, self.max_runtime()).await?;

        let mut resources = Vec::new();
        for (name, resource) in report.resources {
            let declared = info.resources.get(&name).ok_or_else(|| {
                JobError::Invariant(format!("report covers undeclared resource {name}"))
            })?;
            if !declared.has_capacity {
                return Err(JobError::Invariant(format!(
                    "capacity reported for quota-only resource {name}"
                )));
            }
            resources.push(ObservedClusterResource {
                name,
                per_az: resource
                    .per_az
                    .into_iter()
                    .map(|(az, az_report)| ObservedClusterAz {
                        az,
                        raw_capacity: az_report.capacity,
                        usage: az_report.usage,
                        subcapacities: az_report.subcapacities,
                    })
                    .collect(),
            });
        }

        let now = (self.clock)();
        let intervals = &self.config.intervals;
        self.store
            .commit_capacity_scrape(CapacityScrapeCommit {
                service_type: service_type.clone(),
                now,
                next_scrape_at: now
                    + u64::try_from(jittered(intervals.capacity_interval()).as_millis())
                        .unwrap_or(u64::MAX),
                resources,
                distribution_due_at: now
                    + u64::try_from(intervals.distribution_debounce().as_millis())
                        .unwrap_or(u64::MAX),
            })
            .await?;
        self.metrics
            .capacity_scrapes
            .with_label_values(&[service_type.as_str(), "success"])
            .inc();
        debug!(service_type = %service_type, "capacity scraped");
        Ok(())
    }

    async fn record_failure(&self, claim: &Service, now: EpochMillis, error: &JobError) {
        let service_type = &claim.service_type;
        self.metrics
            .capacity_scrapes
            .with_label_values(&[service_type.as_str(), "error"])
            .inc();
        warn!(
            service_type = %service_type,
            attempt = claim.consecutive_errors + 1,
            error = %error,
            "capacity scrape failed"
        );

        let intervals = &self.config.intervals;
        let delay = if error.is_transient() {
            backoff_interval(
                intervals.error_backoff(),
                claim.consecutive_errors + 1,
                intervals.capacity_interval(),
            )
        } else {
            jittered(intervals.capacity_interval())
        };
        let next = now + u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if let Err(e) = self
            .store
            .record_capacity_error(service_type.clone(), now, error.to_string(), next)
            .await
        {
            warn!(error = %e, "failed to record capacity error");
        }
    }
}
