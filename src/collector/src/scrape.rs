// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The usage scrape loop.
//!
//! For each claimed (project, service) cursor: call the adapter's usage
//! scan, translate the report off the wire, and commit the whole
//! reconciliation in one store transaction. Failures never mutate resource
//! rows; they stamp the cursor and reschedule it, transient ones with
//! exponential backoff, permanent ones at the normal cadence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use limes_liquid::{
    LiquidError, LiquidRegistry, ProjectMetadata, ServiceInfo, UsageRequest,
};
use limes_ore::now::{EpochMillis, NowFn};
use limes_repr::{BackendQuota, ClusterConfig, Topology};
use limes_store::{
    DeclaredResource, ObservedAz, ObservedResource, ScrapeClaim, Store, StoreError,
    UsageScrapeCommit,
};

use crate::jobs::{backoff_interval, jittered, JobDefinition, JobError};
use crate::info::ServiceInfoCache;
use crate::metrics::CollectorMetrics;

/// The C5 job: scrape usage per (project, service) pair.
pub struct ScrapeJob {
    store: Arc<dyn Store>,
    liquids: LiquidRegistry,
    infos: Arc<ServiceInfoCache>,
    config: ClusterConfig,
    clock: NowFn,
    metrics: CollectorMetrics,
}

impl ScrapeJob {
    /// Creates the job.
    pub fn new(
        store: Arc<dyn Store>,
        liquids: LiquidRegistry,
        infos: Arc<ServiceInfoCache>,
        config: ClusterConfig,
        clock: NowFn,
        metrics: CollectorMetrics,
    ) -> ScrapeJob {
        ScrapeJob {
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
impl JobDefinition for ScrapeJob {
    type Claim = ScrapeClaim;

    fn name(&self) -> &'static str {
        "scrape"
    }

    fn max_runtime(&self) -> Duration {
        self.config.intervals.max_runtime()
    }

    fn idle_interval(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn claim(&self, now: EpochMillis) -> Result<Option<ScrapeClaim>, StoreError> {
        self.store.claim_due_scrape(now).await
    }

    async fn run(&self, claim: &ScrapeClaim) -> Result<(), JobError> {
        let service_type = &claim.project_service.service_type;
        let info = self
            .infos
            .get(service_type)
            .ok_or_else(|| JobError::Invariant(format!("no service info for {service_type}")))?;
        let liquid = self
            .liquids
            .get(service_type)
            .map_err(|e| JobError::Invariant(e.to_string()))?;

        let request = UsageRequest {
            info_version: info.version,
            all_azs: self.config.availability_zones.clone(),
            project_metadata: info
                .usage_report_needs_project_metadata
                .then(|| project_metadata(claim)),
            serialized_state: claim.project_service.serialized_state.clone(),
        };
        let timer = self
            .metrics
            .scrape_duration
            .with_label_values(&[service_type.as_str()])
            .start_timer();
        let report = liquid
            .scan_usage(&claim.project.uuid, request, self.max_runtime())
            .await?;
        timer.observe_duration();

        let now = (self.clock)();
        let commit = self.translate(claim, &info, report, now)?;
        self.store.commit_usage_scrape(commit).await?;
        self.metrics
            .scrapes
            .with_label_values(&[service_type.as_str(), "success"])
            .inc();
        debug!(
            service_type = %service_type,
            project = %claim.project.uuid,
            "usage scraped"
        );
        Ok(())
    }

    async fn record_failure(&self, claim: &ScrapeClaim, now: EpochMillis, error: &JobError) {
        let service_type = &claim.project_service.service_type;
        self.metrics
            .scrapes
            .with_label_values(&[service_type.as_str(), "error"])
            .inc();
        warn!(
            service_type = %service_type,
            project = %claim.project.uuid,
            attempt = claim.project_service.consecutive_errors + 1,
            error = %error,
            "usage scrape failed"
        );

        // An adapter answering under a newer version means our declaration
        // set is outdated, not that the adapter is down. Refresh so the next
        // attempt can succeed.
        if let JobError::Backend(LiquidError::VersionMismatch { .. }) = error {
            if let Ok(liquid) = self.liquids.get(service_type) {
                if let Err(refresh_err) = self
                    .infos
                    .refresh(&*self.store, &*liquid, service_type, now, self.max_runtime())
                    .await
                {
                    warn!(service_type = %service_type, error = %refresh_err,
                        "service info refresh failed");
                }
            }
        }

        let intervals = &self.config.intervals;
        let delay = if error.is_transient() {
            backoff_interval(
                intervals.error_backoff(),
                claim.project_service.consecutive_errors + 1,
                intervals.scrape_interval(),
            )
        } else {
            jittered(intervals.scrape_interval())
        };
        let next = now + u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if let Err(e) = self
            .store
            .record_scrape_error(claim.project_service.id, now, error.to_string(), next)
            .await
        {
            warn!(error = %e, "failed to record scrape error; cursor left to the stuck-claim sweep");
        }
    }
}

impl ScrapeJob {
    fn translate(
        &self,
        claim: &ScrapeClaim,
        info: &ServiceInfo,
        report: limes_liquid::UsageReport,
        now: EpochMillis,
    ) -> Result<UsageScrapeCommit, JobError> {
        let service_type = &claim.project_service.service_type;
        let mut retention = Duration::ZERO;
        let declared: Vec<DeclaredResource> = info
            .resources
            .iter()
            .map(|(name, resource)| {
                let rc = self.config.resource(service_type, name);
                retention = retention.max(rc.usage_retention());
                DeclaredResource {
                    name: name.clone(),
                    unit: resource.unit,
                    topology: resource.topology,
                    has_capacity: resource.has_capacity,
                    has_quota: resource.has_quota,
                    initial_quota: rc.initial_quota,
                }
            })
            .collect();

        let mut observed = Vec::new();
        for (name, resource) in report.resources {
            let declared_info = info.resources.get(&name).ok_or_else(|| {
                JobError::Invariant(format!("report covers undeclared resource {name}"))
            })?;
            let backend_quota = resource
                .quota
                .map(BackendQuota::from_wire)
                .transpose()
                .map_err(|e| JobError::Invariant(e.to_string()))?;
            let mut per_az = Vec::new();
            for (az, az_report) in resource.per_az {
                if matches!(az_report.physical_usage, Some(p) if p > az_report.usage) {
                    return Err(JobError::Invariant(format!(
                        "physical usage exceeds usage for {name} in {az}"
                    )));
                }
                let az_backend_quota = match declared_info.topology {
                    Topology::AzSeparated => az_report
                        .backend_quota
                        .map(BackendQuota::from_wire)
                        .transpose()
                        .map_err(|e| JobError::Invariant(e.to_string()))?,
                    _ => None,
                };
                per_az.push(ObservedAz {
                    az,
                    usage: az_report.usage,
                    physical_usage: az_report.physical_usage,
                    subresources: az_report.subresources,
                    backend_quota: az_backend_quota,
                });
            }
            observed.push(ObservedResource {
                name,
                backend_quota,
                per_az,
            });
        }

        let intervals = &self.config.intervals;
        let next = now
            + u64::try_from(jittered(intervals.scrape_interval()).as_millis())
                .unwrap_or(u64::MAX);
        Ok(UsageScrapeCommit {
            project_service_id: claim.project_service.id,
            now,
            next_scrape_at: next,
            declared,
            observed,
            serialized_state: report.serialized_state,
            retention,
            distribution_due_at: now
                + u64::try_from(intervals.distribution_debounce().as_millis())
                    .unwrap_or(u64::MAX),
        })
    }
}

fn project_metadata(claim: &ScrapeClaim) -> ProjectMetadata {
    ProjectMetadata {
        uuid: claim.project.uuid.clone(),
        name: claim.project.name.clone(),
        domain_uuid: claim.domain_uuid.clone(),
        parent_uuid: claim.project.parent_uuid.clone(),
    }
}
