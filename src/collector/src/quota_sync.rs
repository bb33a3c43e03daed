// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The quota sync loop.
//!
//! Pairs whose desired quota drifted from the backend's are claimed here;
//! the whole per-service quota set is pushed in one idempotent update. On
//! success the store records the backend as in sync and clears the drift
//! marker; on failure the marker stays set, so the pair is retried with
//! backoff until the drift is resolved. Only authoritative instances run
//! this job.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use limes_liquid::{LiquidRegistry, ProjectMetadata, QuotaTarget, SetQuotaRequest};
use limes_ore::now::{EpochMillis, NowFn};
use limes_repr::{ClusterConfig, ResourceName, Topology};
use limes_store::{QuotaSyncClaim, Store, StoreError};

use crate::info::ServiceInfoCache;
use crate::jobs::{backoff_interval, JobDefinition, JobError};
use crate::metrics::CollectorMetrics;

/// The C7 job: push drifted quotas back to the backend.
pub struct QuotaSyncJob {
    store: Arc<dyn Store>,
    liquids: LiquidRegistry,
    infos: Arc<ServiceInfoCache>,
    config: ClusterConfig,
    clock: NowFn,
    metrics: CollectorMetrics,
}

impl QuotaSyncJob {
    /// Creates the job.
    pub fn new(
        store: Arc<dyn Store>,
        liquids: LiquidRegistry,
        infos: Arc<ServiceInfoCache>,
        config: ClusterConfig,
        clock: NowFn,
        metrics: CollectorMetrics,
    ) -> QuotaSyncJob {
        QuotaSyncJob {
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
impl JobDefinition for QuotaSyncJob {
    type Claim = QuotaSyncClaim;

    fn name(&self) -> &'static str {
        "quota-sync"
    }

    fn max_runtime(&self) -> Duration {
        self.config.intervals.max_runtime()
    }

    fn idle_interval(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn claim(&self, now: EpochMillis) -> Result<Option<QuotaSyncClaim>, StoreError> {
        self.store.claim_desynced(now).await
    }

    async fn run(&self, claim: &QuotaSyncClaim) -> Result<(), JobError> {
        let service_type = &claim.project_service.service_type;
        let info = self
            .infos
            .get(service_type)
            .ok_or_else(|| JobError::Invariant(format!("no service info for {service_type}")))?;
        let liquid = self
            .liquids
            .get(service_type)
            .map_err(|e| JobError::Invariant(e.to_string()))?;

        let mut resources: BTreeMap<ResourceName, QuotaTarget> = BTreeMap::new();
        for resource in &claim.resources {
            let Some(desired) = resource.desired_backend_quota else {
                continue;
            };
            if !resource.has_quota {
                continue;
            }
            let per_az = (resource.topology == Topology::AzSeparated).then(|| {
                claim
                    .az_resources
                    .iter()
                    .filter(|az| az.project_resource_id == resource.id)
                    .filter_map(|az| {
                        az.desired_backend_quota
                            .map(|quota| (az.az.clone(), quota.to_wire()))
                    })
                    .collect()
            });
            resources.insert(
                resource.name.clone(),
                QuotaTarget {
                    quota: desired.to_wire(),
                    per_az,
                },
            );
        }

        let now = (self.clock)();
        if resources.is_empty() {
            // Nothing left to push: the drift resolved itself (e.g. rows
            // went stale). Clear the marker.
            self.store
                .complete_quota_sync(claim.project_service.id, now, BTreeMap::new())
                .await?;
            return Ok(());
        }

        let request = SetQuotaRequest {
            info_version: info.version,
            project_metadata: info.quota_update_needs_project_metadata.then(|| {
                ProjectMetadata {
                    uuid: claim.project.uuid.clone(),
                    name: claim.project.name.clone(),
                    domain_uuid: claim.domain_uuid.clone(),
                    parent_uuid: claim.project.parent_uuid.clone(),
                }
            }),
            resources,
        };
        let response = liquid
            .set_quota(&claim.project.uuid, request, self.max_runtime())
            .await?;

        let now = (self.clock)();
        self.store
            .complete_quota_sync(claim.project_service.id, now, response.floors)
            .await?;
        self.metrics
            .quota_syncs
            .with_label_values(&[service_type.as_str(), "success"])
            .inc();
        info!(
            service_type = %service_type,
            project = %claim.project.uuid,
            "backend quotas synced"
        );
        Ok(())
    }

    async fn record_failure(&self, claim: &QuotaSyncClaim, now: EpochMillis, error: &JobError) {
        let service_type = &claim.project_service.service_type;
        self.metrics
            .quota_syncs
            .with_label_values(&[service_type.as_str(), "error"])
            .inc();
        warn!(
            service_type = %service_type,
            project = %claim.project.uuid,
            attempt = claim.project_service.quota_sync_errors + 1,
            error = %error,
            "quota sync failed; desync marker stays set"
        );

        let intervals = &self.config.intervals;
        let delay = backoff_interval(
            intervals.error_backoff(),
            claim.project_service.quota_sync_errors + 1,
            intervals.scrape_interval(),
        );
        let retry_at = now + u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if let Err(e) = self
            .store
            .record_quota_sync_error(claim.project_service.id, now, error.to_string(), retry_at)
            .await
        {
            warn!(error = %e, "failed to record quota sync error");
        }
    }
}
