// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The consistency sweep.
//!
//! Periodic invariant repair: create scrape cursors that a configuration
//! change left missing, release claims abandoned by dead workers, purge
//! projects gone from identity past the grace period, and compensate missed
//! commitment timers. The sweep also refreshes the store-derived gauges,
//! keeping that work off the scrape hot paths.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use limes_distributor::{CommitmentError, CommitmentWorkflows};
use limes_ore::now::{EpochMillis, NowFn};
use limes_repr::{ClusterConfig, ServiceType};
use limes_store::{Store, StoreError};

use crate::jobs::{JobDefinition, JobError};
use crate::metrics::CollectorMetrics;

/// How many times longer than the watchdog deadline a claim may stay
/// stamped before the sweep assumes its worker died.
const STUCK_CLAIM_FACTOR: u32 = 3;

/// The C10 job: periodic invariant repair.
pub struct CleanupJob {
    store: Arc<dyn Store>,
    workflows: Arc<CommitmentWorkflows>,
    config: ClusterConfig,
    service_types: Vec<ServiceType>,
    clock: NowFn,
    metrics: CollectorMetrics,
    next_run_at: Mutex<EpochMillis>,
}

impl CleanupJob {
    /// Creates the job.
    pub fn new(
        store: Arc<dyn Store>,
        workflows: Arc<CommitmentWorkflows>,
        config: ClusterConfig,
        service_types: Vec<ServiceType>,
        clock: NowFn,
        metrics: CollectorMetrics,
    ) -> CleanupJob {
        CleanupJob {
            store,
            workflows,
            config,
            service_types,
            clock,
            metrics,
            next_run_at: Mutex::new(0),
        }
    }
}

#[async_trait]
impl JobDefinition for CleanupJob {
    type Claim = ();

    fn name(&self) -> &'static str {
        "cleanup"
    }

    fn max_runtime(&self) -> Duration {
        self.config.intervals.max_runtime()
    }

    fn idle_interval(&self) -> Duration {
        self.config.intervals.cleanup_interval() / 4
    }

    async fn claim(&self, now: EpochMillis) -> Result<Option<()>, StoreError> {
        let mut next_run_at = self.next_run_at.lock().expect("cleanup lock poisoned");
        if now < *next_run_at {
            return Ok(None);
        }
        let interval = self.config.intervals.cleanup_interval();
        *next_run_at = now + u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        Ok(Some(()))
    }

    async fn run(&self, _claim: &()) -> Result<(), JobError> {
        let now = (self.clock)();

        let cursors_created = self
            .store
            .ensure_project_services(now, &self.service_types)
            .await?;
        let claims_released = self
            .store
            .release_stuck_claims(now, self.max_runtime() * STUCK_CLAIM_FACTOR)
            .await?;
        let projects_purged = self
            .store
            .purge_missing_projects(now, self.config.discovery.grace_period())
            .await?;
        let sweep = self.workflows.sweep(now).await.map_err(|e| match e {
            CommitmentError::Store(e) => JobError::Store(e),
            other => JobError::Invariant(other.to_string()),
        })?;

        if cursors_created > 0
            || claims_released > 0
            || projects_purged > 0
            || sweep != Default::default()
        {
            info!(
                cursors_created,
                claims_released,
                projects_purged,
                commitments_moved_to_pending = sweep.moved_to_pending,
                commitments_confirmed = sweep.confirmed,
                commitments_expired = sweep.expired,
                "consistency sweep applied repairs"
            );
        }

        if let Err(e) = self.metrics.refresh_gauges(&*self.store, now).await {
            warn!(error = %e, "failed to refresh gauges");
        }
        Ok(())
    }

    async fn record_failure(&self, _claim: &(), _now: EpochMillis, error: &JobError) {
        warn!(error = %error, "consistency sweep failed; retrying at the next interval");
    }
}
