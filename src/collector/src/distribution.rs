// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The distribution job.
//!
//! Services become due for a distributor pass when a capacity or usage
//! scrape lands (debounced through the store); this job claims them and
//! delegates to [`limes_distributor::Distributor::run_pass`]. A failed pass
//! changes nothing and re-arms the service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use limes_distributor::{DistributeError, Distributor};
use limes_ore::now::EpochMillis;
use limes_repr::{ClusterConfig, ServiceType};
use limes_store::{Store, StoreError};

use crate::jobs::{JobDefinition, JobError};
use crate::metrics::CollectorMetrics;

/// The C8 job: recompute fair-share quotas for due services.
pub struct DistributionJob {
    store: Arc<dyn Store>,
    distributor: Arc<Distributor>,
    config: ClusterConfig,
    metrics: CollectorMetrics,
}

impl DistributionJob {
    /// Creates the job.
    pub fn new(
        store: Arc<dyn Store>,
        distributor: Arc<Distributor>,
        config: ClusterConfig,
        metrics: CollectorMetrics,
    ) -> DistributionJob {
        DistributionJob {
            store,
            distributor,
            config,
            metrics,
        }
    }
}

#[async_trait]
impl JobDefinition for DistributionJob {
    type Claim = ServiceType;

    fn name(&self) -> &'static str {
        "distribution"
    }

    fn max_runtime(&self) -> Duration {
        self.config.intervals.max_runtime()
    }

    fn idle_interval(&self) -> Duration {
        Duration::from_secs(2)
    }

    async fn claim(&self, now: EpochMillis) -> Result<Option<ServiceType>, StoreError> {
        self.store.claim_due_distribution(now).await
    }

    async fn run(&self, claim: &ServiceType) -> Result<(), JobError> {
        let timer = self.metrics.distributor_duration.start_timer();
        let result = self.distributor.run_pass(claim).await;
        timer.observe_duration();
        match result {
            Ok(_summary) => {
                self.metrics
                    .distributor_runs
                    .with_label_values(&[claim.as_str(), "success"])
                    .inc();
                Ok(())
            }
            Err(DistributeError::Store(e)) => Err(JobError::Store(e)),
        }
    }

    async fn record_failure(&self, claim: &ServiceType, now: EpochMillis, error: &JobError) {
        self.metrics
            .distributor_runs
            .with_label_values(&[claim.as_str(), "error"])
            .inc();
        warn!(service_type = %claim, error = %error,
            "distribution pass failed; desired quotas unchanged");

        // Re-arm the service so the pass is retried after the debounce.
        let debounce = self.config.intervals.distribution_debounce();
        let at = now + u64::try_from(debounce.as_millis()).unwrap_or(u64::MAX);
        if let Err(e) = self.store.schedule_distribution(claim.clone(), at).await {
            warn!(error = %e, "failed to re-arm distribution");
        }
    }
}
