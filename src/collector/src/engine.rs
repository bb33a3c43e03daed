// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Engine assembly.
//!
//! [`Engine`] owns the shared pieces (store, adapter registry, service info
//! cache, distributor, metrics) and builds the job table. The jobs are also
//! exposed individually so that tests can drive single ticks against a
//! manual clock instead of racing real workers.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use limes_distributor::{CommitmentWorkflows, Distributor, SnapshotCell};
use limes_liquid::{LiquidError, LiquidRegistry, RegistryError};
use limes_ore::now::NowFn;
use limes_repr::ClusterConfig;
use limes_store::{Store, StoreError};

use crate::capacity::CapacityScrapeJob;
use crate::cleanup::CleanupJob;
use crate::discovery::{DiscoveryAdapter, DiscoveryJob};
use crate::distribution::DistributionJob;
use crate::info::ServiceInfoCache;
use crate::jobs;
use crate::metrics::CollectorMetrics;
use crate::quota_sync::QuotaSyncJob;
use crate::scrape::ScrapeJob;

/// A fatal error while assembling or starting the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An adapter could not describe its service.
    #[error("failed to build service info: {0}")]
    Liquid(#[from] LiquidError),
    /// The store failed during startup.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A configured service has no adapter.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// The assembled control loop engine.
pub struct Engine {
    store: Arc<dyn Store>,
    liquids: LiquidRegistry,
    discovery: Arc<dyn DiscoveryAdapter>,
    config: ClusterConfig,
    clock: NowFn,
    metrics: CollectorMetrics,
    infos: Arc<ServiceInfoCache>,
    distributor: Arc<Distributor>,
    workflows: Arc<CommitmentWorkflows>,
    authoritative: bool,
}

impl Engine {
    /// Assembles the engine. Metric families register into `registry`.
    pub fn new(
        store: Arc<dyn Store>,
        liquids: LiquidRegistry,
        discovery: Arc<dyn DiscoveryAdapter>,
        config: ClusterConfig,
        clock: NowFn,
        registry: &prometheus::Registry,
        authoritative: bool,
    ) -> Engine {
        let metrics = CollectorMetrics::register_into(registry);
        let distributor = Arc::new(Distributor::new(
            Arc::clone(&store),
            config.clone(),
            clock.clone(),
        ));
        let workflows = Arc::new(CommitmentWorkflows::new(
            Arc::clone(&store),
            liquids.clone(),
            config.clone(),
            clock.clone(),
        ));
        Engine {
            store,
            liquids,
            discovery,
            config,
            clock,
            metrics,
            infos: Arc::new(ServiceInfoCache::new()),
            distributor,
            workflows,
            authoritative,
        }
    }

    /// Returns the metric families.
    pub fn metrics(&self) -> &CollectorMetrics {
        &self.metrics
    }

    /// Returns the published distribution snapshots.
    pub fn snapshots(&self) -> SnapshotCell {
        self.distributor.snapshots()
    }

    /// Returns the commitment workflows.
    pub fn commitments(&self) -> Arc<CommitmentWorkflows> {
        Arc::clone(&self.workflows)
    }

    /// Fetches every adapter's service info, records the versions, and
    /// creates the service rows. Fatal on failure: a cluster that cannot
    /// describe its services must not start half-blind.
    pub async fn startup(&self) -> Result<(), EngineError> {
        let now = (self.clock)();
        for service_type in self.liquids.service_types() {
            let liquid = self.liquids.get(&service_type)?;
            let info = Arc::new(
                liquid
                    .build_service_info(self.config.intervals.max_runtime())
                    .await?,
            );
            self.store
                .ensure_service(now, service_type.clone(), info.version)
                .await?;
            info!(service_type = %service_type, version = info.version, "service registered");
            self.infos.insert(service_type, info);
        }
        Ok(())
    }

    /// Builds the usage scrape job.
    pub fn scrape_job(&self) -> ScrapeJob {
        ScrapeJob::new(
            Arc::clone(&self.store),
            self.liquids.clone(),
            Arc::clone(&self.infos),
            self.config.clone(),
            self.clock.clone(),
            self.metrics.clone(),
        )
    }

    /// Builds the capacity scrape job.
    pub fn capacity_job(&self) -> CapacityScrapeJob {
        CapacityScrapeJob::new(
            Arc::clone(&self.store),
            self.liquids.clone(),
            Arc::clone(&self.infos),
            self.config.clone(),
            self.clock.clone(),
            self.metrics.clone(),
        )
    }

    /// Builds the quota sync job.
    pub fn quota_sync_job(&self) -> QuotaSyncJob {
        QuotaSyncJob::new(
            Arc::clone(&self.store),
            self.liquids.clone(),
            Arc::clone(&self.infos),
            self.config.clone(),
            self.clock.clone(),
            self.metrics.clone(),
        )
    }

    /// Builds the discovery job.
    pub fn discovery_job(&self) -> DiscoveryJob {
        DiscoveryJob::new(
            Arc::clone(&self.store),
            Arc::clone(&self.discovery),
            self.liquids.service_types(),
            self.config.intervals.discovery_interval(),
            self.clock.clone(),
            self.metrics.clone(),
        )
    }

    /// Builds the cleanup job.
    pub fn cleanup_job(&self) -> CleanupJob {
        CleanupJob::new(
            Arc::clone(&self.store),
            Arc::clone(&self.workflows),
            self.config.clone(),
            self.liquids.service_types(),
            self.clock.clone(),
            self.metrics.clone(),
        )
    }

    /// Builds the distribution job.
    pub fn distribution_job(&self) -> DistributionJob {
        DistributionJob::new(
            Arc::clone(&self.store),
            Arc::clone(&self.distributor),
            self.config.clone(),
            self.metrics.clone(),
        )
    }

    /// Spawns the full worker fleet. Quota sync workers are spawned only on
    /// authoritative instances; everything else runs everywhere.
    pub fn spawn(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let intervals = &self.config.intervals;
        let mut handles = Vec::new();
        handles.extend(jobs::spawn_workers(
            Arc::new(self.discovery_job()),
            1,
            self.clock.clone(),
            shutdown.clone(),
        ));
        handles.extend(jobs::spawn_workers(
            Arc::new(self.scrape_job()),
            intervals.scrape_workers,
            self.clock.clone(),
            shutdown.clone(),
        ));
        handles.extend(jobs::spawn_workers(
            Arc::new(self.capacity_job()),
            1,
            self.clock.clone(),
            shutdown.clone(),
        ));
        handles.extend(jobs::spawn_workers(
            Arc::new(self.distribution_job()),
            1,
            self.clock.clone(),
            shutdown.clone(),
        ));
        handles.extend(jobs::spawn_workers(
            Arc::new(self.cleanup_job()),
            1,
            self.clock.clone(),
            shutdown.clone(),
        ));
        if self.authoritative {
            handles.extend(jobs::spawn_workers(
                Arc::new(self.quota_sync_job()),
                intervals.quota_sync_workers,
                self.clock.clone(),
                shutdown.clone(),
            ));
        } else {
            info!("not authoritative: quota sync workers disabled");
        }
        handles
    }
}
