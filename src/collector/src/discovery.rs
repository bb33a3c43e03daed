// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The discovery loop.
//!
//! Enumerates domains and projects from the identity provider and
//! reconciles the store's mirror: new projects get records and scrape
//! cursors, vanished ones are marked missing and eventually purged by the
//! cleanup sweep. The identity provider itself is an external collaborator
//! behind the [`DiscoveryAdapter`] trait.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use limes_ore::now::{EpochMillis, NowFn};
use limes_repr::{DiscoveryConfig, ServiceType};
use limes_store::{DiscoveredDomain, DiscoveredProject, Store, StoreError};

use crate::jobs::{JobDefinition, JobError};
use crate::metrics::CollectorMetrics;

/// An error from the identity provider.
#[derive(Debug, thiserror::Error)]
#[error("identity provider error: {0}")]
pub struct DiscoveryError(pub String);

/// Enumerates domains and projects from the identity provider.
#[async_trait]
pub trait DiscoveryAdapter: Send + Sync {
    /// Returns the complete current listing. Projects absent from the
    /// listing are treated as deleted (after the grace period).
    async fn discover(&self) -> Result<Vec<DiscoveredDomain>, DiscoveryError>;
}

/// A [`DiscoveryAdapter`] serving a fixed listing from the configuration,
/// for deployments without a live identity provider and for tests.
#[derive(Clone, Debug, Default)]
pub struct StaticDiscovery {
    domains: Vec<DiscoveredDomain>,
}

impl StaticDiscovery {
    /// Builds the listing from the discovery configuration.
    pub fn from_config(config: &DiscoveryConfig) -> StaticDiscovery {
        let domains = config
            .static_domains
            .iter()
            .map(|domain| DiscoveredDomain {
                uuid: domain.uuid.clone(),
                name: domain.name.clone(),
                projects: domain
                    .projects
                    .iter()
                    .map(|project| DiscoveredProject {
                        uuid: project.uuid.clone(),
                        name: project.name.clone(),
                        parent_uuid: project.parent_uuid.clone(),
                    })
                    .collect(),
            })
            .collect();
        StaticDiscovery { domains }
    }
}

#[async_trait]
impl DiscoveryAdapter for StaticDiscovery {
    async fn discover(&self) -> Result<Vec<DiscoveredDomain>, DiscoveryError> {
        Ok(self.domains.clone())
    }
}

/// The C4 job: reconcile the domain/project mirror.
pub struct DiscoveryJob {
    store: Arc<dyn Store>,
    adapter: Arc<dyn DiscoveryAdapter>,
    service_types: Vec<ServiceType>,
    interval: Duration,
    clock: NowFn,
    metrics: CollectorMetrics,
    next_run_at: Mutex<EpochMillis>,
}

impl DiscoveryJob {
    /// Creates the job.
    pub fn new(
        store: Arc<dyn Store>,
        adapter: Arc<dyn DiscoveryAdapter>,
        service_types: Vec<ServiceType>,
        interval: Duration,
        clock: NowFn,
        metrics: CollectorMetrics,
    ) -> DiscoveryJob {
        DiscoveryJob {
            store,
            adapter,
            service_types,
            interval,
            clock,
            metrics,
            next_run_at: Mutex::new(0),
        }
    }
}

#[async_trait]
impl JobDefinition for DiscoveryJob {
    type Claim = ();

    fn name(&self) -> &'static str {
        "discovery"
    }

    fn max_runtime(&self) -> Duration {
        self.interval
    }

    fn idle_interval(&self) -> Duration {
        self.interval / 4
    }

    async fn claim(&self, now: EpochMillis) -> Result<Option<()>, StoreError> {
        // Discovery has a single global cursor, kept in process: only one
        // instance runs discovery, and an extra run is merely redundant.
        let mut next_run_at = self.next_run_at.lock().expect("discovery lock poisoned");
        if now < *next_run_at {
            return Ok(None);
        }
        *next_run_at = now + u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX);
        Ok(Some(()))
    }

    async fn run(&self, _claim: &()) -> Result<(), JobError> {
        let listing = self
            .adapter
            .discover()
            .await
            .map_err(|e| JobError::Invariant(e.to_string()))?;
        let now = (self.clock)();
        let summary = self.store.sync_discovered(now, listing).await?;
        let created = self
            .store
            .ensure_project_services(now, &self.service_types)
            .await?;
        self.metrics
            .discovery_runs
            .with_label_values(&["success"])
            .inc();
        if summary != Default::default() || created > 0 {
            info!(
                domains_created = summary.domains_created,
                projects_created = summary.projects_created,
                projects_marked_missing = summary.projects_marked_missing,
                projects_recovered = summary.projects_recovered,
                cursors_created = created,
                "discovery applied changes"
            );
        }
        Ok(())
    }

    async fn record_failure(&self, _claim: &(), _now: EpochMillis, error: &JobError) {
        self.metrics
            .discovery_runs
            .with_label_values(&["error"])
            .inc();
        warn!(error = %error, "discovery run failed; retrying at the next interval");
    }
}
