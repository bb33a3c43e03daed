// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Cluster configuration.
//!
//! The configuration is operator-provided policy, deserialized once at
//! startup. Everything in here has a default except the set of services, so a
//! minimal configuration is just the service list with adapter endpoints.
//! Malformed configuration is fatal at startup and never at runtime.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::names::{AvailabilityZone, DomainUuid, ProjectUuid, ResourceName, ServiceType};
use crate::types::{DistributionModel, OvercommitFactor};

/// The top-level cluster configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// The services this cluster accounts for, keyed by service type.
    pub services: BTreeMap<ServiceType, ServiceConfig>,
    /// The cluster's availability zones, passed to adapters on every scan.
    #[serde(default)]
    pub availability_zones: Vec<AvailabilityZone>,
    /// Identity discovery settings.
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Loop cadences and worker counts.
    #[serde(default)]
    pub intervals: IntervalsConfig,
}

impl ClusterConfig {
    /// Returns the configuration for one resource, falling back to defaults
    /// for resources the operator did not mention.
    pub fn resource(&self, service: &ServiceType, resource: &ResourceName) -> ResourceConfig {
        self.services
            .get(service)
            .and_then(|s| s.resources.get(resource))
            .cloned()
            .unwrap_or_default()
    }
}

/// Per-service configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// The base URL of the service's liquid adapter. Absent for adapters
    /// registered in-process.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Per-resource policy overrides.
    #[serde(default)]
    pub resources: BTreeMap<ResourceName, ResourceConfig>,
}

/// Per-resource operator policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ResourceConfig {
    /// Multiplier from raw to effective capacity.
    pub overcommit_factor: OvercommitFactor,
    /// The distribution model for this resource.
    pub distribution_model: DistributionModel,
    /// Multiplier on current usage that yields the growth target under the
    /// autogrow model.
    pub growth_multiplier: f64,
    /// How leftover capacity after all demand tiers is distributed.
    pub balance: Balance,
    /// The quota given to a project the first time the resource is seen,
    /// before any distributor pass has run.
    pub initial_quota: Option<u64>,
    /// Headroom added on top of demand under the hierarchical model.
    pub headroom: u64,
    /// Whether the distributor needs the per-AZ demand signal from capacity
    /// scans for this resource.
    pub needs_demand_signal: bool,
    /// Whether commitments in the planned state already reserve capacity
    /// before their confirmation date arrives (moving them through the
    /// guaranteed state).
    pub guarantee_before_confirm: bool,
    /// How long a pending commitment may overstay its confirmation date
    /// before the cleanup sweep expires it, in seconds.
    pub confirmation_grace_secs: u64,
    /// Retention for the historical usage series, in seconds.
    pub usage_retention_secs: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        ResourceConfig {
            overcommit_factor: OvercommitFactor::default(),
            distribution_model: DistributionModel::default(),
            growth_multiplier: 1.0,
            balance: Balance::default(),
            initial_quota: None,
            headroom: 0,
            needs_demand_signal: false,
            guarantee_before_confirm: false,
            confirmation_grace_secs: 3_600,
            usage_retention_secs: 14 * 24 * 3_600,
        }
    }
}

impl ResourceConfig {
    /// See [`ResourceConfig::confirmation_grace_secs`].
    pub fn confirmation_grace(&self) -> Duration {
        Duration::from_secs(self.confirmation_grace_secs)
    }

    /// See [`ResourceConfig::usage_retention_secs`].
    pub fn usage_retention(&self) -> Duration {
        Duration::from_secs(self.usage_retention_secs)
    }
}

/// How leftover capacity after all demand tiers is distributed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Balance {
    /// Water-fill leftover capacity toward equal per-project holdings.
    #[default]
    Equalize,
    /// Leave leftover capacity unallocated.
    Retain,
}

/// Identity discovery settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DiscoveryConfig {
    /// How long a project may be absent from the identity provider before
    /// its records are deleted, in seconds.
    pub grace_period_secs: u64,
    /// A static domain/project listing, for deployments without a live
    /// identity provider and for tests.
    pub static_domains: Vec<StaticDomain>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            grace_period_secs: 48 * 3_600,
            static_domains: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    /// See [`DiscoveryConfig::grace_period_secs`].
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// A statically configured domain.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticDomain {
    /// The domain's stable identifier.
    pub uuid: DomainUuid,
    /// The domain's display name.
    pub name: String,
    /// The projects within the domain.
    #[serde(default)]
    pub projects: Vec<StaticProject>,
}

/// A statically configured project.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticProject {
    /// The project's stable identifier.
    pub uuid: ProjectUuid,
    /// The project's display name.
    pub name: String,
    /// The parent project, if nested.
    #[serde(default)]
    pub parent_uuid: Option<ProjectUuid>,
}

/// Loop cadences and worker counts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IntervalsConfig {
    /// Seconds between usage scrapes of one (project, service) pair.
    pub scrape_secs: u64,
    /// Seconds between capacity scrapes of one service.
    pub capacity_secs: u64,
    /// Seconds between discovery runs.
    pub discovery_secs: u64,
    /// Seconds between consistency sweeps.
    pub cleanup_secs: u64,
    /// Seconds the distributor waits after fresh capacity or demand before
    /// recomputing, coalescing bursts of changes.
    pub distribution_debounce_secs: u64,
    /// Base for the exponential backoff applied to failing cursors, in
    /// seconds. The backoff is capped at the cursor's success interval.
    pub error_backoff_secs: u64,
    /// Upper bound on any single task execution, in seconds.
    pub max_runtime_secs: u64,
    /// Workers per job kind.
    pub scrape_workers: usize,
    /// Workers for quota sync.
    pub quota_sync_workers: usize,
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        IntervalsConfig {
            scrape_secs: 30 * 60,
            capacity_secs: 15 * 60,
            discovery_secs: 3 * 60,
            cleanup_secs: 60,
            distribution_debounce_secs: 15,
            error_backoff_secs: 5 * 60,
            max_runtime_secs: 4 * 60,
            scrape_workers: 4,
            quota_sync_workers: 2,
        }
    }
}

impl IntervalsConfig {
    /// See [`IntervalsConfig::scrape_secs`].
    pub fn scrape_interval(&self) -> Duration {
        Duration::from_secs(self.scrape_secs)
    }

    /// See [`IntervalsConfig::capacity_secs`].
    pub fn capacity_interval(&self) -> Duration {
        Duration::from_secs(self.capacity_secs)
    }

    /// See [`IntervalsConfig::discovery_secs`].
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_secs)
    }

    /// See [`IntervalsConfig::cleanup_secs`].
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_secs)
    }

    /// See [`IntervalsConfig::distribution_debounce_secs`].
    pub fn distribution_debounce(&self) -> Duration {
        Duration::from_secs(self.distribution_debounce_secs)
    }

    /// See [`IntervalsConfig::error_backoff_secs`].
    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    /// See [`IntervalsConfig::max_runtime_secs`].
    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime_secs)
    }
}

#[cfg(test)]
mod tests {
    use crate::types::DistributionModel;

    use super::ClusterConfig;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config: ClusterConfig = serde_json::from_str(
            r#"{
                "services": {
                    "object-store": {
                        "endpoint": "http://liquid-object-store:8080",
                        "resources": {
                            "capacity": {"growth_multiplier": 1.25}
                        }
                    }
                }
            }"#,
        )
        .expect("valid config");

        let service = "object-store".into();
        let resource = config.resource(&service, &"capacity".into());
        assert_eq!(resource.growth_multiplier, 1.25);
        assert_eq!(resource.distribution_model, DistributionModel::Autogrow);
        assert!(resource.overcommit_factor.is_identity());

        // Unmentioned resources fall back to defaults entirely.
        let other = config.resource(&service, &"other".into());
        assert_eq!(other.growth_multiplier, 1.0);
        assert_eq!(config.intervals.scrape_workers, 4);
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let result = serde_json::from_str::<ClusterConfig>(r#"{"servcies": {}}"#);
        assert!(result.is_err());
    }
}
