// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The core quota accounting vocabulary.
//!
//! This crate defines the value types every other crate in the workspace
//! speaks: service, resource and availability zone names, units, topology and
//! distribution models, the overcommit factor with its raw/effective split,
//! the backend quota option type, the historical usage series, and the
//! cluster configuration.
//!
//! One rule governs the whole crate: sentinel values live only on the wire.
//! A backend quota of `-1` becomes [`BackendQuota::Unlimited`] the moment it
//! crosses into memory, and absent values are `Option`s, never magic numbers.

pub mod config;
pub mod names;
pub mod series;
pub mod types;

pub use config::{
    Balance, ClusterConfig, DiscoveryConfig, IntervalsConfig, ResourceConfig, ServiceConfig,
};
pub use names::{AvailabilityZone, DomainUuid, ProjectUuid, ResourceName, ServiceType};
pub use series::HistoricalUsage;
pub use types::{BackendQuota, DistributionModel, OvercommitFactor, Topology, Unit};
