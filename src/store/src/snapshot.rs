// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The distribution snapshot.
//!
//! The distributor never reads live rows: it asks the store for one
//! consistent, immutable projection of everything a pass needs, computes on
//! it, and writes back under optimistic version checks. The snapshot is the
//! only data the distributor sees, which makes its computation a pure
//! function and keeps the C5/C8 race confined to the version check.

use std::collections::BTreeMap;

use limes_ore::now::EpochMillis;
use limes_repr::{AvailabilityZone, ProjectUuid, ResourceName, ServiceType, Topology};

use crate::entities::{
    CommitmentId, CommitmentState, ProjectAzResourceId, ProjectId, ProjectResourceId,
};

/// A consistent view of one service for a distributor pass.
#[derive(Clone, Debug, PartialEq)]
pub struct DistributionSnapshot {
    /// The service this snapshot covers.
    pub service_type: ServiceType,
    /// When the snapshot was taken.
    pub taken_at: EpochMillis,
    /// Per-resource data.
    pub resources: BTreeMap<ResourceName, ResourceDistributionData>,
}

/// Everything a distributor pass needs for one resource.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceDistributionData {
    /// The resource's topology.
    pub topology: Topology,
    /// Whether the backend enforces a quota; resources without quota carry
    /// usage for demand aggregation but receive no distribution.
    pub has_quota: bool,
    /// Cluster capacity per availability zone, in raw units.
    pub capacity: BTreeMap<AvailabilityZone, u64>,
    /// Per-project demand.
    pub projects: Vec<ProjectDistributionData>,
}

/// One project's demand for one resource.
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectDistributionData {
    /// The project row.
    pub project_id: ProjectId,
    /// The project's stable identifier; the deterministic tie-break key.
    pub project_uuid: ProjectUuid,
    /// The resource row the result will be written to.
    pub resource_id: ProjectResourceId,
    /// The resource row's version at snapshot time.
    pub version: u64,
    /// A floor reported by the backend.
    pub min_quota_from_backend: Option<u64>,
    /// A cap set by the domain admin.
    pub max_quota_from_admin: Option<u64>,
    /// A cap imposed from outside the domain.
    pub max_quota_from_outside_admin: Option<u64>,
    /// An operator override replacing the computed quota.
    pub override_quota: Option<u64>,
    /// Per-AZ demand.
    pub per_az: BTreeMap<AvailabilityZone, AzDistributionData>,
}

/// One project's demand for one resource in one availability zone.
#[derive(Clone, Debug, PartialEq)]
pub struct AzDistributionData {
    /// The AZ row the per-AZ result will be written to.
    pub az_resource_id: ProjectAzResourceId,
    /// Current usage.
    pub usage: u64,
    /// Commitments bound to this AZ row, all non-terminal states.
    pub commitments: Vec<CommitmentDemand>,
}

/// A commitment as the distributor sees it.
#[derive(Clone, Debug, PartialEq)]
pub struct CommitmentDemand {
    /// The commitment row.
    pub id: CommitmentId,
    /// The lifecycle state at snapshot time.
    pub state: CommitmentState,
    /// The committed amount.
    pub amount: u64,
    /// The commitment's lifetime once confirmed, in seconds.
    pub duration_secs: u64,
    /// The confirmation deadline, if bounded.
    pub confirm_by: Option<EpochMillis>,
    /// When the commitment was requested; the confirmation order.
    pub requested_at: EpochMillis,
}
