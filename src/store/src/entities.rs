// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The persisted entities.
//!
//! Rows are plain data. Everything that *interprets* a row lives elsewhere:
//! the distributor owns quota computation, the commitment module owns state
//! transitions, and the store merely guards the invariants a relational
//! schema would (identity, referential integrity, version counters).

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use limes_ore::now::EpochMillis;
use limes_repr::{
    AvailabilityZone, BackendQuota, DomainUuid, HistoricalUsage, ProjectUuid, ResourceName,
    ServiceType, Topology, Unit,
};

macro_rules! id_type {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
            Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type! {
    /// Identifies a [`Domain`].
    DomainId
}
id_type! {
    /// Identifies a [`Project`].
    ProjectId
}
id_type! {
    /// Identifies a [`ProjectService`].
    ProjectServiceId
}
id_type! {
    /// Identifies a [`ProjectResource`].
    ProjectResourceId
}
id_type! {
    /// Identifies a [`ProjectAzResource`].
    ProjectAzResourceId
}
id_type! {
    /// Identifies a [`Commitment`].
    CommitmentId
}

/// A mirror of an identity domain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    /// The row identity.
    pub id: DomainId,
    /// The identity provider's stable identifier.
    pub uuid: DomainUuid,
    /// The display name.
    pub name: String,
}

/// A mirror of an identity project.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// The row identity.
    pub id: ProjectId,
    /// The owning domain.
    pub domain_id: DomainId,
    /// The identity provider's stable identifier.
    pub uuid: ProjectUuid,
    /// The display name.
    pub name: String,
    /// The parent project, if nested.
    pub parent_uuid: Option<ProjectUuid>,
    /// When discovery first noticed the project missing from the identity
    /// provider. Cleared when the project reappears; once it exceeds the
    /// grace period, the cleanup sweep deletes the project.
    pub missing_since: Option<EpochMillis>,
}

/// One backend service type known to the cluster. Doubles as the capacity
/// scrape cursor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Service {
    /// The service type.
    pub service_type: ServiceType,
    /// The version of the service info on file.
    pub liquid_version: u64,
    /// When capacity was last scraped successfully.
    pub scraped_at: Option<EpochMillis>,
    /// When the next capacity scrape is due.
    pub next_scrape_at: EpochMillis,
    /// When a worker claimed this cursor, if a scrape is in flight.
    pub checked_at: Option<EpochMillis>,
    /// The most recent scrape error, if the last scrape failed.
    pub scrape_error: Option<String>,
    /// Consecutive failed scrapes, for backoff.
    pub consecutive_errors: u32,
    /// When the distributor should next recompute this service, if fresh
    /// capacity or demand has arrived. Debounces bursts of changes.
    pub next_distribution_at: Option<EpochMillis>,
}

/// An error recorded for operator visibility.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordedError {
    /// When the error occurred.
    pub at: EpochMillis,
    /// The rendered error.
    pub message: String,
}

/// How many errors the per-cursor ring buffer retains.
pub const ERROR_RING_SIZE: usize = 8;

/// One (project, service) pair: the unit of scheduling for usage scrapes and
/// quota syncs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectService {
    /// The row identity.
    pub id: ProjectServiceId,
    /// The owning project.
    pub project_id: ProjectId,
    /// The service type.
    pub service_type: ServiceType,
    /// When usage was last scraped successfully.
    pub scraped_at: Option<EpochMillis>,
    /// When the next usage scrape is due.
    pub next_scrape_at: EpochMillis,
    /// When a worker claimed this cursor, if a scrape is in flight.
    pub checked_at: Option<EpochMillis>,
    /// The most recent scrape error, if the last scrape failed.
    pub scrape_error: Option<String>,
    /// Consecutive failed scrapes, for backoff.
    pub consecutive_errors: u32,
    /// Ring buffer of recent errors, newest last, at most
    /// [`ERROR_RING_SIZE`].
    pub recent_errors: Vec<RecordedError>,
    /// Whether the pair should be rescraped at the earliest opportunity,
    /// e.g. after an operator changed a quota.
    pub stale: bool,
    /// When drift between desired and backend quota was detected. Non-null
    /// marks the pair as due for quota sync.
    pub quota_desynced_at: Option<EpochMillis>,
    /// The earliest time the next quota sync attempt may run, for backoff.
    pub quota_sync_after: EpochMillis,
    /// Consecutive failed quota syncs, for backoff.
    pub quota_sync_errors: u32,
    /// Opaque adapter state carried between scrapes.
    pub serialized_state: Option<serde_json::Value>,
}

/// One resource of one (project, service) pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectResource {
    /// The row identity.
    pub id: ProjectResourceId,
    /// The owning pair.
    pub project_service_id: ProjectServiceId,
    /// The resource name.
    pub name: ResourceName,
    /// The unit, from the adapter's declaration.
    pub unit: Unit,
    /// The topology, from the adapter's declaration.
    pub topology: Topology,
    /// Whether capacity scans report this resource.
    pub has_capacity: bool,
    /// Whether the backend enforces a quota.
    pub has_quota: bool,
    /// The granted quota, in effective units. `None` iff `has_quota` is
    /// false or no grant has happened yet.
    pub quota: Option<u64>,
    /// The backend's quota as last observed by a usage scrape.
    pub backend_quota: Option<BackendQuota>,
    /// The quota the backend should enforce, as last computed.
    pub desired_backend_quota: Option<BackendQuota>,
    /// A floor reported by the backend when it clamped a quota update.
    pub min_quota_from_backend: Option<u64>,
    /// A cap set by the domain admin.
    pub max_quota_from_admin: Option<u64>,
    /// A cap imposed from outside the domain (e.g. cluster policy).
    pub max_quota_from_outside_admin: Option<u64>,
    /// An operator override that replaces the computed quota entirely.
    pub override_quota: Option<u64>,
    /// Whether the adapter has stopped declaring this resource. Stale rows
    /// are kept: their quota is the only authoritative record.
    pub stale: bool,
    /// Optimistic concurrency counter, bumped on every write.
    pub version: u64,
}

/// One availability zone of one project resource.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectAzResource {
    /// The row identity.
    pub id: ProjectAzResourceId,
    /// The owning resource.
    pub project_resource_id: ProjectResourceId,
    /// The availability zone.
    pub az: AvailabilityZone,
    /// Current usage.
    pub usage: u64,
    /// Physically used portion of the usage, if reported. At most `usage`.
    pub physical_usage: Option<u64>,
    /// Opaque subresource listing.
    pub subresources: Vec<serde_json::Value>,
    /// Compact history of usage samples.
    pub historical_usage: HistoricalUsage,
    /// The backend's per-AZ quota, for az-separated resources only.
    pub backend_quota: Option<BackendQuota>,
    /// The per-AZ quota the backend should enforce, for az-separated
    /// resources only.
    pub desired_backend_quota: Option<BackendQuota>,
}

/// Cluster-wide capacity of one resource in one availability zone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterAzResource {
    /// The service type.
    pub service_type: ServiceType,
    /// The resource name.
    pub resource: ResourceName,
    /// The availability zone.
    pub az: AvailabilityZone,
    /// Capacity in raw units, exactly as the adapter reported it.
    pub raw_capacity: u64,
    /// Usage as seen by the capacity scan, if reported.
    pub usage: Option<u64>,
    /// Opaque subcapacity breakdown.
    pub subcapacities: Vec<serde_json::Value>,
    /// When this row was last refreshed.
    pub scraped_at: EpochMillis,
}

/// The lifecycle state of a commitment.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum CommitmentState {
    /// Created with a future confirmation date; not yet eligible for
    /// confirmation.
    Planned,
    /// Awaiting capacity; the distributor confirms it when capacity allows.
    Pending,
    /// Capacity reserved ahead of the confirmation date (only for resources
    /// configured to guarantee early).
    Guaranteed,
    /// Active: the distributor honors it unconditionally until expiry.
    Confirmed,
    /// Replaced by a successor through transfer or split.
    Superseded,
    /// Lapsed, either unconfirmed past its confirmation window or past its
    /// expiry date.
    Expired,
}

impl CommitmentState {
    /// Reports whether commitments in this state reserve capacity.
    pub fn reserves_capacity(&self) -> bool {
        matches!(self, CommitmentState::Guaranteed | CommitmentState::Confirmed)
    }

    /// Reports whether this state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommitmentState::Superseded | CommitmentState::Expired)
    }
}

impl fmt::Display for CommitmentState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            CommitmentState::Planned => "planned",
            CommitmentState::Pending => "pending",
            CommitmentState::Guaranteed => "guaranteed",
            CommitmentState::Confirmed => "confirmed",
            CommitmentState::Superseded => "superseded",
            CommitmentState::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// A promise to reserve an amount of one resource in one availability zone
/// for one project, for a duration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Commitment {
    /// The row identity.
    pub id: CommitmentId,
    /// The externally visible identifier.
    pub uuid: Uuid,
    /// The (project, resource, AZ) the commitment binds to.
    pub az_resource_id: ProjectAzResourceId,
    /// The committed amount, in effective units.
    pub amount: u64,
    /// The commitment's lifetime once confirmed, in seconds.
    pub duration_secs: u64,
    /// When the commitment was requested.
    pub requested_at: EpochMillis,
    /// The date by which the commitment must be confirmed, if bounded.
    pub confirm_by: Option<EpochMillis>,
    /// When the commitment was confirmed.
    pub confirmed_at: Option<EpochMillis>,
    /// When the commitment lapses, set on confirmation.
    pub expires_at: Option<EpochMillis>,
    /// The lifecycle state.
    pub state: CommitmentState,
    /// The commitment this one superseded, for audit.
    pub predecessor_id: Option<CommitmentId>,
    /// The one-shot token that authorizes a transfer, if one is in flight.
    pub transfer_token: Option<Uuid>,
    /// Whether the requester asked to be notified on confirmation.
    pub notify_on_confirm: bool,
}
