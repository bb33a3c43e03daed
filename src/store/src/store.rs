// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The store contract.
//!
//! Every method is one transaction: it either applies completely or leaves
//! no trace. The claim methods additionally guarantee mutual exclusion: a
//! cursor returned to one caller is stamped in the same transaction, so no
//! concurrent call returns the same cursor until it is finished or the
//! cleanup sweep releases it.
//!
//! Transient failures surface as [`StoreError`]; the store never retries
//! silently.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use limes_ore::now::EpochMillis;
use limes_repr::{
    AvailabilityZone, BackendQuota, DomainUuid, ProjectUuid, ResourceName, ServiceType, Topology,
    Unit,
};

use crate::entities::{
    Commitment, CommitmentId, CommitmentState, ClusterAzResource, Domain, Project,
    ProjectAzResource, ProjectAzResourceId, ProjectResource, ProjectResourceId, ProjectService,
    ProjectServiceId, Service,
};
use crate::snapshot::DistributionSnapshot;

/// An error from a store operation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The addressed row does not exist.
    #[error("row not found: {0}")]
    NotFound(String),
    /// An optimistic concurrency check failed; the caller should re-read and
    /// retry.
    #[error("concurrent modification: {0}")]
    Conflict(String),
    /// The write would violate an integrity constraint.
    #[error("constraint violated: {0}")]
    Constraint(String),
    /// The store backend failed transiently; the unit of work was rolled
    /// back and may be retried on the next cycle.
    #[error("transient store failure: {0}")]
    Transient(String),
}

/// A domain as reported by identity discovery.
#[derive(Clone, Debug, PartialEq)]
pub struct DiscoveredDomain {
    /// The domain's stable identifier.
    pub uuid: DomainUuid,
    /// The display name.
    pub name: String,
    /// The projects within the domain.
    pub projects: Vec<DiscoveredProject>,
}

/// A project as reported by identity discovery.
#[derive(Clone, Debug, PartialEq)]
pub struct DiscoveredProject {
    /// The project's stable identifier.
    pub uuid: ProjectUuid,
    /// The display name.
    pub name: String,
    /// The parent project, if nested.
    pub parent_uuid: Option<ProjectUuid>,
}

/// What one discovery pass changed.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DiscoverySummary {
    /// Domains created.
    pub domains_created: u64,
    /// Projects created.
    pub projects_created: u64,
    /// Projects newly marked as missing from identity.
    pub projects_marked_missing: u64,
    /// Previously missing projects that reappeared.
    pub projects_recovered: u64,
}

/// A claimed usage scrape cursor, with the context the scrape needs.
#[derive(Clone, Debug, PartialEq)]
pub struct ScrapeClaim {
    /// The claimed cursor.
    pub project_service: ProjectService,
    /// The owning project.
    pub project: Project,
    /// The owning domain's identifier.
    pub domain_uuid: DomainUuid,
}

/// A claimed quota sync cursor, with everything the sync request needs.
#[derive(Clone, Debug, PartialEq)]
pub struct QuotaSyncClaim {
    /// The claimed cursor.
    pub project_service: ProjectService,
    /// The owning project.
    pub project: Project,
    /// The owning domain's identifier.
    pub domain_uuid: DomainUuid,
    /// The pair's resource rows.
    pub resources: Vec<ProjectResource>,
    /// The pair's AZ rows, for az-separated quotas.
    pub az_resources: Vec<ProjectAzResource>,
}

/// A resource as declared by the adapter's current service info, plus the
/// operator's initial quota for first sight.
#[derive(Clone, Debug, PartialEq)]
pub struct DeclaredResource {
    /// The resource name.
    pub name: ResourceName,
    /// The declared unit.
    pub unit: Unit,
    /// The declared topology.
    pub topology: Topology,
    /// Whether capacity scans report this resource.
    pub has_capacity: bool,
    /// Whether the backend enforces a quota.
    pub has_quota: bool,
    /// The quota to grant when the resource is first seen.
    pub initial_quota: Option<u64>,
}

/// One resource's values from a usage scan, already translated off the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct ObservedResource {
    /// The resource name.
    pub name: ResourceName,
    /// The backend's project-level quota, if the backend enforces one.
    pub backend_quota: Option<BackendQuota>,
    /// Per-AZ observations.
    pub per_az: Vec<ObservedAz>,
}

/// One availability zone's values from a usage scan.
#[derive(Clone, Debug, PartialEq)]
pub struct ObservedAz {
    /// The availability zone.
    pub az: AvailabilityZone,
    /// Current usage.
    pub usage: u64,
    /// Physically used portion, if reported.
    pub physical_usage: Option<u64>,
    /// Opaque subresource listing.
    pub subresources: Vec<serde_json::Value>,
    /// The backend's per-AZ quota, for az-separated resources.
    pub backend_quota: Option<BackendQuota>,
}

/// The complete outcome of one successful usage scrape, applied in one
/// transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct UsageScrapeCommit {
    /// The cursor being completed.
    pub project_service_id: ProjectServiceId,
    /// The current time.
    pub now: EpochMillis,
    /// When the next scrape is due.
    pub next_scrape_at: EpochMillis,
    /// The adapter's current resource declarations. Rows for resources not
    /// listed here are marked stale, never deleted.
    pub declared: Vec<DeclaredResource>,
    /// The scan's observations.
    pub observed: Vec<ObservedResource>,
    /// Opaque adapter state for the next scan.
    pub serialized_state: Option<serde_json::Value>,
    /// Retention for the historical usage series.
    pub retention: Duration,
    /// When the distributor should recompute this service, given that demand
    /// may have changed.
    pub distribution_due_at: EpochMillis,
}

/// One resource's values from a capacity scan.
#[derive(Clone, Debug, PartialEq)]
pub struct ObservedClusterResource {
    /// The resource name.
    pub name: ResourceName,
    /// Per-AZ capacity in raw units, with optional usage and subcapacities.
    pub per_az: Vec<ObservedClusterAz>,
}

/// One availability zone's values from a capacity scan.
#[derive(Clone, Debug, PartialEq)]
pub struct ObservedClusterAz {
    /// The availability zone.
    pub az: AvailabilityZone,
    /// Capacity in raw units.
    pub raw_capacity: u64,
    /// Usage as seen by the capacity scan, if reported.
    pub usage: Option<u64>,
    /// Opaque subcapacity breakdown.
    pub subcapacities: Vec<serde_json::Value>,
}

/// The complete outcome of one successful capacity scrape.
#[derive(Clone, Debug, PartialEq)]
pub struct CapacityScrapeCommit {
    /// The service being completed.
    pub service_type: ServiceType,
    /// The current time.
    pub now: EpochMillis,
    /// When the next capacity scrape is due.
    pub next_scrape_at: EpochMillis,
    /// The scan's observations. Rows for (resource, AZ) pairs not listed
    /// here are removed; the scan is authoritative for capacity.
    pub resources: Vec<ObservedClusterResource>,
    /// When the distributor should recompute this service.
    pub distribution_due_at: EpochMillis,
}

/// Aggregate demand for one resource in one availability zone, used to build
/// capacity scan requests.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AggregateDemand {
    /// Total usage across all projects.
    pub usage: u64,
    /// Total confirmed-but-unused commitments.
    pub unused_commitments: u64,
    /// Total commitments awaiting confirmation.
    pub pending_commitments: u64,
}

/// One project resource's new quota from a distributor pass.
#[derive(Clone, Debug, PartialEq)]
pub struct QuotaWrite {
    /// The resource row to write.
    pub resource_id: ProjectResourceId,
    /// The version the computation was based on; mismatch aborts the whole
    /// pass with [`StoreError::Conflict`].
    pub expected_version: u64,
    /// The granted quota, in effective units.
    pub quota: u64,
    /// The quota the backend should enforce.
    pub desired_backend_quota: BackendQuota,
    /// Per-AZ desired quotas, for az-separated resources.
    pub per_az: Vec<(ProjectAzResourceId, BackendQuota)>,
}

/// A commitment state change from a distributor pass or a cleanup sweep.
#[derive(Clone, Debug, PartialEq)]
pub struct CommitmentWrite {
    /// The commitment to transition.
    pub id: CommitmentId,
    /// The state the transition was computed from; mismatch aborts with
    /// [`StoreError::Conflict`].
    pub expected_state: CommitmentState,
    /// The new state.
    pub new_state: CommitmentState,
    /// The confirmation timestamp to record, if the transition confirms.
    pub confirmed_at: Option<EpochMillis>,
    /// The expiry to record, if the transition confirms.
    pub expires_at: Option<EpochMillis>,
}

/// The complete outcome of one distributor pass, applied in one transaction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DistributionOutcome {
    /// The current time.
    pub now: EpochMillis,
    /// Quota writes, one per (project, resource).
    pub quota_writes: Vec<QuotaWrite>,
    /// Commitment transitions decided by the pass.
    pub commitment_writes: Vec<CommitmentWrite>,
}

/// A new commitment row.
#[derive(Clone, Debug, PartialEq)]
pub struct NewCommitment {
    /// The (project, resource, AZ) row the commitment binds to.
    pub az_resource_id: ProjectAzResourceId,
    /// The committed amount, in effective units.
    pub amount: u64,
    /// The commitment's lifetime once confirmed, in seconds.
    pub duration_secs: u64,
    /// When the commitment was requested.
    pub requested_at: EpochMillis,
    /// The confirmation deadline, if bounded.
    pub confirm_by: Option<EpochMillis>,
    /// The initial state; must be `Planned` or `Pending`.
    pub initial_state: CommitmentState,
    /// Whether the requester asked to be notified on confirmation.
    pub notify_on_confirm: bool,
}

/// A commitment joined with the context needed to interpret it.
#[derive(Clone, Debug, PartialEq)]
pub struct CommitmentRecord {
    /// The commitment row.
    pub commitment: Commitment,
    /// The service the committed resource belongs to.
    pub service_type: ServiceType,
    /// The committed resource.
    pub resource: ResourceName,
    /// The committed availability zone.
    pub az: AvailabilityZone,
    /// The owning project.
    pub project_uuid: ProjectUuid,
}

/// The context of one (project, resource, AZ) row, for commitment reviews.
#[derive(Clone, Debug, PartialEq)]
pub struct AzResourceContext {
    /// The service the resource belongs to.
    pub service_type: ServiceType,
    /// The resource name.
    pub resource: ResourceName,
    /// The availability zone.
    pub az: AvailabilityZone,
    /// The owning project.
    pub project_uuid: ProjectUuid,
    /// The total of capacity-reserving commitments currently bound to the
    /// row.
    pub committed_total: u64,
}

/// A per-project resource value for the data metrics endpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectResourceMetric {
    /// The owning domain.
    pub domain_uuid: DomainUuid,
    /// The owning project.
    pub project_uuid: ProjectUuid,
    /// The service type.
    pub service_type: ServiceType,
    /// The resource name.
    pub resource: ResourceName,
    /// The granted quota, if any.
    pub quota: Option<u64>,
    /// Usage summed over availability zones.
    pub usage: u64,
}

/// The persistence contract of the core.
///
/// See the [module documentation](self) for the transactional guarantees.
#[async_trait]
pub trait Store: Send + Sync {
    // ---------------------------------------------------------------- C4/C10

    /// Reconciles the domain and project mirror against one discovery
    /// result: creates missing records, marks vanished projects, recovers
    /// reappeared ones. Vanished projects are only deleted by
    /// [`Store::purge_missing_projects`] once the grace period elapses.
    async fn sync_discovered(
        &self,
        now: EpochMillis,
        discovered: Vec<DiscoveredDomain>,
    ) -> Result<DiscoverySummary, StoreError>;

    /// Creates a missing [`ProjectService`] row for every (project,
    /// configured service) pair, due immediately. Returns how many were
    /// created.
    async fn ensure_project_services(
        &self,
        now: EpochMillis,
        service_types: &[ServiceType],
    ) -> Result<u64, StoreError>;

    /// Creates or updates the [`Service`] row for a service type, recording
    /// the current service info version.
    async fn ensure_service(
        &self,
        now: EpochMillis,
        service_type: ServiceType,
        liquid_version: u64,
    ) -> Result<(), StoreError>;

    /// Deletes projects that have been missing from identity for longer
    /// than `grace`, cascading to all owned rows. Returns how many projects
    /// were deleted.
    async fn purge_missing_projects(
        &self,
        now: EpochMillis,
        grace: Duration,
    ) -> Result<u64, StoreError>;

    /// Releases claims whose `checked_at` is older than `older_than`,
    /// making their cursors claimable again. Returns how many were released.
    async fn release_stuck_claims(
        &self,
        now: EpochMillis,
        older_than: Duration,
    ) -> Result<u64, StoreError>;

    // ------------------------------------------------------------------- C5

    /// Claims the longest-overdue usage scrape cursor, stamping
    /// `checked_at` atomically. Returns `None` when nothing is due.
    async fn claim_due_scrape(&self, now: EpochMillis)
        -> Result<Option<ScrapeClaim>, StoreError>;

    /// Applies one successful usage scrape: reconciles resource rows against
    /// the declaration, writes observations and history, detects quota
    /// drift, stores serialized state, and advances the cursor.
    async fn commit_usage_scrape(&self, commit: UsageScrapeCommit) -> Result<(), StoreError>;

    /// Records one failed usage scrape: stamps the error, grows the error
    /// ring, bumps the consecutive-error counter, and advances the cursor to
    /// `next_scrape_at`. Resource rows are untouched.
    async fn record_scrape_error(
        &self,
        project_service_id: ProjectServiceId,
        now: EpochMillis,
        message: String,
        next_scrape_at: EpochMillis,
    ) -> Result<(), StoreError>;

    // ------------------------------------------------------------------- C6

    /// Claims the longest-overdue capacity scrape cursor.
    async fn claim_due_capacity(&self, now: EpochMillis) -> Result<Option<Service>, StoreError>;

    /// Applies one successful capacity scrape, replacing the service's
    /// cluster capacity image.
    async fn commit_capacity_scrape(
        &self,
        commit: CapacityScrapeCommit,
    ) -> Result<(), StoreError>;

    /// Records one failed capacity scrape and advances the cursor.
    async fn record_capacity_error(
        &self,
        service_type: ServiceType,
        now: EpochMillis,
        message: String,
        next_scrape_at: EpochMillis,
    ) -> Result<(), StoreError>;

    /// Sums current demand over all projects of a service, per resource and
    /// availability zone.
    async fn aggregate_demand(
        &self,
        service_type: &ServiceType,
        resources: &[ResourceName],
    ) -> Result<BTreeMap<ResourceName, BTreeMap<AvailabilityZone, AggregateDemand>>, StoreError>;

    // ------------------------------------------------------------------- C7

    /// Claims the longest-desynced quota sync cursor: a pair with
    /// `quota_desynced_at` set whose backoff window has passed.
    async fn claim_desynced(
        &self,
        now: EpochMillis,
    ) -> Result<Option<QuotaSyncClaim>, StoreError>;

    /// Applies one successful quota sync: `backend_quota` becomes
    /// `desired_backend_quota` on every quota-bearing row, backend floors
    /// are recorded, and the desync marker is cleared.
    async fn complete_quota_sync(
        &self,
        project_service_id: ProjectServiceId,
        now: EpochMillis,
        floors: BTreeMap<ResourceName, u64>,
    ) -> Result<(), StoreError>;

    /// Records one failed quota sync. The desync marker stays set; the next
    /// attempt is gated on `retry_at`.
    async fn record_quota_sync_error(
        &self,
        project_service_id: ProjectServiceId,
        now: EpochMillis,
        message: String,
        retry_at: EpochMillis,
    ) -> Result<(), StoreError>;

    // ------------------------------------------------------------------- C8

    /// Claims the next service due for a distributor pass.
    async fn claim_due_distribution(
        &self,
        now: EpochMillis,
    ) -> Result<Option<ServiceType>, StoreError>;

    /// Requests a distributor pass for a service no later than `at`,
    /// coalescing with any earlier request.
    async fn schedule_distribution(
        &self,
        service_type: ServiceType,
        at: EpochMillis,
    ) -> Result<(), StoreError>;

    /// Produces a consistent snapshot of one service for a distributor pass.
    async fn distribution_snapshot(
        &self,
        service_type: &ServiceType,
        now: EpochMillis,
    ) -> Result<DistributionSnapshot, StoreError>;

    /// Applies a distributor pass. Fails with [`StoreError::Conflict`],
    /// without applying anything, if any touched resource row's version or
    /// commitment's state changed since the snapshot.
    async fn apply_distribution(&self, outcome: DistributionOutcome) -> Result<(), StoreError>;

    // ------------------------------------------------------------------- C9

    /// Returns the context of one (project, resource, AZ) row.
    async fn az_resource_context(
        &self,
        id: ProjectAzResourceId,
    ) -> Result<AzResourceContext, StoreError>;

    /// Creates a commitment in its initial state.
    async fn create_commitment(&self, new: NewCommitment) -> Result<Commitment, StoreError>;

    /// Returns one commitment with context.
    async fn get_commitment(&self, id: CommitmentId) -> Result<CommitmentRecord, StoreError>;

    /// Returns all commitments with context.
    async fn list_commitments(&self) -> Result<Vec<CommitmentRecord>, StoreError>;

    /// Applies one commitment state transition under an optimistic state
    /// check.
    async fn persist_commitment_transition(
        &self,
        write: CommitmentWrite,
    ) -> Result<Commitment, StoreError>;

    /// Stores or clears a transfer token on a confirmed commitment.
    async fn set_transfer_token(
        &self,
        id: CommitmentId,
        token: Option<Uuid>,
    ) -> Result<(), StoreError>;

    /// Atomically consumes a transfer token: the matching confirmed
    /// commitment is superseded and a successor bound to `dest` is created
    /// with the same amount and expiry. Returns the successor.
    async fn accept_transfer(
        &self,
        token: Uuid,
        dest: ProjectAzResourceId,
        now: EpochMillis,
    ) -> Result<Commitment, StoreError>;

    /// Deletes a commitment that is still in the planned state.
    async fn delete_planned_commitment(&self, id: CommitmentId) -> Result<(), StoreError>;

    /// Returns commitments whose timers have lapsed: non-terminal states
    /// past `confirm_by`, and confirmed states past `expires_at`.
    async fn list_lapsed_commitments(
        &self,
        now: EpochMillis,
    ) -> Result<Vec<CommitmentRecord>, StoreError>;

    // ------------------------------------------------- inspection & metrics

    /// Returns all service rows.
    async fn services(&self) -> Result<Vec<Service>, StoreError>;

    /// Returns all domains.
    async fn domains(&self) -> Result<Vec<Domain>, StoreError>;

    /// Returns all projects.
    async fn projects(&self) -> Result<Vec<Project>, StoreError>;

    /// Returns all (project, service) pairs.
    async fn project_services(&self) -> Result<Vec<ProjectService>, StoreError>;

    /// Returns the resource rows of one pair.
    async fn project_resources(
        &self,
        project_service_id: ProjectServiceId,
    ) -> Result<Vec<ProjectResource>, StoreError>;

    /// Returns the AZ rows of one resource.
    async fn az_resources(
        &self,
        project_resource_id: ProjectResourceId,
    ) -> Result<Vec<ProjectAzResource>, StoreError>;

    /// Returns the cluster capacity image of one service.
    async fn cluster_az_resources(
        &self,
        service_type: &ServiceType,
    ) -> Result<Vec<ClusterAzResource>, StoreError>;

    /// Counts commitments per service and state.
    async fn commitment_state_counts(
        &self,
    ) -> Result<BTreeMap<(ServiceType, CommitmentState), u64>, StoreError>;

    /// Returns the age of the oldest successful scrape per service, for the
    /// staleness gauge. Pairs that have never been scraped count from their
    /// creation.
    async fn oldest_scrape_ages(
        &self,
        now: EpochMillis,
    ) -> Result<BTreeMap<ServiceType, Duration>, StoreError>;

    /// Returns per-project resource values for the data metrics endpoint.
    async fn data_metrics(&self) -> Result<Vec<ProjectResourceMetric>, StoreError>;

    // ------------------------------------------------- operator stand-ins

    /// Writes an operator-granted quota together with the desired backend
    /// quota derived from it, setting the drift marker if the backend
    /// disagrees. This is the API layer's write path into the core.
    async fn set_quota_by_operator(
        &self,
        resource_id: ProjectResourceId,
        quota: u64,
        desired_backend_quota: BackendQuota,
        now: EpochMillis,
    ) -> Result<(), StoreError>;
}
