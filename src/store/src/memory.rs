// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The in-memory store.
//!
//! Used by tests and single-process deployments. Transactionality is the
//! cheapest possible kind: every write runs against a clone of the state and
//! the clone is swapped in only on success, so any error path rolls back by
//! construction.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use limes_ore::now::EpochMillis;
use limes_repr::{AvailabilityZone, BackendQuota, ResourceName, ServiceType, Topology};

use crate::entities::{
    Commitment, CommitmentId, CommitmentState, ClusterAzResource, Domain, DomainId, Project,
    ProjectAzResource, ProjectAzResourceId, ProjectId, ProjectResource, ProjectResourceId,
    ProjectService, ProjectServiceId, RecordedError, Service, ERROR_RING_SIZE,
};
use crate::snapshot::{
    AzDistributionData, CommitmentDemand, DistributionSnapshot, ProjectDistributionData,
    ResourceDistributionData,
};
use crate::store::{
    AggregateDemand, AzResourceContext, CapacityScrapeCommit, CommitmentRecord, CommitmentWrite,
    DiscoveredDomain, DiscoverySummary, DistributionOutcome, NewCommitment,
    ProjectResourceMetric, QuotaSyncClaim, ScrapeClaim, Store, StoreError, UsageScrapeCommit,
};

#[derive(Clone, Debug, Default)]
struct State {
    next_id: u64,
    domains: BTreeMap<DomainId, Domain>,
    projects: BTreeMap<ProjectId, Project>,
    services: BTreeMap<ServiceType, Service>,
    project_services: BTreeMap<ProjectServiceId, ProjectService>,
    project_resources: BTreeMap<ProjectResourceId, ProjectResource>,
    az_resources: BTreeMap<ProjectAzResourceId, ProjectAzResource>,
    cluster_az: BTreeMap<(ServiceType, ResourceName, AvailabilityZone), ClusterAzResource>,
    commitments: BTreeMap<CommitmentId, Commitment>,
}

impl State {
    fn alloc(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn project_service(
        &mut self,
        id: ProjectServiceId,
    ) -> Result<&mut ProjectService, StoreError> {
        self.project_services
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("project service {id}")))
    }

    fn resource_rows_of(&self, ps: ProjectServiceId) -> Vec<ProjectResourceId> {
        self.project_resources
            .values()
            .filter(|r| r.project_service_id == ps)
            .map(|r| r.id)
            .collect()
    }

    fn az_rows_of(&self, resource: ProjectResourceId) -> Vec<ProjectAzResourceId> {
        self.az_resources
            .values()
            .filter(|a| a.project_resource_id == resource)
            .map(|a| a.id)
            .collect()
    }

    /// Recomputes the drift marker of one pair from its quota-bearing rows.
    ///
    /// The marker keeps its original timestamp while drift persists, so the
    /// metric "time since desync" stays meaningful across scrapes.
    fn recompute_desync(&mut self, ps_id: ProjectServiceId, now: EpochMillis) {
        let mut drifted = false;
        for rid in self.resource_rows_of(ps_id) {
            let resource = &self.project_resources[&rid];
            if !resource.has_quota || resource.stale {
                continue;
            }
            match (&resource.desired_backend_quota, &resource.backend_quota) {
                (Some(desired), Some(backend)) if desired != backend => drifted = true,
                (Some(_), None) => drifted = true,
                _ => {}
            }
            if resource.topology == Topology::AzSeparated {
                for aid in self.az_rows_of(rid) {
                    let az = &self.az_resources[&aid];
                    match (&az.desired_backend_quota, &az.backend_quota) {
                        (Some(desired), Some(backend)) if desired != backend => drifted = true,
                        (Some(_), None) => drifted = true,
                        _ => {}
                    }
                }
            }
        }
        let ps = self
            .project_services
            .get_mut(&ps_id)
            .expect("caller verified the pair exists");
        if drifted {
            ps.quota_desynced_at.get_or_insert(now);
        } else {
            ps.quota_desynced_at = None;
            ps.quota_sync_errors = 0;
        }
    }

    fn commitment_record(&self, commitment: &Commitment) -> Result<CommitmentRecord, StoreError> {
        let az = self
            .az_resources
            .get(&commitment.az_resource_id)
            .ok_or_else(|| {
                StoreError::NotFound(format!("az resource {}", commitment.az_resource_id))
            })?;
        let resource = self
            .project_resources
            .get(&az.project_resource_id)
            .ok_or_else(|| {
                StoreError::NotFound(format!("project resource {}", az.project_resource_id))
            })?;
        let ps = self
            .project_services
            .get(&resource.project_service_id)
            .ok_or_else(|| {
                StoreError::NotFound(format!("project service {}", resource.project_service_id))
            })?;
        let project = self
            .projects
            .get(&ps.project_id)
            .ok_or_else(|| StoreError::NotFound(format!("project {}", ps.project_id)))?;
        Ok(CommitmentRecord {
            commitment: commitment.clone(),
            service_type: ps.service_type.clone(),
            resource: resource.name.clone(),
            az: az.az.clone(),
            project_uuid: project.uuid.clone(),
        })
    }

    fn push_ring_error(ps: &mut ProjectService, at: EpochMillis, message: &str) {
        ps.recent_errors.push(RecordedError {
            at,
            message: message.to_owned(),
        });
        let len = ps.recent_errors.len();
        if len > ERROR_RING_SIZE {
            ps.recent_errors.drain(..len - ERROR_RING_SIZE);
        }
    }
}

/// An in-memory [`Store`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    fn with_tx<R>(
        &self,
        f: impl FnOnce(&mut State) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut guard = self.state.lock().expect("store mutex poisoned");
        let mut draft = guard.clone();
        let result = f(&mut draft)?;
        *guard = draft;
        Ok(result)
    }

    fn read<R>(&self, f: impl FnOnce(&State) -> Result<R, StoreError>) -> Result<R, StoreError> {
        let guard = self.state.lock().expect("store mutex poisoned");
        f(&guard)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn sync_discovered(
        &self,
        now: EpochMillis,
        discovered: Vec<DiscoveredDomain>,
    ) -> Result<DiscoverySummary, StoreError> {
        self.with_tx(|state| {
            let mut summary = DiscoverySummary::default();
            let mut seen_projects = BTreeSet::new();

            for domain in discovered {
                let domain_id = match state.domains.values().find(|d| d.uuid == domain.uuid) {
                    Some(existing) => existing.id,
                    None => {
                        let id = DomainId(state.alloc());
                        state.domains.insert(
                            id,
                            Domain {
                                id,
                                uuid: domain.uuid.clone(),
                                name: domain.name.clone(),
                            },
                        );
                        summary.domains_created += 1;
                        id
                    }
                };
                for project in domain.projects {
                    seen_projects.insert(project.uuid.clone());
                    match state
                        .projects
                        .values_mut()
                        .find(|p| p.uuid == project.uuid)
                    {
                        Some(existing) => {
                            existing.name = project.name;
                            existing.parent_uuid = project.parent_uuid;
                            if existing.missing_since.take().is_some() {
                                summary.projects_recovered += 1;
                            }
                        }
                        None => {
                            let id = ProjectId(state.alloc());
                            state.projects.insert(
                                id,
                                Project {
                                    id,
                                    domain_id,
                                    uuid: project.uuid,
                                    name: project.name,
                                    parent_uuid: project.parent_uuid,
                                    missing_since: None,
                                },
                            );
                            summary.projects_created += 1;
                        }
                    }
                }
            }

            for project in state.projects.values_mut() {
                if !seen_projects.contains(&project.uuid) && project.missing_since.is_none() {
                    project.missing_since = Some(now);
                    summary.projects_marked_missing += 1;
                }
            }
            Ok(summary)
        })
    }

    async fn ensure_project_services(
        &self,
        now: EpochMillis,
        service_types: &[ServiceType],
    ) -> Result<u64, StoreError> {
        self.with_tx(|state| {
            let mut created = 0;
            let project_ids: Vec<_> = state.projects.keys().copied().collect();
            for project_id in project_ids {
                for service_type in service_types {
                    let exists = state.project_services.values().any(|ps| {
                        ps.project_id == project_id && ps.service_type == *service_type
                    });
                    if !exists {
                        let id = ProjectServiceId(state.alloc());
                        state.project_services.insert(
                            id,
                            ProjectService {
                                id,
                                project_id,
                                service_type: service_type.clone(),
                                scraped_at: None,
                                next_scrape_at: now,
                                checked_at: None,
                                scrape_error: None,
                                consecutive_errors: 0,
                                recent_errors: Vec::new(),
                                stale: false,
                                quota_desynced_at: None,
                                quota_sync_after: 0,
                                quota_sync_errors: 0,
                                serialized_state: None,
                            },
                        );
                        created += 1;
                    }
                }
            }
            Ok(created)
        })
    }

    async fn ensure_service(
        &self,
        now: EpochMillis,
        service_type: ServiceType,
        liquid_version: u64,
    ) -> Result<(), StoreError> {
        self.with_tx(|state| {
            state
                .services
                .entry(service_type.clone())
                .and_modify(|s| s.liquid_version = liquid_version)
                .or_insert_with(|| Service {
                    service_type,
                    liquid_version,
                    scraped_at: None,
                    next_scrape_at: now,
                    checked_at: None,
                    scrape_error: None,
                    consecutive_errors: 0,
                    next_distribution_at: None,
                });
            Ok(())
        })
    }

    async fn purge_missing_projects(
        &self,
        now: EpochMillis,
        grace: Duration,
    ) -> Result<u64, StoreError> {
        let grace = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self.with_tx(|state| {
            let doomed: Vec<ProjectId> = state
                .projects
                .values()
                .filter(|p| matches!(p.missing_since, Some(t) if t.saturating_add(grace) <= now))
                .map(|p| p.id)
                .collect();
            for project_id in &doomed {
                let pairs: Vec<_> = state
                    .project_services
                    .values()
                    .filter(|ps| ps.project_id == *project_id)
                    .map(|ps| ps.id)
                    .collect();
                for ps_id in pairs {
                    for rid in state.resource_rows_of(ps_id) {
                        for aid in state.az_rows_of(rid) {
                            state
                                .commitments
                                .retain(|_, c| c.az_resource_id != aid);
                            state.az_resources.remove(&aid);
                        }
                        state.project_resources.remove(&rid);
                    }
                    state.project_services.remove(&ps_id);
                }
                state.projects.remove(project_id);
            }
            Ok(u64::try_from(doomed.len()).expect("usize fits in u64"))
        })
    }

    async fn release_stuck_claims(
        &self,
        now: EpochMillis,
        older_than: Duration,
    ) -> Result<u64, StoreError> {
        let age = u64::try_from(older_than.as_millis()).unwrap_or(u64::MAX);
        self.with_tx(|state| {
            let mut released = 0;
            for ps in state.project_services.values_mut() {
                if matches!(ps.checked_at, Some(t) if t.saturating_add(age) <= now) {
                    ps.checked_at = None;
                    released += 1;
                }
            }
            for service in state.services.values_mut() {
                if matches!(service.checked_at, Some(t) if t.saturating_add(age) <= now) {
                    service.checked_at = None;
                    released += 1;
                }
            }
            Ok(released)
        })
    }

    async fn claim_due_scrape(
        &self,
        now: EpochMillis,
    ) -> Result<Option<ScrapeClaim>, StoreError> {
        self.with_tx(|state| {
            let due = state
                .project_services
                .values()
                .filter(|ps| ps.checked_at.is_none() && (ps.stale || ps.next_scrape_at <= now))
                // Stale pairs jump the queue; among equals the oldest cursor
                // wins, with the id as the stable tie-break.
                .min_by_key(|ps| (!ps.stale, ps.next_scrape_at, ps.id))
                .map(|ps| ps.id);
            let Some(ps_id) = due else { return Ok(None) };
            let ps = state.project_service(ps_id)?;
            ps.checked_at = Some(now);
            let ps = ps.clone();
            let project = state
                .projects
                .get(&ps.project_id)
                .ok_or_else(|| StoreError::NotFound(format!("project {}", ps.project_id)))?
                .clone();
            let domain_uuid = state
                .domains
                .get(&project.domain_id)
                .ok_or_else(|| StoreError::NotFound(format!("domain {}", project.domain_id)))?
                .uuid
                .clone();
            Ok(Some(ScrapeClaim {
                project_service: ps,
                project,
                domain_uuid,
            }))
        })
    }

    async fn commit_usage_scrape(&self, commit: UsageScrapeCommit) -> Result<(), StoreError> {
        self.with_tx(|state| {
            let ps = state.project_service(commit.project_service_id)?;
            ps.scraped_at = Some(commit.now);
            ps.next_scrape_at = commit.next_scrape_at;
            ps.checked_at = None;
            ps.scrape_error = None;
            ps.consecutive_errors = 0;
            ps.stale = false;
            ps.serialized_state = commit.serialized_state.clone();

            // Reconcile resource rows against the declaration. Missing rows
            // are created; rows the adapter no longer declares are kept but
            // marked stale, because their quota is the only authoritative
            // record of what was granted.
            let mut declared_names = BTreeSet::new();
            for declared in &commit.declared {
                declared_names.insert(declared.name.clone());
                let existing = state
                    .project_resources
                    .values_mut()
                    .find(|r| {
                        r.project_service_id == commit.project_service_id
                            && r.name == declared.name
                    })
                    .map(|r| r.id);
                match existing {
                    Some(rid) => {
                        let row = state
                            .project_resources
                            .get_mut(&rid)
                            .expect("row id just looked up");
                        row.unit = declared.unit;
                        row.topology = declared.topology;
                        row.has_capacity = declared.has_capacity;
                        row.has_quota = declared.has_quota;
                        row.stale = false;
                    }
                    None => {
                        let id = ProjectResourceId(state.alloc());
                        let quota = declared.initial_quota.filter(|_| declared.has_quota);
                        state.project_resources.insert(
                            id,
                            ProjectResource {
                                id,
                                project_service_id: commit.project_service_id,
                                name: declared.name.clone(),
                                unit: declared.unit,
                                topology: declared.topology,
                                has_capacity: declared.has_capacity,
                                has_quota: declared.has_quota,
                                quota,
                                backend_quota: None,
                                desired_backend_quota: quota.map(BackendQuota::Limited),
                                min_quota_from_backend: None,
                                max_quota_from_admin: None,
                                max_quota_from_outside_admin: None,
                                override_quota: None,
                                stale: false,
                                version: 0,
                            },
                        );
                    }
                }
            }
            for rid in state.resource_rows_of(commit.project_service_id) {
                let row = state
                    .project_resources
                    .get_mut(&rid)
                    .expect("row id just collected");
                if !declared_names.contains(&row.name) {
                    row.stale = true;
                }
            }

            // Apply the observations.
            for observed in &commit.observed {
                let rid = state
                    .project_resources
                    .values()
                    .find(|r| {
                        r.project_service_id == commit.project_service_id
                            && r.name == observed.name
                    })
                    .map(|r| r.id)
                    .ok_or_else(|| {
                        StoreError::Constraint(format!(
                            "observation for undeclared resource {}",
                            observed.name
                        ))
                    })?;
                {
                    let row = state
                        .project_resources
                        .get_mut(&rid)
                        .expect("row id just looked up");
                    row.backend_quota = observed.backend_quota;
                    row.version += 1;
                }
                for az in &observed.per_az {
                    if let Some(physical) = az.physical_usage {
                        if physical > az.usage {
                            return Err(StoreError::Constraint(format!(
                                "physical usage {} exceeds usage {} in {}",
                                physical, az.usage, az.az
                            )));
                        }
                    }
                    let aid = state
                        .az_resources
                        .values()
                        .find(|a| a.project_resource_id == rid && a.az == az.az)
                        .map(|a| a.id);
                    let aid = match aid {
                        Some(aid) => aid,
                        None => {
                            let id = ProjectAzResourceId(state.alloc());
                            state.az_resources.insert(
                                id,
                                ProjectAzResource {
                                    id,
                                    project_resource_id: rid,
                                    az: az.az.clone(),
                                    usage: 0,
                                    physical_usage: None,
                                    subresources: Vec::new(),
                                    historical_usage: Default::default(),
                                    backend_quota: None,
                                    desired_backend_quota: None,
                                },
                            );
                            id
                        }
                    };
                    let row = state
                        .az_resources
                        .get_mut(&aid)
                        .expect("row id just inserted");
                    row.usage = az.usage;
                    row.physical_usage = az.physical_usage;
                    row.subresources = az.subresources.clone();
                    row.backend_quota = az.backend_quota;
                    row.historical_usage.record(commit.now, az.usage);
                    row.historical_usage.prune(commit.now, commit.retention);
                }
            }

            state.recompute_desync(commit.project_service_id, commit.now);

            let service_type = state
                .project_services
                .get(&commit.project_service_id)
                .expect("pair verified above")
                .service_type
                .clone();
            if let Some(service) = state.services.get_mut(&service_type) {
                let due = commit.distribution_due_at;
                service.next_distribution_at = Some(
                    service
                        .next_distribution_at
                        .map_or(due, |existing| existing.min(due)),
                );
            }
            Ok(())
        })
    }

    async fn record_scrape_error(
        &self,
        project_service_id: ProjectServiceId,
        now: EpochMillis,
        message: String,
        next_scrape_at: EpochMillis,
    ) -> Result<(), StoreError> {
        self.with_tx(|state| {
            let ps = state.project_service(project_service_id)?;
            ps.checked_at = None;
            ps.scrape_error = Some(message.clone());
            ps.consecutive_errors = ps.consecutive_errors.saturating_add(1);
            ps.next_scrape_at = next_scrape_at;
            ps.stale = false;
            State::push_ring_error(ps, now, &message);
            Ok(())
        })
    }

    async fn claim_due_capacity(&self, now: EpochMillis) -> Result<Option<Service>, StoreError> {
        self.with_tx(|state| {
            let due = state
                .services
                .values()
                .filter(|s| s.checked_at.is_none() && s.next_scrape_at <= now)
                .min_by_key(|s| (s.next_scrape_at, s.service_type.clone()))
                .map(|s| s.service_type.clone());
            let Some(service_type) = due else { return Ok(None) };
            let service = state
                .services
                .get_mut(&service_type)
                .expect("service just looked up");
            service.checked_at = Some(now);
            Ok(Some(service.clone()))
        })
    }

    async fn commit_capacity_scrape(
        &self,
        commit: CapacityScrapeCommit,
    ) -> Result<(), StoreError> {
        self.with_tx(|state| {
            let service = state
                .services
                .get_mut(&commit.service_type)
                .ok_or_else(|| {
                    StoreError::NotFound(format!("service {}", commit.service_type))
                })?;
            service.scraped_at = Some(commit.now);
            service.next_scrape_at = commit.next_scrape_at;
            service.checked_at = None;
            service.scrape_error = None;
            service.consecutive_errors = 0;
            let due = commit.distribution_due_at;
            service.next_distribution_at = Some(
                service
                    .next_distribution_at
                    .map_or(due, |existing| existing.min(due)),
            );

            // The scan is authoritative: replace the whole capacity image.
            state
                .cluster_az
                .retain(|(st, _, _), _| *st != commit.service_type);
            for resource in &commit.resources {
                for az in &resource.per_az {
                    state.cluster_az.insert(
                        (
                            commit.service_type.clone(),
                            resource.name.clone(),
                            az.az.clone(),
                        ),
                        ClusterAzResource {
                            service_type: commit.service_type.clone(),
                            resource: resource.name.clone(),
                            az: az.az.clone(),
                            raw_capacity: az.raw_capacity,
                            usage: az.usage,
                            subcapacities: az.subcapacities.clone(),
                            scraped_at: commit.now,
                        },
                    );
                }
            }
            Ok(())
        })
    }

    async fn record_capacity_error(
        &self,
        service_type: ServiceType,
        _now: EpochMillis,
        message: String,
        next_scrape_at: EpochMillis,
    ) -> Result<(), StoreError> {
        self.with_tx(|state| {
            let service = state
                .services
                .get_mut(&service_type)
                .ok_or_else(|| StoreError::NotFound(format!("service {service_type}")))?;
            service.checked_at = None;
            service.scrape_error = Some(message);
            service.consecutive_errors = service.consecutive_errors.saturating_add(1);
            service.next_scrape_at = next_scrape_at;
            Ok(())
        })
    }

    async fn aggregate_demand(
        &self,
        service_type: &ServiceType,
        resources: &[ResourceName],
    ) -> Result<BTreeMap<ResourceName, BTreeMap<AvailabilityZone, AggregateDemand>>, StoreError>
    {
        self.read(|state| {
            let mut out: BTreeMap<ResourceName, BTreeMap<AvailabilityZone, AggregateDemand>> =
                BTreeMap::new();
            for ps in state
                .project_services
                .values()
                .filter(|ps| ps.service_type == *service_type)
            {
                for rid in state.resource_rows_of(ps.id) {
                    let resource = &state.project_resources[&rid];
                    if !resources.contains(&resource.name) || resource.stale {
                        continue;
                    }
                    for aid in state.az_rows_of(rid) {
                        let az = &state.az_resources[&aid];
                        let committed: u64 = state
                            .commitments
                            .values()
                            .filter(|c| {
                                c.az_resource_id == aid && c.state.reserves_capacity()
                            })
                            .map(|c| c.amount)
                            .sum();
                        let pending: u64 = state
                            .commitments
                            .values()
                            .filter(|c| {
                                c.az_resource_id == aid && c.state == CommitmentState::Pending
                            })
                            .map(|c| c.amount)
                            .sum();
                        let entry = out
                            .entry(resource.name.clone())
                            .or_default()
                            .entry(az.az.clone())
                            .or_default();
                        entry.usage += az.usage;
                        entry.unused_commitments += committed.saturating_sub(az.usage);
                        entry.pending_commitments += pending;
                    }
                }
            }
            Ok(out)
        })
    }

    async fn claim_desynced(
        &self,
        now: EpochMillis,
    ) -> Result<Option<QuotaSyncClaim>, StoreError> {
        self.with_tx(|state| {
            let due = state
                .project_services
                .values()
                .filter(|ps| {
                    ps.checked_at.is_none()
                        && ps.quota_desynced_at.is_some()
                        && ps.quota_sync_after <= now
                })
                .min_by_key(|ps| (ps.quota_desynced_at, ps.id))
                .map(|ps| ps.id);
            let Some(ps_id) = due else { return Ok(None) };
            let ps = state.project_service(ps_id)?;
            ps.checked_at = Some(now);
            let ps = ps.clone();
            let project = state
                .projects
                .get(&ps.project_id)
                .ok_or_else(|| StoreError::NotFound(format!("project {}", ps.project_id)))?
                .clone();
            let domain_uuid = state
                .domains
                .get(&project.domain_id)
                .ok_or_else(|| StoreError::NotFound(format!("domain {}", project.domain_id)))?
                .uuid
                .clone();
            let resources: Vec<ProjectResource> = state
                .resource_rows_of(ps_id)
                .into_iter()
                .map(|rid| state.project_resources[&rid].clone())
                .collect();
            let az_resources: Vec<ProjectAzResource> = resources
                .iter()
                .flat_map(|r| state.az_rows_of(r.id))
                .map(|aid| state.az_resources[&aid].clone())
                .collect();
            Ok(Some(QuotaSyncClaim {
                project_service: ps,
                project,
                domain_uuid,
                resources,
                az_resources,
            }))
        })
    }

    async fn complete_quota_sync(
        &self,
        project_service_id: ProjectServiceId,
        now: EpochMillis,
        floors: BTreeMap<ResourceName, u64>,
    ) -> Result<(), StoreError> {
        self.with_tx(|state| {
            for rid in state.resource_rows_of(project_service_id) {
                let topology = {
                    let row = state
                        .project_resources
                        .get_mut(&rid)
                        .expect("row id just collected");
                    if !row.has_quota {
                        continue;
                    }
                    if let Some(desired) = row.desired_backend_quota {
                        row.backend_quota = Some(desired);
                        row.version += 1;
                    }
                    if let Some(floor) = floors.get(&row.name) {
                        row.min_quota_from_backend = Some(*floor);
                    }
                    row.topology
                };
                if topology == Topology::AzSeparated {
                    for aid in state.az_rows_of(rid) {
                        let az = state
                            .az_resources
                            .get_mut(&aid)
                            .expect("row id just collected");
                        if let Some(desired) = az.desired_backend_quota {
                            az.backend_quota = Some(desired);
                        }
                    }
                }
            }
            let ps = state.project_service(project_service_id)?;
            ps.checked_at = None;
            ps.quota_desynced_at = None;
            ps.quota_sync_errors = 0;
            ps.quota_sync_after = now;
            Ok(())
        })
    }

    async fn record_quota_sync_error(
        &self,
        project_service_id: ProjectServiceId,
        now: EpochMillis,
        message: String,
        retry_at: EpochMillis,
    ) -> Result<(), StoreError> {
        self.with_tx(|state| {
            let ps = state.project_service(project_service_id)?;
            ps.checked_at = None;
            ps.quota_sync_errors = ps.quota_sync_errors.saturating_add(1);
            ps.quota_sync_after = retry_at;
            State::push_ring_error(ps, now, &message);
            Ok(())
        })
    }

    async fn claim_due_distribution(
        &self,
        now: EpochMillis,
    ) -> Result<Option<ServiceType>, StoreError> {
        self.with_tx(|state| {
            let due = state
                .services
                .values()
                .filter(|s| matches!(s.next_distribution_at, Some(t) if t <= now))
                .min_by_key(|s| (s.next_distribution_at, s.service_type.clone()))
                .map(|s| s.service_type.clone());
            let Some(service_type) = due else { return Ok(None) };
            state
                .services
                .get_mut(&service_type)
                .expect("service just looked up")
                .next_distribution_at = None;
            Ok(Some(service_type))
        })
    }

    async fn schedule_distribution(
        &self,
        service_type: ServiceType,
        at: EpochMillis,
    ) -> Result<(), StoreError> {
        self.with_tx(|state| {
            let service = state
                .services
                .get_mut(&service_type)
                .ok_or_else(|| StoreError::NotFound(format!("service {service_type}")))?;
            service.next_distribution_at = Some(
                service
                    .next_distribution_at
                    .map_or(at, |existing| existing.min(at)),
            );
            Ok(())
        })
    }

    async fn distribution_snapshot(
        &self,
        service_type: &ServiceType,
        now: EpochMillis,
    ) -> Result<DistributionSnapshot, StoreError> {
        self.read(|state| {
            let mut resources: BTreeMap<ResourceName, ResourceDistributionData> = BTreeMap::new();

            for ((st, resource, az), row) in &state.cluster_az {
                if st != service_type {
                    continue;
                }
                resources
                    .entry(resource.clone())
                    .or_insert_with(|| ResourceDistributionData {
                        topology: Topology::Flat,
                        has_quota: false,
                        capacity: BTreeMap::new(),
                        projects: Vec::new(),
                    })
                    .capacity
                    .insert(az.clone(), row.raw_capacity);
            }

            for ps in state
                .project_services
                .values()
                .filter(|ps| ps.service_type == *service_type)
            {
                let project = state
                    .projects
                    .get(&ps.project_id)
                    .ok_or_else(|| StoreError::NotFound(format!("project {}", ps.project_id)))?;
                for rid in state.resource_rows_of(ps.id) {
                    let resource = &state.project_resources[&rid];
                    if resource.stale {
                        continue;
                    }
                    let entry = resources
                        .entry(resource.name.clone())
                        .or_insert_with(|| ResourceDistributionData {
                            topology: resource.topology,
                            has_quota: resource.has_quota,
                            capacity: BTreeMap::new(),
                            projects: Vec::new(),
                        });
                    entry.topology = resource.topology;
                    entry.has_quota = resource.has_quota;

                    let mut per_az = BTreeMap::new();
                    for aid in state.az_rows_of(rid) {
                        let az = &state.az_resources[&aid];
                        let commitments = state
                            .commitments
                            .values()
                            .filter(|c| c.az_resource_id == aid && !c.state.is_terminal())
                            .map(|c| CommitmentDemand {
                                id: c.id,
                                state: c.state,
                                amount: c.amount,
                                duration_secs: c.duration_secs,
                                confirm_by: c.confirm_by,
                                requested_at: c.requested_at,
                            })
                            .collect();
                        per_az.insert(
                            az.az.clone(),
                            AzDistributionData {
                                az_resource_id: aid,
                                usage: az.usage,
                                commitments,
                            },
                        );
                    }
                    entry.projects.push(ProjectDistributionData {
                        project_id: project.id,
                        project_uuid: project.uuid.clone(),
                        resource_id: rid,
                        version: resource.version,
                        min_quota_from_backend: resource.min_quota_from_backend,
                        max_quota_from_admin: resource.max_quota_from_admin,
                        max_quota_from_outside_admin: resource.max_quota_from_outside_admin,
                        override_quota: resource.override_quota,
                        per_az,
                    });
                }
            }

            Ok(DistributionSnapshot {
                service_type: service_type.clone(),
                taken_at: now,
                resources,
            })
        })
    }

    async fn apply_distribution(&self, outcome: DistributionOutcome) -> Result<(), StoreError> {
        self.with_tx(|state| {
            let mut touched_pairs = BTreeSet::new();
            for write in &outcome.quota_writes {
                let row = state
                    .project_resources
                    .get_mut(&write.resource_id)
                    .ok_or_else(|| {
                        StoreError::NotFound(format!("project resource {}", write.resource_id))
                    })?;
                if row.version != write.expected_version {
                    return Err(StoreError::Conflict(format!(
                        "project resource {} is at version {}, expected {}",
                        write.resource_id, row.version, write.expected_version
                    )));
                }
                row.quota = Some(write.quota);
                row.desired_backend_quota = Some(write.desired_backend_quota);
                row.version += 1;
                touched_pairs.insert(row.project_service_id);
                for (aid, desired) in &write.per_az {
                    let az = state.az_resources.get_mut(aid).ok_or_else(|| {
                        StoreError::NotFound(format!("az resource {aid}"))
                    })?;
                    az.desired_backend_quota = Some(*desired);
                }
            }
            for write in &outcome.commitment_writes {
                apply_commitment_write(state, write)?;
            }
            for ps_id in touched_pairs {
                state.recompute_desync(ps_id, outcome.now);
            }
            Ok(())
        })
    }

    async fn az_resource_context(
        &self,
        id: ProjectAzResourceId,
    ) -> Result<AzResourceContext, StoreError> {
        self.read(|state| {
            let az = state
                .az_resources
                .get(&id)
                .ok_or_else(|| StoreError::NotFound(format!("az resource {id}")))?;
            let resource = state
                .project_resources
                .get(&az.project_resource_id)
                .ok_or_else(|| {
                    StoreError::NotFound(format!("project resource {}", az.project_resource_id))
                })?;
            let ps = state
                .project_services
                .get(&resource.project_service_id)
                .ok_or_else(|| {
                    StoreError::NotFound(format!(
                        "project service {}",
                        resource.project_service_id
                    ))
                })?;
            let project = state
                .projects
                .get(&ps.project_id)
                .ok_or_else(|| StoreError::NotFound(format!("project {}", ps.project_id)))?;
            let committed_total = state
                .commitments
                .values()
                .filter(|c| c.az_resource_id == id && c.state.reserves_capacity())
                .map(|c| c.amount)
                .sum();
            Ok(AzResourceContext {
                service_type: ps.service_type.clone(),
                resource: resource.name.clone(),
                az: az.az.clone(),
                project_uuid: project.uuid.clone(),
                committed_total,
            })
        })
    }

    async fn create_commitment(&self, new: NewCommitment) -> Result<Commitment, StoreError> {
        self.with_tx(|state| {
            if !matches!(
                new.initial_state,
                CommitmentState::Planned | CommitmentState::Pending
            ) {
                return Err(StoreError::Constraint(format!(
                    "commitments cannot be created in state {}",
                    new.initial_state
                )));
            }
            if new.amount == 0 {
                return Err(StoreError::Constraint(
                    "commitments must have a positive amount".into(),
                ));
            }
            if !state.az_resources.contains_key(&new.az_resource_id) {
                return Err(StoreError::NotFound(format!(
                    "az resource {}",
                    new.az_resource_id
                )));
            }
            let id = CommitmentId(state.alloc());
            let commitment = Commitment {
                id,
                uuid: Uuid::new_v4(),
                az_resource_id: new.az_resource_id,
                amount: new.amount,
                duration_secs: new.duration_secs,
                requested_at: new.requested_at,
                confirm_by: new.confirm_by,
                confirmed_at: None,
                expires_at: None,
                state: new.initial_state,
                predecessor_id: None,
                transfer_token: None,
                notify_on_confirm: new.notify_on_confirm,
            };
            state.commitments.insert(id, commitment.clone());
            Ok(commitment)
        })
    }

    async fn get_commitment(&self, id: CommitmentId) -> Result<CommitmentRecord, StoreError> {
        self.read(|state| {
            let commitment = state
                .commitments
                .get(&id)
                .ok_or_else(|| StoreError::NotFound(format!("commitment {id}")))?;
            state.commitment_record(commitment)
        })
    }

    async fn list_commitments(&self) -> Result<Vec<CommitmentRecord>, StoreError> {
        self.read(|state| {
            state
                .commitments
                .values()
                .map(|c| state.commitment_record(c))
                .collect()
        })
    }

    async fn persist_commitment_transition(
        &self,
        write: CommitmentWrite,
    ) -> Result<Commitment, StoreError> {
        self.with_tx(|state| {
            apply_commitment_write(state, &write)?;
            Ok(state.commitments[&write.id].clone())
        })
    }

    async fn set_transfer_token(
        &self,
        id: CommitmentId,
        token: Option<Uuid>,
    ) -> Result<(), StoreError> {
        self.with_tx(|state| {
            let commitment = state
                .commitments
                .get_mut(&id)
                .ok_or_else(|| StoreError::NotFound(format!("commitment {id}")))?;
            if commitment.state != CommitmentState::Confirmed {
                return Err(StoreError::Constraint(format!(
                    "only confirmed commitments are transferable, {id} is {}",
                    commitment.state
                )));
            }
            commitment.transfer_token = token;
            Ok(())
        })
    }

    async fn accept_transfer(
        &self,
        token: Uuid,
        dest: ProjectAzResourceId,
        now: EpochMillis,
    ) -> Result<Commitment, StoreError> {
        self.with_tx(|state| {
            if !state.az_resources.contains_key(&dest) {
                return Err(StoreError::NotFound(format!("az resource {dest}")));
            }
            let predecessor_id = state
                .commitments
                .values()
                .find(|c| {
                    c.transfer_token == Some(token) && c.state == CommitmentState::Confirmed
                })
                .map(|c| c.id)
                .ok_or_else(|| StoreError::NotFound("transfer token".into()))?;
            let predecessor = state
                .commitments
                .get_mut(&predecessor_id)
                .expect("row id just looked up");
            predecessor.state = CommitmentState::Superseded;
            predecessor.transfer_token = None;
            let (amount, duration_secs, confirmed_at, expires_at) = (
                predecessor.amount,
                predecessor.duration_secs,
                predecessor.confirmed_at,
                predecessor.expires_at,
            );

            let id = CommitmentId(state.alloc());
            let successor = Commitment {
                id,
                uuid: Uuid::new_v4(),
                az_resource_id: dest,
                amount,
                duration_secs,
                requested_at: now,
                confirm_by: None,
                confirmed_at,
                expires_at,
                state: CommitmentState::Confirmed,
                predecessor_id: Some(predecessor_id),
                transfer_token: None,
                notify_on_confirm: false,
            };
            state.commitments.insert(id, successor.clone());
            Ok(successor)
        })
    }

    async fn delete_planned_commitment(&self, id: CommitmentId) -> Result<(), StoreError> {
        self.with_tx(|state| {
            let commitment = state
                .commitments
                .get(&id)
                .ok_or_else(|| StoreError::NotFound(format!("commitment {id}")))?;
            if commitment.state != CommitmentState::Planned {
                return Err(StoreError::Constraint(format!(
                    "only planned commitments can be deleted, {id} is {}",
                    commitment.state
                )));
            }
            state.commitments.remove(&id);
            Ok(())
        })
    }

    async fn list_lapsed_commitments(
        &self,
        now: EpochMillis,
    ) -> Result<Vec<CommitmentRecord>, StoreError> {
        self.read(|state| {
            state
                .commitments
                .values()
                .filter(|c| match c.state {
                    CommitmentState::Planned
                    | CommitmentState::Pending
                    | CommitmentState::Guaranteed => {
                        matches!(c.confirm_by, Some(t) if t <= now)
                    }
                    CommitmentState::Confirmed => {
                        matches!(c.expires_at, Some(t) if t <= now)
                    }
                    CommitmentState::Superseded | CommitmentState::Expired => false,
                })
                .map(|c| state.commitment_record(c))
                .collect()
        })
    }

    async fn services(&self) -> Result<Vec<Service>, StoreError> {
        self.read(|state| Ok(state.services.values().cloned().collect()))
    }

    async fn domains(&self) -> Result<Vec<Domain>, StoreError> {
        self.read(|state| Ok(state.domains.values().cloned().collect()))
    }

    async fn projects(&self) -> Result<Vec<Project>, StoreError> {
        self.read(|state| Ok(state.projects.values().cloned().collect()))
    }

    async fn project_services(&self) -> Result<Vec<ProjectService>, StoreError> {
        self.read(|state| Ok(state.project_services.values().cloned().collect()))
    }

    async fn project_resources(
        &self,
        project_service_id: ProjectServiceId,
    ) -> Result<Vec<ProjectResource>, StoreError> {
        self.read(|state| {
            Ok(state
                .resource_rows_of(project_service_id)
                .into_iter()
                .map(|rid| state.project_resources[&rid].clone())
                .collect())
        })
    }

    async fn az_resources(
        &self,
        project_resource_id: ProjectResourceId,
    ) -> Result<Vec<ProjectAzResource>, StoreError> {
        self.read(|state| {
            Ok(state
                .az_rows_of(project_resource_id)
                .into_iter()
                .map(|aid| state.az_resources[&aid].clone())
                .collect())
        })
    }

    async fn cluster_az_resources(
        &self,
        service_type: &ServiceType,
    ) -> Result<Vec<ClusterAzResource>, StoreError> {
        self.read(|state| {
            Ok(state
                .cluster_az
                .values()
                .filter(|row| row.service_type == *service_type)
                .cloned()
                .collect())
        })
    }

    async fn commitment_state_counts(
        &self,
    ) -> Result<BTreeMap<(ServiceType, CommitmentState), u64>, StoreError> {
        self.read(|state| {
            let mut counts: BTreeMap<(ServiceType, CommitmentState), u64> = BTreeMap::new();
            for commitment in state.commitments.values() {
                let record = state.commitment_record(commitment)?;
                *counts
                    .entry((record.service_type, commitment.state))
                    .or_default() += 1;
            }
            Ok(counts)
        })
    }

    async fn oldest_scrape_ages(
        &self,
        now: EpochMillis,
    ) -> Result<BTreeMap<ServiceType, Duration>, StoreError> {
        self.read(|state| {
            let mut ages: BTreeMap<ServiceType, Duration> = BTreeMap::new();
            for ps in state.project_services.values() {
                let reference = ps.scraped_at.unwrap_or(ps.next_scrape_at);
                let age = Duration::from_millis(now.saturating_sub(reference));
                let entry = ages.entry(ps.service_type.clone()).or_default();
                if age > *entry {
                    *entry = age;
                }
            }
            Ok(ages)
        })
    }

    async fn data_metrics(&self) -> Result<Vec<ProjectResourceMetric>, StoreError> {
        self.read(|state| {
            let mut out = Vec::new();
            for ps in state.project_services.values() {
                let project = state
                    .projects
                    .get(&ps.project_id)
                    .ok_or_else(|| StoreError::NotFound(format!("project {}", ps.project_id)))?;
                let domain = state
                    .domains
                    .get(&project.domain_id)
                    .ok_or_else(|| {
                        StoreError::NotFound(format!("domain {}", project.domain_id))
                    })?;
                for rid in state.resource_rows_of(ps.id) {
                    let resource = &state.project_resources[&rid];
                    let usage = state
                        .az_rows_of(rid)
                        .into_iter()
                        .map(|aid| state.az_resources[&aid].usage)
                        .sum();
                    out.push(ProjectResourceMetric {
                        domain_uuid: domain.uuid.clone(),
                        project_uuid: project.uuid.clone(),
                        service_type: ps.service_type.clone(),
                        resource: resource.name.clone(),
                        quota: resource.quota,
                        usage,
                    });
                }
            }
            Ok(out)
        })
    }

    async fn set_quota_by_operator(
        &self,
        resource_id: ProjectResourceId,
        quota: u64,
        desired_backend_quota: BackendQuota,
        now: EpochMillis,
    ) -> Result<(), StoreError> {
        self.with_tx(|state| {
            let row = state
                .project_resources
                .get_mut(&resource_id)
                .ok_or_else(|| {
                    StoreError::NotFound(format!("project resource {resource_id}"))
                })?;
            if !row.has_quota {
                return Err(StoreError::Constraint(format!(
                    "resource {} carries no quota",
                    row.name
                )));
            }
            row.quota = Some(quota);
            row.desired_backend_quota = Some(desired_backend_quota);
            row.version += 1;
            let ps_id = row.project_service_id;
            // An operator change should be reflected promptly: the pair
            // jumps the scrape queue.
            state.project_service(ps_id)?.stale = true;
            state.recompute_desync(ps_id, now);
            Ok(())
        })
    }
}

fn apply_commitment_write(state: &mut State, write: &CommitmentWrite) -> Result<(), StoreError> {
    let commitment = state
        .commitments
        .get_mut(&write.id)
        .ok_or_else(|| StoreError::NotFound(format!("commitment {}", write.id)))?;
    if commitment.state != write.expected_state {
        return Err(StoreError::Conflict(format!(
            "commitment {} is {}, expected {}",
            write.id, commitment.state, write.expected_state
        )));
    }
    commitment.state = write.new_state;
    if let Some(confirmed_at) = write.confirmed_at {
        commitment.confirmed_at = Some(confirmed_at);
    }
    if let Some(expires_at) = write.expires_at {
        commitment.expires_at = Some(expires_at);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use limes_repr::{BackendQuota, Topology, Unit};

    use crate::entities::CommitmentState;
    use crate::store::{
        CommitmentWrite, DeclaredResource, DiscoveredDomain, DiscoveredProject,
        DistributionOutcome, NewCommitment, ObservedAz, ObservedResource, QuotaWrite, Store,
        StoreError, UsageScrapeCommit,
    };

    use super::MemoryStore;

    fn discovered() -> Vec<DiscoveredDomain> {
        vec![DiscoveredDomain {
            uuid: "dom-1".into(),
            name: "default".into(),
            projects: vec![
                DiscoveredProject {
                    uuid: "proj-a".into(),
                    name: "alpha".into(),
                    parent_uuid: None,
                },
                DiscoveredProject {
                    uuid: "proj-b".into(),
                    name: "beta".into(),
                    parent_uuid: None,
                },
            ],
        }]
    }

    fn declared_capacity() -> Vec<DeclaredResource> {
        vec![DeclaredResource {
            name: "capacity".into(),
            unit: Unit::Bytes,
            topology: Topology::Flat,
            has_capacity: true,
            has_quota: true,
            initial_quota: Some(10),
        }]
    }

    fn usage_commit(
        ps: crate::entities::ProjectServiceId,
        now: u64,
        usage: u64,
        backend_quota: i64,
    ) -> UsageScrapeCommit {
        UsageScrapeCommit {
            project_service_id: ps,
            now,
            next_scrape_at: now + 1_000,
            declared: declared_capacity(),
            observed: vec![ObservedResource {
                name: "capacity".into(),
                backend_quota: Some(BackendQuota::from_wire(backend_quota).unwrap()),
                per_az: vec![ObservedAz {
                    az: "any".into(),
                    usage,
                    physical_usage: None,
                    subresources: Vec::new(),
                    backend_quota: None,
                }],
            }],
            serialized_state: None,
            retention: Duration::from_secs(3_600),
            distribution_due_at: now + 15_000,
        }
    }

    async fn bootstrapped() -> (MemoryStore, Vec<crate::entities::ProjectService>) {
        let store = MemoryStore::new();
        store.sync_discovered(1_000, discovered()).await.unwrap();
        store.ensure_service(1_000, "shared".into(), 1).await.unwrap();
        store
            .ensure_project_services(1_000, &["shared".into()])
            .await
            .unwrap();
        let pairs = store.project_services().await.unwrap();
        (store, pairs)
    }

    #[tokio::test]
    async fn test_discovery_creates_and_marks_missing() {
        let store = MemoryStore::new();
        let summary = store.sync_discovered(1_000, discovered()).await.unwrap();
        assert_eq!(summary.domains_created, 1);
        assert_eq!(summary.projects_created, 2);

        // proj-b disappears.
        let mut next = discovered();
        next[0].projects.truncate(1);
        let summary = store.sync_discovered(2_000, next).await.unwrap();
        assert_eq!(summary.projects_created, 0);
        assert_eq!(summary.projects_marked_missing, 1);

        // Within the grace period nothing is deleted.
        let purged = store
            .purge_missing_projects(2_500, Duration::from_millis(1_000))
            .await
            .unwrap();
        assert_eq!(purged, 0);
        let purged = store
            .purge_missing_projects(5_000, Duration::from_millis(1_000))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.projects().await.unwrap().len(), 1);

        // Reappearing clears the marker.
        let summary = store.sync_discovered(6_000, discovered()).await.unwrap();
        assert_eq!(summary.projects_created, 1);
    }

    #[tokio::test]
    async fn test_claims_are_mutually_exclusive() {
        let (store, pairs) = bootstrapped().await;
        assert_eq!(pairs.len(), 2);

        let first = store.claim_due_scrape(1_000).await.unwrap().unwrap();
        let second = store.claim_due_scrape(1_000).await.unwrap().unwrap();
        assert_ne!(first.project_service.id, second.project_service.id);
        assert!(store.claim_due_scrape(1_000).await.unwrap().is_none());

        // Finishing one makes it claimable again once due.
        store
            .commit_usage_scrape(usage_commit(first.project_service.id, 1_000, 5, 10))
            .await
            .unwrap();
        assert!(store.claim_due_scrape(1_500).await.unwrap().is_none());
        let again = store.claim_due_scrape(2_000).await.unwrap().unwrap();
        assert_eq!(again.project_service.id, first.project_service.id);
    }

    #[tokio::test]
    async fn test_scrape_commit_reconciles_and_detects_drift() {
        let (store, _) = bootstrapped().await;
        let claim = store.claim_due_scrape(1_000).await.unwrap().unwrap();
        let ps_id = claim.project_service.id;

        // Backend quota equals the initial desired quota: no drift.
        store
            .commit_usage_scrape(usage_commit(ps_id, 1_000, 5, 10))
            .await
            .unwrap();
        let resources = store.project_resources(ps_id).await.unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].quota, Some(10));
        assert_eq!(resources[0].backend_quota, Some(BackendQuota::Limited(10)));
        let pair = store
            .project_services()
            .await
            .unwrap()
            .into_iter()
            .find(|p| p.id == ps_id)
            .unwrap();
        assert!(pair.quota_desynced_at.is_none());

        // The backend drifts: marker set.
        let claim = store.claim_due_scrape(2_000).await.unwrap().unwrap();
        store
            .commit_usage_scrape(usage_commit(claim.project_service.id, 2_000, 5, 7))
            .await
            .unwrap();
        let pair = store
            .project_services()
            .await
            .unwrap()
            .into_iter()
            .find(|p| p.id == claim.project_service.id)
            .unwrap();
        assert_eq!(pair.quota_desynced_at, Some(2_000));
    }

    #[tokio::test]
    async fn test_scrape_error_does_not_touch_resources() {
        let (store, _) = bootstrapped().await;
        let claim = store.claim_due_scrape(1_000).await.unwrap().unwrap();
        let ps_id = claim.project_service.id;
        store
            .commit_usage_scrape(usage_commit(ps_id, 1_000, 5, 10))
            .await
            .unwrap();
        let before = store.project_resources(ps_id).await.unwrap();

        let claim = store.claim_due_scrape(2_000).await.unwrap().unwrap();
        store
            .record_scrape_error(claim.project_service.id, 2_000, "boom".into(), 3_000)
            .await
            .unwrap();

        let after = store.project_resources(ps_id).await.unwrap();
        assert_eq!(before, after);
        let pair = store
            .project_services()
            .await
            .unwrap()
            .into_iter()
            .find(|p| p.id == ps_id)
            .unwrap();
        assert_eq!(pair.consecutive_errors, 1);
        assert_eq!(pair.scrape_error.as_deref(), Some("boom"));
        assert_eq!(pair.recent_errors.len(), 1);
        assert_eq!(pair.next_scrape_at, 3_000);
    }

    #[tokio::test]
    async fn test_stale_marking_never_deletes_rows() {
        let (store, _) = bootstrapped().await;
        let claim = store.claim_due_scrape(1_000).await.unwrap().unwrap();
        let ps_id = claim.project_service.id;
        store
            .commit_usage_scrape(usage_commit(ps_id, 1_000, 5, 10))
            .await
            .unwrap();

        // Next scrape declares no resources at all.
        let claim = store.claim_due_scrape(2_000).await.unwrap().unwrap();
        let mut commit = usage_commit(claim.project_service.id, 2_000, 0, 10);
        commit.declared.clear();
        commit.observed.clear();
        store.commit_usage_scrape(commit).await.unwrap();

        let resources = store.project_resources(ps_id).await.unwrap();
        assert_eq!(resources.len(), 1);
        assert!(resources[0].stale);
        assert_eq!(resources[0].quota, Some(10));
    }

    #[tokio::test]
    async fn test_apply_distribution_checks_versions() {
        let (store, _) = bootstrapped().await;
        let claim = store.claim_due_scrape(1_000).await.unwrap().unwrap();
        let ps_id = claim.project_service.id;
        store
            .commit_usage_scrape(usage_commit(ps_id, 1_000, 5, 10))
            .await
            .unwrap();
        let resource = store.project_resources(ps_id).await.unwrap().remove(0);

        // A write based on a stale version is rejected wholesale.
        let outcome = DistributionOutcome {
            now: 2_000,
            quota_writes: vec![QuotaWrite {
                resource_id: resource.id,
                expected_version: resource.version + 1,
                quota: 50,
                desired_backend_quota: BackendQuota::Limited(50),
                per_az: Vec::new(),
            }],
            commitment_writes: Vec::new(),
        };
        assert!(matches!(
            store.apply_distribution(outcome).await,
            Err(StoreError::Conflict(_))
        ));

        let outcome = DistributionOutcome {
            now: 2_000,
            quota_writes: vec![QuotaWrite {
                resource_id: resource.id,
                expected_version: resource.version,
                quota: 50,
                desired_backend_quota: BackendQuota::Limited(50),
                per_az: Vec::new(),
            }],
            commitment_writes: Vec::new(),
        };
        store.apply_distribution(outcome).await.unwrap();

        let row = store.project_resources(ps_id).await.unwrap().remove(0);
        assert_eq!(row.quota, Some(50));
        // Desired (50) now differs from backend (10): drift marker set.
        let pair = store
            .project_services()
            .await
            .unwrap()
            .into_iter()
            .find(|p| p.id == ps_id)
            .unwrap();
        assert_eq!(pair.quota_desynced_at, Some(2_000));
    }

    #[tokio::test]
    async fn test_quota_sync_clears_marker_and_records_floor() {
        let (store, _) = bootstrapped().await;
        let claim = store.claim_due_scrape(1_000).await.unwrap().unwrap();
        let ps_id = claim.project_service.id;
        store
            .commit_usage_scrape(usage_commit(ps_id, 1_000, 5, 7))
            .await
            .unwrap();

        let claim = store.claim_desynced(2_000).await.unwrap().unwrap();
        assert_eq!(claim.project_service.id, ps_id);
        // Claimed pairs are not handed out twice.
        assert!(store.claim_desynced(2_000).await.unwrap().is_none());

        store
            .complete_quota_sync(
                ps_id,
                2_000,
                BTreeMap::from([("capacity".into(), 5_u64)]),
            )
            .await
            .unwrap();
        let row = store.project_resources(ps_id).await.unwrap().remove(0);
        assert_eq!(row.backend_quota, row.desired_backend_quota);
        assert_eq!(row.min_quota_from_backend, Some(5));
        let pair = store
            .project_services()
            .await
            .unwrap()
            .into_iter()
            .find(|p| p.id == ps_id)
            .unwrap();
        assert!(pair.quota_desynced_at.is_none());
    }

    #[tokio::test]
    async fn test_transfer_token_is_one_shot() {
        let (store, _) = bootstrapped().await;
        // Scrape both pairs so both have az rows.
        for now in [1_000, 1_001] {
            let claim = store.claim_due_scrape(now).await.unwrap().unwrap();
            store
                .commit_usage_scrape(usage_commit(claim.project_service.id, now, 5, 10))
                .await
                .unwrap();
        }
        let pairs = store.project_services().await.unwrap();
        let source_az = store
            .az_resources(store.project_resources(pairs[0].id).await.unwrap()[0].id)
            .await
            .unwrap()[0]
            .id;
        let dest_az = store
            .az_resources(store.project_resources(pairs[1].id).await.unwrap()[0].id)
            .await
            .unwrap()[0]
            .id;

        let commitment = store
            .create_commitment(NewCommitment {
                az_resource_id: source_az,
                amount: 8,
                duration_secs: 3_600,
                requested_at: 1_500,
                confirm_by: None,
                initial_state: CommitmentState::Pending,
                notify_on_confirm: false,
            })
            .await
            .unwrap();
        store
            .persist_commitment_transition(CommitmentWrite {
                id: commitment.id,
                expected_state: CommitmentState::Pending,
                new_state: CommitmentState::Confirmed,
                confirmed_at: Some(1_600),
                expires_at: Some(1_600 + 3_600_000),
            })
            .await
            .unwrap();

        let token = uuid::Uuid::new_v4();
        store
            .set_transfer_token(commitment.id, Some(token))
            .await
            .unwrap();
        let successor = store.accept_transfer(token, dest_az, 2_000).await.unwrap();
        assert_eq!(successor.az_resource_id, dest_az);
        assert_eq!(successor.predecessor_id, Some(commitment.id));
        assert_eq!(successor.state, CommitmentState::Confirmed);
        assert_eq!(successor.expires_at, Some(1_600 + 3_600_000));

        let old = store.get_commitment(commitment.id).await.unwrap();
        assert_eq!(old.commitment.state, CommitmentState::Superseded);
        assert!(old.commitment.transfer_token.is_none());

        // The token is spent.
        assert!(matches!(
            store.accept_transfer(token, dest_az, 2_100).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_operator_write_marks_pair_stale_for_rescrape() {
        let (store, _) = bootstrapped().await;
        let claim = store.claim_due_scrape(1_000).await.unwrap().unwrap();
        let ps_id = claim.project_service.id;
        store
            .commit_usage_scrape(usage_commit(ps_id, 1_000, 5, 10))
            .await
            .unwrap();
        let resource_id = store.project_resources(ps_id).await.unwrap()[0].id;
        store
            .set_quota_by_operator(resource_id, 200, BackendQuota::Limited(200), 1_500)
            .await
            .unwrap();

        // The pair is claimable again right away even though its next scrape
        // is not due yet, and it outranks ordinary due cursors.
        let claim = store.claim_due_scrape(1_500).await.unwrap().unwrap();
        assert_eq!(claim.project_service.id, ps_id);
        assert!(claim.project_service.stale);
    }

    #[tokio::test]
    async fn test_serialized_state_round_trips() {
        let (store, _) = bootstrapped().await;
        let claim = store.claim_due_scrape(1_000).await.unwrap().unwrap();
        let ps_id = claim.project_service.id;
        let blob = serde_json::json!({"counter": 42, "marker": "abc"});
        let mut commit = usage_commit(ps_id, 1_000, 5, 10);
        commit.serialized_state = Some(blob.clone());
        store.commit_usage_scrape(commit).await.unwrap();

        let claim = store.claim_due_scrape(2_000).await.unwrap().unwrap();
        assert_eq!(claim.project_service.serialized_state, Some(blob));
    }
}
