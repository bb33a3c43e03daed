// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The distributor pass.
//!
//! A pass is a pure function from (snapshot, configuration, now) to a
//! [`DistributionOutcome`]: planning never touches the store. The
//! [`Distributor`] wraps the plan in snapshot/apply plumbing with optimistic
//! concurrency. A scrape that lands between snapshot and apply bumps a row
//! version, the apply conflicts without writing anything, and the pass
//! re-runs on a fresh snapshot.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use itertools::Itertools;
use thiserror::Error;
use tracing::{debug, info};

use limes_ore::cast::CastLossy;
use limes_ore::now::{EpochMillis, NowFn};
use limes_ore::retry::{Retry, RetryResult};
use limes_repr::{
    AvailabilityZone, BackendQuota, ClusterConfig, DistributionModel, ResourceConfig,
    ServiceType, Topology,
};
use limes_store::entities::CommitmentState;
use limes_store::snapshot::{
    AzDistributionData, DistributionSnapshot, ProjectDistributionData, ResourceDistributionData,
};
use limes_store::{CommitmentWrite, DistributionOutcome, QuotaWrite, Store, StoreError};

use crate::autogrow::{self, DemandLine};
use crate::commitment::validate_transition;

/// An error from a distributor pass.
#[derive(Debug, Error)]
pub enum DistributeError {
    /// The store failed; the pass left desired quotas unchanged.
    #[error("store failure during distribution: {0}")]
    Store(#[from] StoreError),
}

/// What one pass decided.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PassSummary {
    /// Resources considered.
    pub resources: usize,
    /// Quota writes applied.
    pub quota_writes: usize,
    /// Commitments confirmed.
    pub confirmed: usize,
    /// Commitments guaranteed ahead of their confirmation date.
    pub guaranteed: usize,
}

/// The latest published snapshot per service, for metrics and inspection.
///
/// Readers get an [`Arc`] and never block a publishing writer beyond the
/// reference swap itself.
#[derive(Clone, Debug, Default)]
pub struct SnapshotCell {
    inner: Arc<RwLock<BTreeMap<ServiceType, Arc<DistributionSnapshot>>>>,
}

impl SnapshotCell {
    /// Creates an empty cell.
    pub fn new() -> SnapshotCell {
        SnapshotCell::default()
    }

    /// Publishes a snapshot, replacing the previous one for its service.
    pub fn publish(&self, snapshot: Arc<DistributionSnapshot>) {
        self.inner
            .write()
            .expect("snapshot lock poisoned")
            .insert(snapshot.service_type.clone(), snapshot);
    }

    /// Returns the latest snapshot for a service, if one was published.
    pub fn latest(&self, service_type: &ServiceType) -> Option<Arc<DistributionSnapshot>> {
        self.inner
            .read()
            .expect("snapshot lock poisoned")
            .get(service_type)
            .cloned()
    }
}

/// Runs distributor passes against a store.
pub struct Distributor {
    store: Arc<dyn Store>,
    config: ClusterConfig,
    clock: NowFn,
    snapshots: SnapshotCell,
}

impl Distributor {
    /// Creates a distributor.
    pub fn new(store: Arc<dyn Store>, config: ClusterConfig, clock: NowFn) -> Distributor {
        Distributor {
            store,
            config,
            clock,
            snapshots: SnapshotCell::new(),
        }
    }

    /// Returns a handle to the published snapshots.
    pub fn snapshots(&self) -> SnapshotCell {
        self.snapshots.clone()
    }

    /// Runs one pass for a service: snapshot, plan, apply. Conflicting
    /// applies are retried on a fresh snapshot a bounded number of times.
    pub async fn run_pass(
        &self,
        service_type: &ServiceType,
    ) -> Result<PassSummary, DistributeError> {
        let (summary, snapshot) = Retry::default()
            .initial_backoff(Duration::from_millis(20))
            .clamp_backoff(Duration::from_millis(500))
            .max_tries(3)
            .retry_async(|state| async move {
                let now = (self.clock)();
                let snapshot = match self
                    .store
                    .distribution_snapshot(service_type, now)
                    .await
                {
                    Ok(snapshot) => snapshot,
                    Err(e) => return RetryResult::FatalErr(DistributeError::Store(e)),
                };
                let outcome = plan(&snapshot, &self.config, now);
                let summary = summarize(&snapshot, &outcome);
                match self.store.apply_distribution(outcome).await {
                    Ok(()) => RetryResult::Ok((summary, snapshot)),
                    Err(e @ StoreError::Conflict(_)) => {
                        debug!(service_type = %service_type, attempt = state.i, error = %e,
                            "distribution pass conflicted, retrying on a fresh snapshot");
                        RetryResult::RetryableErr(DistributeError::Store(e))
                    }
                    Err(e) => RetryResult::FatalErr(DistributeError::Store(e)),
                }
            })
            .await?;
        info!(
            service_type = %service_type,
            resources = summary.resources,
            quota_writes = summary.quota_writes,
            confirmed = summary.confirmed,
            "distribution pass applied"
        );
        self.snapshots.publish(Arc::new(snapshot));
        Ok(summary)
    }
}

fn summarize(snapshot: &DistributionSnapshot, outcome: &DistributionOutcome) -> PassSummary {
    PassSummary {
        resources: snapshot.resources.len(),
        quota_writes: outcome.quota_writes.len(),
        confirmed: outcome
            .commitment_writes
            .iter()
            .filter(|w| w.new_state == CommitmentState::Confirmed)
            .count(),
        guaranteed: outcome
            .commitment_writes
            .iter()
            .filter(|w| w.new_state == CommitmentState::Guaranteed)
            .count(),
    }
}

/// Computes the growth target: usage times the multiplier, rounded up.
pub fn growth_target(usage: u64, multiplier: f64) -> u64 {
    if multiplier <= 1.0 {
        return usage;
    }
    u64::cast_lossy((f64::cast_lossy(usage) * multiplier).ceil())
}

/// Plans one distributor pass. Pure.
pub fn plan(
    snapshot: &DistributionSnapshot,
    config: &ClusterConfig,
    now: EpochMillis,
) -> DistributionOutcome {
    let mut outcome = DistributionOutcome {
        now,
        ..Default::default()
    };

    for (name, resource) in &snapshot.resources {
        if !resource.has_quota || resource.capacity.is_empty() {
            continue;
        }
        let rc = config.resource(&snapshot.service_type, name);
        plan_resource(resource, &rc, now, &mut outcome);
    }
    outcome
}

fn plan_resource(
    resource: &ResourceDistributionData,
    rc: &ResourceConfig,
    now: EpochMillis,
    outcome: &mut DistributionOutcome,
) {
    // Deterministic project order: the UUID is the tie-break everywhere.
    let projects: Vec<&ProjectDistributionData> = resource
        .projects
        .iter()
        .sorted_by(|a, b| a.project_uuid.cmp(&b.project_uuid))
        .collect();
    if projects.is_empty() {
        return;
    }

    // One pool per availability zone, or a single merged pool for flat
    // resources. All arithmetic below is in effective units; the overcommit
    // factor is applied exactly here, on ingestion of raw capacity.
    let pools: Vec<(Option<AvailabilityZone>, u64)> = match resource.topology {
        Topology::Flat => {
            let raw: u64 = resource.capacity.values().sum();
            vec![(None, rc.overcommit_factor.effective_capacity(raw))]
        }
        Topology::AzAware | Topology::AzSeparated => resource
            .capacity
            .iter()
            .map(|(az, raw)| {
                (
                    Some(az.clone()),
                    rc.overcommit_factor.effective_capacity(*raw),
                )
            })
            .collect(),
    };

    let mut quotas = vec![0_u64; projects.len()];
    let mut per_az_desired: Vec<Vec<(limes_store::entities::ProjectAzResourceId, BackendQuota)>> =
        vec![Vec::new(); projects.len()];

    for (pool_az, pool_capacity) in &pools {
        let lines: Vec<DemandLine> = projects
            .iter()
            .map(|p| demand_line(p, pool_az.as_ref(), rc))
            .collect();
        let grants = match rc.distribution_model {
            DistributionModel::Autogrow => {
                autogrow::distribute(*pool_capacity, &lines, rc.balance)
            }
            DistributionModel::Hierarchical => lines
                .iter()
                .map(|l| l.committed.max(l.usage).saturating_add(rc.headroom))
                .collect(),
        };

        for (i, grant) in grants.iter().enumerate() {
            quotas[i] += grant;
            if resource.topology == Topology::AzSeparated {
                if let Some(az) = pool_az {
                    if let Some(az_data) = projects[i].per_az.get(az) {
                        per_az_desired[i]
                            .push((az_data.az_resource_id, BackendQuota::Limited(*grant)));
                    }
                }
            }
        }

        confirm_commitments(&projects, pool_az.as_ref(), &grants, rc, now, outcome);
    }

    for (i, project) in projects.iter().enumerate() {
        let mut quota = quotas[i];
        if let Some(floor) = project.min_quota_from_backend {
            quota = quota.max(floor);
        }
        if let Some(cap) = project.max_quota_from_admin {
            quota = quota.min(cap);
        }
        if let Some(cap) = project.max_quota_from_outside_admin {
            quota = quota.min(cap);
        }
        if let Some(overridden) = project.override_quota {
            quota = overridden;
        }
        outcome.quota_writes.push(QuotaWrite {
            resource_id: project.resource_id,
            expected_version: project.version,
            quota,
            desired_backend_quota: BackendQuota::Limited(quota),
            per_az: per_az_desired[i].clone(),
        });
    }
}

fn demand_line(
    project: &ProjectDistributionData,
    pool_az: Option<&AvailabilityZone>,
    rc: &ResourceConfig,
) -> DemandLine {
    let az_rows: Vec<&AzDistributionData> = match pool_az {
        Some(az) => project.per_az.get(az).into_iter().collect(),
        None => project.per_az.values().collect(),
    };
    let mut line = DemandLine::default();
    for az in az_rows {
        line.usage += az.usage;
        for commitment in &az.commitments {
            if commitment.state.reserves_capacity() {
                line.committed += commitment.amount;
            } else if awaits_confirmation(commitment.state, rc) {
                line.pending += commitment.amount;
            }
        }
    }
    line.growth_target = growth_target(line.usage, rc.growth_multiplier);
    line
}

fn awaits_confirmation(state: CommitmentState, rc: &ResourceConfig) -> bool {
    match state {
        CommitmentState::Pending => true,
        // Planned commitments reserve ahead of their confirmation date only
        // where the operator opted in.
        CommitmentState::Planned => rc.guarantee_before_confirm,
        _ => false,
    }
}

/// Decides which awaiting commitments the granted capacity covers, in
/// request order. A commitment is covered when the project's grant absorbs
/// its usage and all reservations including the candidate.
fn confirm_commitments(
    projects: &[&ProjectDistributionData],
    pool_az: Option<&AvailabilityZone>,
    grants: &[u64],
    rc: &ResourceConfig,
    now: EpochMillis,
    outcome: &mut DistributionOutcome,
) {
    for (project, grant) in projects.iter().zip(grants) {
        let az_rows: Vec<&AzDistributionData> = match pool_az {
            Some(az) => project.per_az.get(az).into_iter().collect(),
            None => project.per_az.values().collect(),
        };
        let mut usage = 0;
        let mut reserved = 0;
        let mut candidates = Vec::new();
        for az in &az_rows {
            usage += az.usage;
            for commitment in &az.commitments {
                if commitment.state.reserves_capacity() {
                    reserved += commitment.amount;
                } else if awaits_confirmation(commitment.state, rc) {
                    candidates.push(commitment);
                }
            }
        }
        candidates.sort_by_key(|c| (c.requested_at, c.id));

        for candidate in candidates {
            if usage.max(reserved + candidate.amount) > *grant {
                continue;
            }
            let (new_state, confirmed_at, expires_at) = match candidate.state {
                CommitmentState::Pending => (
                    CommitmentState::Confirmed,
                    Some(now),
                    Some(now.saturating_add(candidate.duration_secs * 1_000)),
                ),
                CommitmentState::Planned => (CommitmentState::Guaranteed, None, None),
                _ => continue,
            };
            if validate_transition(candidate.state, new_state).is_err() {
                continue;
            }
            reserved += candidate.amount;
            outcome.commitment_writes.push(CommitmentWrite {
                id: candidate.id,
                expected_state: candidate.state,
                new_state,
                confirmed_at,
                expires_at,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use limes_repr::{Balance, BackendQuota, ClusterConfig, Topology};
    use limes_store::entities::{
        CommitmentId, CommitmentState, ProjectAzResourceId, ProjectId, ProjectResourceId,
    };
    use limes_store::snapshot::{
        AzDistributionData, CommitmentDemand, DistributionSnapshot, ProjectDistributionData,
        ResourceDistributionData,
    };

    use super::{growth_target, plan};

    fn config(growth: f64, balance: Balance) -> ClusterConfig {
        serde_json::from_value(serde_json::json!({
            "services": {
                "shared": {
                    "endpoint": "http://localhost:1",
                    "resources": {
                        "capacity": {
                            "growth_multiplier": growth,
                            "balance": match balance {
                                Balance::Equalize => "equalize",
                                Balance::Retain => "retain",
                            },
                        }
                    }
                }
            }
        }))
        .unwrap()
    }

    fn project(
        n: u64,
        usage: u64,
        commitments: Vec<CommitmentDemand>,
    ) -> ProjectDistributionData {
        ProjectDistributionData {
            project_id: ProjectId(n),
            project_uuid: format!("proj-{n}").into(),
            resource_id: ProjectResourceId(n),
            version: 0,
            min_quota_from_backend: None,
            max_quota_from_admin: None,
            max_quota_from_outside_admin: None,
            override_quota: None,
            per_az: BTreeMap::from([(
                "any".into(),
                AzDistributionData {
                    az_resource_id: ProjectAzResourceId(n),
                    usage,
                    commitments,
                },
            )]),
        }
    }

    fn snapshot(capacity: u64, projects: Vec<ProjectDistributionData>) -> DistributionSnapshot {
        DistributionSnapshot {
            service_type: "shared".into(),
            taken_at: 1_000,
            resources: BTreeMap::from([(
                "capacity".into(),
                ResourceDistributionData {
                    topology: Topology::Flat,
                    has_quota: true,
                    capacity: BTreeMap::from([("any".into(), capacity)]),
                    projects,
                },
            )]),
        }
    }

    #[test]
    fn test_growth_target_rounds_up() {
        assert_eq!(growth_target(30, 1.25), 38);
        assert_eq!(growth_target(40, 1.25), 50);
        assert_eq!(growth_target(40, 1.0), 40);
        assert_eq!(growth_target(0, 2.0), 0);
    }

    #[test]
    fn test_plan_is_deterministic_and_covers_capacity() {
        let snapshot = snapshot(100, vec![project(1, 40, vec![]), project(2, 30, vec![])]);
        let config = config(1.25, Balance::Equalize);
        let outcome_a = plan(&snapshot, &config, 2_000);
        let outcome_b = plan(&snapshot, &config, 2_000);
        assert_eq!(outcome_a, outcome_b);

        let quotas: Vec<u64> = outcome_a.quota_writes.iter().map(|w| w.quota).collect();
        assert_eq!(quotas, vec![50, 50]);
        assert_eq!(
            outcome_a.quota_writes[0].desired_backend_quota,
            BackendQuota::Limited(50)
        );
    }

    #[test]
    fn test_plan_confirms_pending_commitments_in_request_order() {
        let pending = |id: u64, amount: u64, requested_at: u64| CommitmentDemand {
            id: CommitmentId(id),
            state: CommitmentState::Pending,
            amount,
            duration_secs: 3_600,
            confirm_by: None,
            requested_at,
        };
        // Capacity 100, usage 10: the earlier 60 fits, the later 50 does
        // not once 60 is reserved.
        let snapshot = snapshot(
            100,
            vec![project(1, 10, vec![pending(7, 50, 500), pending(5, 60, 100)])],
        );
        let outcome = plan(&snapshot, &config(1.0, Balance::Retain), 2_000);
        assert_eq!(outcome.commitment_writes.len(), 1);
        let write = &outcome.commitment_writes[0];
        assert_eq!(write.id, CommitmentId(5));
        assert_eq!(write.new_state, CommitmentState::Confirmed);
        assert_eq!(write.confirmed_at, Some(2_000));
        assert_eq!(write.expires_at, Some(2_000 + 3_600_000));
    }

    #[test]
    fn test_plan_skips_quota_less_and_capacity_less_resources() {
        let mut snap = snapshot(100, vec![project(1, 40, vec![])]);
        snap.resources.get_mut("capacity").unwrap().has_quota = false;
        assert!(plan(&snap, &config(1.0, Balance::Equalize), 2_000)
            .quota_writes
            .is_empty());

        let mut snap = snapshot(100, vec![project(1, 40, vec![])]);
        snap.resources.get_mut("capacity").unwrap().capacity.clear();
        assert!(plan(&snap, &config(1.0, Balance::Equalize), 2_000)
            .quota_writes
            .is_empty());
    }

    #[test]
    fn test_plan_applies_operator_bounds() {
        let mut p1 = project(1, 40, vec![]);
        p1.max_quota_from_admin = Some(45);
        let mut p2 = project(2, 30, vec![]);
        p2.override_quota = Some(7);
        let snapshot = snapshot(100, vec![p1, p2]);
        let outcome = plan(&snapshot, &config(1.25, Balance::Equalize), 2_000);
        let quotas: Vec<u64> = outcome.quota_writes.iter().map(|w| w.quota).collect();
        assert_eq!(quotas, vec![45, 7]);
    }
}
