// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The commitment lifecycle.
//!
//! ```text
//! planned    --| confirmation date reached          |--> pending
//! planned    --| capacity reserved early (opt-in)   |--> guaranteed
//! planned    --| user cancels                       |--> (deleted)
//! pending    --| distributor finds capacity         |--> confirmed
//! guaranteed --| confirmation date reached          |--> confirmed
//! pending    --| confirmation window lapses         |--> expired
//! confirmed  --| expiry date reached                |--> expired
//! confirmed  --| transfer creates successor         |--> superseded
//! ```
//!
//! Transitions driven by capacity live in the distributor pass; transitions
//! driven by timers live in [`CommitmentWorkflows::sweep`], which the cleanup
//! loop runs, so missed timers are compensated at the next tick. Every state
//! change goes through [`validate_transition`] and is persisted under an
//! optimistic state check; a race between the sweep and a pass loses cleanly.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use limes_liquid::{CommitmentChangeRequest, CommitmentReview, LiquidError, LiquidRegistry,
    RegistryError};
use limes_ore::now::{EpochMillis, NowFn};
use limes_repr::ClusterConfig;
use limes_store::entities::{
    Commitment, CommitmentId, CommitmentState, ProjectAzResourceId,
};
use limes_store::{
    AzResourceContext, CommitmentWrite, NewCommitment, Store, StoreError,
};

/// An error from a commitment operation.
#[derive(Debug, Error)]
pub enum CommitmentError {
    /// The requested state change is not part of the lifecycle.
    #[error("illegal commitment transition from {from} to {to}")]
    IllegalTransition {
        /// The current state.
        from: CommitmentState,
        /// The requested state.
        to: CommitmentState,
    },
    /// The backend's advisory review rejected the change.
    #[error("commitment change rejected by backend: {0}")]
    Rejected(String),
    /// The advisory review could not be performed.
    #[error("adapter failure during commitment review: {0}")]
    Review(#[from] LiquidError),
    /// No adapter is registered for the commitment's service.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Checks one state change against the lifecycle.
pub fn validate_transition(
    from: CommitmentState,
    to: CommitmentState,
) -> Result<(), CommitmentError> {
    use CommitmentState::*;
    let legal = matches!(
        (from, to),
        (Planned, Pending)
            | (Planned, Guaranteed)
            | (Pending, Confirmed)
            | (Guaranteed, Confirmed)
            | (Pending, Expired)
            | (Confirmed, Expired)
            | (Confirmed, Superseded)
    );
    if legal {
        Ok(())
    } else {
        Err(CommitmentError::IllegalTransition { from, to })
    }
}

/// A request to create a commitment.
#[derive(Clone, Debug, PartialEq)]
pub struct CommitmentRequest {
    /// The (project, resource, AZ) row to commit against.
    pub az_resource_id: ProjectAzResourceId,
    /// The amount, in effective units.
    pub amount: u64,
    /// The lifetime once confirmed.
    pub duration: Duration,
    /// The confirmation deadline. A future deadline creates the commitment
    /// as planned; otherwise it starts pending.
    pub confirm_by: Option<EpochMillis>,
    /// Whether to notify the requester on confirmation.
    pub notify_on_confirm: bool,
}

/// What one sweep changed.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SweepSummary {
    /// Planned commitments whose confirmation date arrived.
    pub moved_to_pending: usize,
    /// Guaranteed commitments confirmed at their scheduled date.
    pub confirmed: usize,
    /// Commitments expired, unconfirmed or lapsed.
    pub expired: usize,
}

/// User- and timer-driven commitment operations.
pub struct CommitmentWorkflows {
    store: Arc<dyn Store>,
    liquids: LiquidRegistry,
    config: ClusterConfig,
    clock: NowFn,
    review_deadline: Duration,
}

impl CommitmentWorkflows {
    /// Creates the workflows.
    pub fn new(
        store: Arc<dyn Store>,
        liquids: LiquidRegistry,
        config: ClusterConfig,
        clock: NowFn,
    ) -> CommitmentWorkflows {
        CommitmentWorkflows {
            store,
            liquids,
            config,
            clock,
            review_deadline: Duration::from_secs(30),
        }
    }

    /// Creates a commitment after a successful backend review.
    pub async fn create(&self, req: CommitmentRequest) -> Result<Commitment, CommitmentError> {
        let now = (self.clock)();
        let ctx = self.store.az_resource_context(req.az_resource_id).await?;
        self.review(&ctx, ctx.committed_total.saturating_add(req.amount))
            .await?;

        let initial_state = match req.confirm_by {
            Some(t) if t > now => CommitmentState::Planned,
            _ => CommitmentState::Pending,
        };
        let commitment = self
            .store
            .create_commitment(NewCommitment {
                az_resource_id: req.az_resource_id,
                amount: req.amount,
                duration_secs: req.duration.as_secs(),
                requested_at: now,
                confirm_by: req.confirm_by,
                initial_state,
                notify_on_confirm: req.notify_on_confirm,
            })
            .await?;
        info!(
            commitment = %commitment.uuid,
            state = %commitment.state,
            amount = commitment.amount,
            "commitment created"
        );
        // New demand: poke the distributor so confirmation is not left
        // waiting for the next scrape.
        self.store
            .schedule_distribution(ctx.service_type, now)
            .await?;
        Ok(commitment)
    }

    /// Cancels a commitment that has not left the planned state.
    pub async fn cancel(&self, id: CommitmentId) -> Result<(), CommitmentError> {
        self.store.delete_planned_commitment(id).await?;
        Ok(())
    }

    /// Starts a transfer: mints the one-shot token that a recipient redeems
    /// with [`CommitmentWorkflows::accept_transfer`].
    pub async fn start_transfer(&self, id: CommitmentId) -> Result<Uuid, CommitmentError> {
        let record = self.store.get_commitment(id).await?;
        if record.commitment.state != CommitmentState::Confirmed {
            return Err(CommitmentError::IllegalTransition {
                from: record.commitment.state,
                to: CommitmentState::Superseded,
            });
        }
        let token = Uuid::new_v4();
        self.store.set_transfer_token(id, Some(token)).await?;
        Ok(token)
    }

    /// Redeems a transfer token: the source commitment is superseded and a
    /// successor is bound to `dest`, after the backend reviews the
    /// receiving project's new committed total. The token is spent either
    /// way the store transaction goes.
    pub async fn accept_transfer(
        &self,
        token: Uuid,
        dest: ProjectAzResourceId,
    ) -> Result<Commitment, CommitmentError> {
        let now = (self.clock)();
        let source = self
            .store
            .list_commitments()
            .await?
            .into_iter()
            .find(|r| {
                r.commitment.transfer_token == Some(token)
                    && r.commitment.state == CommitmentState::Confirmed
            })
            .ok_or_else(|| StoreError::NotFound("transfer token".into()))?;
        validate_transition(source.commitment.state, CommitmentState::Superseded)?;

        let ctx = self.store.az_resource_context(dest).await?;
        self.review(
            &ctx,
            ctx.committed_total.saturating_add(source.commitment.amount),
        )
        .await?;

        let successor = self.store.accept_transfer(token, dest, now).await?;
        info!(
            predecessor = %source.commitment.uuid,
            successor = %successor.uuid,
            "commitment transferred"
        );
        self.store
            .schedule_distribution(ctx.service_type, now)
            .await?;
        Ok(successor)
    }

    /// Applies all timer-driven transitions that are due. Runs from the
    /// cleanup loop; conflicts with a concurrent distributor pass are
    /// skipped and picked up at the next tick.
    pub async fn sweep(&self, now: EpochMillis) -> Result<SweepSummary, CommitmentError> {
        let mut summary = SweepSummary::default();
        for record in self.store.list_lapsed_commitments(now).await? {
            let commitment = &record.commitment;
            let write = match commitment.state {
                CommitmentState::Planned => {
                    validate_transition(CommitmentState::Planned, CommitmentState::Pending)?;
                    CommitmentWrite {
                        id: commitment.id,
                        expected_state: CommitmentState::Planned,
                        new_state: CommitmentState::Pending,
                        confirmed_at: None,
                        expires_at: None,
                    }
                }
                CommitmentState::Guaranteed => {
                    validate_transition(CommitmentState::Guaranteed, CommitmentState::Confirmed)?;
                    // The commitment starts at its scheduled date, not at
                    // the sweep that happened to notice it.
                    let start = commitment.confirm_by.unwrap_or(now);
                    CommitmentWrite {
                        id: commitment.id,
                        expected_state: CommitmentState::Guaranteed,
                        new_state: CommitmentState::Confirmed,
                        confirmed_at: Some(start),
                        expires_at: Some(
                            start.saturating_add(commitment.duration_secs * 1_000),
                        ),
                    }
                }
                CommitmentState::Pending => {
                    let grace = self
                        .config
                        .resource(&record.service_type, &record.resource)
                        .confirmation_grace();
                    let grace = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
                    let deadline = commitment
                        .confirm_by
                        .unwrap_or(now)
                        .saturating_add(grace);
                    if deadline > now {
                        // Still within the grace window: the distributor
                        // gets another chance.
                        continue;
                    }
                    validate_transition(CommitmentState::Pending, CommitmentState::Expired)?;
                    CommitmentWrite {
                        id: commitment.id,
                        expected_state: CommitmentState::Pending,
                        new_state: CommitmentState::Expired,
                        confirmed_at: None,
                        expires_at: None,
                    }
                }
                CommitmentState::Confirmed => {
                    validate_transition(CommitmentState::Confirmed, CommitmentState::Expired)?;
                    CommitmentWrite {
                        id: commitment.id,
                        expected_state: CommitmentState::Confirmed,
                        new_state: CommitmentState::Expired,
                        confirmed_at: None,
                        expires_at: None,
                    }
                }
                CommitmentState::Superseded | CommitmentState::Expired => continue,
            };

            let new_state = write.new_state;
            match self.store.persist_commitment_transition(write).await {
                Ok(_) => {
                    debug!(commitment = %commitment.uuid, from = %commitment.state,
                        to = %new_state, "commitment swept");
                    match new_state {
                        CommitmentState::Pending => summary.moved_to_pending += 1,
                        CommitmentState::Confirmed => summary.confirmed += 1,
                        CommitmentState::Expired => summary.expired += 1,
                        _ => {}
                    }
                    // Demand changed either way: schedule a recomputation.
                    self.store
                        .schedule_distribution(record.service_type.clone(), now)
                        .await?;
                }
                Err(StoreError::Conflict(e)) => {
                    warn!(commitment = %commitment.uuid, error = %e,
                        "commitment changed concurrently, skipping sweep step");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(summary)
    }

    async fn review(
        &self,
        ctx: &AzResourceContext,
        committed_after: u64,
    ) -> Result<(), CommitmentError> {
        let liquid = self.liquids.get(&ctx.service_type)?;
        let info_version = self
            .store
            .services()
            .await?
            .into_iter()
            .find(|s| s.service_type == ctx.service_type)
            .map(|s| s.liquid_version)
            .unwrap_or(0);
        let review = liquid
            .review_commitment_change(
                CommitmentChangeRequest {
                    info_version,
                    project: ctx.project_uuid.clone(),
                    resource: ctx.resource.clone(),
                    az: ctx.az.clone(),
                    committed_before: ctx.committed_total,
                    committed_after,
                },
                self.review_deadline,
            )
            .await?;
        match review {
            CommitmentReview::Accepted => Ok(()),
            CommitmentReview::Rejected { reason } => Err(CommitmentError::Rejected(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use limes_liquid::testing::{flat_resource, service_info, ScriptedLiquid};
    use limes_liquid::{LiquidBinding, LiquidRegistry};
    use limes_ore::now::NowFn;
    use limes_repr::{ClusterConfig, Unit};
    use limes_store::entities::CommitmentState::{self, *};
    use limes_store::entities::ProjectAzResourceId;
    use limes_store::{
        CommitmentWrite, DeclaredResource, DiscoveredDomain, DiscoveredProject, MemoryStore,
        ObservedAz, ObservedResource, Store, UsageScrapeCommit,
    };

    use super::{validate_transition, CommitmentError, CommitmentRequest, CommitmentWorkflows};

    #[test]
    fn test_transition_matrix() {
        const ALL: [CommitmentState; 6] =
            [Planned, Pending, Guaranteed, Confirmed, Superseded, Expired];
        let legal = [
            (Planned, Pending),
            (Planned, Guaranteed),
            (Pending, Confirmed),
            (Guaranteed, Confirmed),
            (Pending, Expired),
            (Confirmed, Expired),
            (Confirmed, Superseded),
        ];
        for from in ALL {
            for to in ALL {
                let expected = legal.contains(&(from, to));
                assert_eq!(
                    validate_transition(from, to).is_ok(),
                    expected,
                    "transition {from} -> {to}"
                );
            }
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        liquid: Arc<ScriptedLiquid>,
        workflows: CommitmentWorkflows,
        clock_value: Arc<AtomicU64>,
        az_rows: Vec<ProjectAzResourceId>,
    }

    impl Fixture {
        fn advance(&self, by: Duration) {
            self.clock_value
                .fetch_add(u64::try_from(by.as_millis()).unwrap(), Ordering::SeqCst);
        }

        fn now(&self) -> u64 {
            self.clock_value.load(Ordering::SeqCst)
        }
    }

    /// Seeds a store with two projects, one scraped flat resource each, and
    /// wires workflows against a scripted adapter and a manual clock.
    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store
            .sync_discovered(
                1_000,
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
                }],
            )
            .await
            .unwrap();
        store.ensure_service(1_000, "shared".into(), 1).await.unwrap();
        store
            .ensure_project_services(1_000, &["shared".into()])
            .await
            .unwrap();

        let mut az_rows = Vec::new();
        while let Some(claim) = store.claim_due_scrape(1_000).await.unwrap() {
            store
                .commit_usage_scrape(UsageScrapeCommit {
                    project_service_id: claim.project_service.id,
                    now: 1_000,
                    next_scrape_at: u64::MAX,
                    declared: vec![DeclaredResource {
                        name: "capacity".into(),
                        unit: Unit::Bytes,
                        topology: Default::default(),
                        has_capacity: true,
                        has_quota: true,
                        initial_quota: Some(10),
                    }],
                    observed: vec![ObservedResource {
                        name: "capacity".into(),
                        backend_quota: None,
                        per_az: vec![ObservedAz {
                            az: "any".into(),
                            usage: 0,
                            physical_usage: None,
                            subresources: Vec::new(),
                            backend_quota: None,
                        }],
                    }],
                    serialized_state: None,
                    retention: Duration::from_secs(3_600),
                    distribution_due_at: u64::MAX,
                })
                .await
                .unwrap();
            let resource_id = store
                .project_resources(claim.project_service.id)
                .await
                .unwrap()[0]
                .id;
            az_rows.push(store.az_resources(resource_id).await.unwrap()[0].id);
        }
        assert_eq!(az_rows.len(), 2);

        let liquid = Arc::new(ScriptedLiquid::new(service_info(
            1,
            [("capacity", flat_resource(Unit::Bytes))],
        )));
        let mut liquids = LiquidRegistry::new();
        liquids.register(
            "shared".into(),
            LiquidBinding::InProcess(Arc::clone(&liquid) as _),
        );

        let clock_value = Arc::new(AtomicU64::new(1_000_000));
        let clock_for_fn = Arc::clone(&clock_value);
        let clock = NowFn::from(move || clock_for_fn.load(Ordering::SeqCst));
        let workflows = CommitmentWorkflows::new(
            Arc::clone(&store) as Arc<dyn Store>,
            liquids,
            ClusterConfig::default(),
            clock,
        );
        Fixture {
            store,
            liquid,
            workflows,
            clock_value,
            az_rows,
        }
    }

    #[tokio::test]
    async fn test_transfer_workflow() {
        let fx = fixture().await;
        let commitment = fx
            .workflows
            .create(CommitmentRequest {
                az_resource_id: fx.az_rows[0],
                amount: 8,
                duration: Duration::from_secs(3_600),
                confirm_by: None,
                notify_on_confirm: false,
            })
            .await
            .unwrap();
        assert_eq!(commitment.state, Pending);

        // Only confirmed commitments can be transferred.
        assert!(matches!(
            fx.workflows.start_transfer(commitment.id).await,
            Err(CommitmentError::IllegalTransition { .. })
        ));

        fx.store
            .persist_commitment_transition(CommitmentWrite {
                id: commitment.id,
                expected_state: Pending,
                new_state: Confirmed,
                confirmed_at: Some(fx.now()),
                expires_at: Some(fx.now() + 3_600_000),
            })
            .await
            .unwrap();

        let token = fx.workflows.start_transfer(commitment.id).await.unwrap();

        // A rejected review leaves the token unspent and the commitment
        // untouched.
        fx.liquid.reject_commitments("no transfers today");
        assert!(matches!(
            fx.workflows.accept_transfer(token, fx.az_rows[1]).await,
            Err(CommitmentError::Rejected(_))
        ));
        let record = fx.store.get_commitment(commitment.id).await.unwrap();
        assert_eq!(record.commitment.state, Confirmed);
        assert_eq!(record.commitment.transfer_token, Some(token));

        // An accepted review supersedes the source and binds the successor;
        // the token is still valid because the rejection spent nothing.
        fx.liquid.accept_commitments();
        let successor = fx
            .workflows
            .accept_transfer(token, fx.az_rows[1])
            .await
            .unwrap();
        assert_eq!(successor.az_resource_id, fx.az_rows[1]);
        assert_eq!(successor.predecessor_id, Some(commitment.id));
        assert_eq!(successor.state, Confirmed);
        let record = fx.store.get_commitment(commitment.id).await.unwrap();
        assert_eq!(record.commitment.state, Superseded);
        assert_eq!(record.commitment.transfer_token, None);
    }

    #[tokio::test]
    async fn test_sweep_compensates_missed_timers() {
        let fx = fixture().await;
        let planned = fx
            .workflows
            .create(CommitmentRequest {
                az_resource_id: fx.az_rows[0],
                amount: 8,
                duration: Duration::from_secs(3_600),
                confirm_by: Some(fx.now() + 60_000),
                notify_on_confirm: false,
            })
            .await
            .unwrap();
        assert_eq!(planned.state, Planned);

        // Before the confirmation date the sweep leaves it alone.
        let summary = fx.workflows.sweep(fx.now()).await.unwrap();
        assert_eq!(summary, Default::default());

        // Past the confirmation date it becomes eligible for confirmation.
        fx.advance(Duration::from_secs(61));
        let summary = fx.workflows.sweep(fx.now()).await.unwrap();
        assert_eq!(summary.moved_to_pending, 1);
        let record = fx.store.get_commitment(planned.id).await.unwrap();
        assert_eq!(record.commitment.state, Pending);

        // Within the grace window pending survives; past it, it expires.
        let summary = fx.workflows.sweep(fx.now()).await.unwrap();
        assert_eq!(summary.expired, 0);
        fx.advance(Duration::from_secs(3_601));
        let summary = fx.workflows.sweep(fx.now()).await.unwrap();
        assert_eq!(summary.expired, 1);
        let record = fx.store.get_commitment(planned.id).await.unwrap();
        assert_eq!(record.commitment.state, Expired);
    }

    #[tokio::test]
    async fn test_cancel_only_removes_planned() {
        let fx = fixture().await;
        let planned = fx
            .workflows
            .create(CommitmentRequest {
                az_resource_id: fx.az_rows[0],
                amount: 8,
                duration: Duration::from_secs(3_600),
                confirm_by: Some(fx.now() + 60_000),
                notify_on_confirm: false,
            })
            .await
            .unwrap();
        let pending = fx
            .workflows
            .create(CommitmentRequest {
                az_resource_id: fx.az_rows[0],
                amount: 4,
                duration: Duration::from_secs(3_600),
                confirm_by: None,
                notify_on_confirm: false,
            })
            .await
            .unwrap();

        fx.workflows.cancel(planned.id).await.unwrap();
        assert!(fx.workflows.cancel(pending.id).await.is_err());
        let remaining = fx.store.list_commitments().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].commitment.id, pending.id);
    }
}
