// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Integration tests for the control loop engine, driven tick by tick
//! against the in-memory store, the scripted adapter and a manual clock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use limes_collector::jobs::{run_once, TickOutcome};
use limes_collector::Engine;
use limes_distributor::CommitmentRequest;
use limes_liquid::testing::{flat_resource, service_info, ScriptedLiquid};
use limes_liquid::{
    AzCapacity, AzUsageReport, CapacityReport, LiquidBinding, LiquidError, LiquidRegistry,
    ResourceCapacityReport, ResourceUsageReport, UsageReport,
};
use limes_ore::now::NowFn;
use limes_repr::{BackendQuota, ClusterConfig, Unit};
use limes_store::entities::{CommitmentState, ProjectService};
use limes_store::{MemoryStore, Store};
use limes_collector::discovery::StaticDiscovery;

const START: u64 = 1_000_000_000;

struct Harness {
    store: Arc<MemoryStore>,
    liquid: Arc<ScriptedLiquid>,
    engine: Engine,
    clock_value: Arc<AtomicU64>,
    clock: NowFn,
}

impl Harness {
    fn new() -> Harness {
        let config: ClusterConfig = serde_json::from_value(serde_json::json!({
            "services": {
                "shared": {
                    "resources": {
                        "capacity": {"growth_multiplier": 1.25, "initial_quota": 10}
                    }
                }
            },
            "availability_zones": ["az-one"],
            "discovery": {
                "grace_period_secs": 3600,
                "static_domains": [{
                    "uuid": "dom-1",
                    "name": "default",
                    "projects": [
                        {"uuid": "proj-a", "name": "alpha"},
                        {"uuid": "proj-b", "name": "beta"}
                    ]
                }]
            },
            "intervals": {
                "scrape_secs": 1800,
                "capacity_secs": 900,
                "discovery_secs": 180,
                "cleanup_secs": 60,
                "distribution_debounce_secs": 1,
                "error_backoff_secs": 300,
                "max_runtime_secs": 240,
                "scrape_workers": 2,
                "quota_sync_workers": 1
            }
        }))
        .expect("valid test config");

        let clock_value = Arc::new(AtomicU64::new(START));
        let clock_for_fn = Arc::clone(&clock_value);
        let clock = NowFn::from(move || clock_for_fn.load(Ordering::SeqCst));

        let store = Arc::new(MemoryStore::new());
        let liquid = Arc::new(ScriptedLiquid::new(service_info(
            1,
            [("capacity", flat_resource(Unit::Bytes))],
        )));
        let mut liquids = LiquidRegistry::new();
        liquids.register(
            "shared".into(),
            LiquidBinding::InProcess(Arc::clone(&liquid) as _),
        );
        let discovery = Arc::new(StaticDiscovery::from_config(&config.discovery));

        let engine = Engine::new(
            Arc::clone(&store) as _,
            liquids,
            discovery,
            config,
            clock.clone(),
            &prometheus::Registry::new(),
            true,
        );
        Harness {
            store,
            liquid,
            engine,
            clock_value,
            clock,
        }
    }

    fn advance(&self, by: Duration) {
        self.clock_value
            .fetch_add(u64::try_from(by.as_millis()).unwrap(), Ordering::SeqCst);
    }

    fn now(&self) -> u64 {
        self.clock_value.load(Ordering::SeqCst)
    }

    async fn bootstrap(&self) {
        self.engine.startup().await.unwrap();
        let outcome = run_once(&self.engine.discovery_job(), &self.clock)
            .await
            .unwrap();
        assert!(matches!(outcome, TickOutcome::Completed));
    }

    async fn pair(&self, project_uuid: &str) -> ProjectService {
        let project = self
            .store
            .projects()
            .await
            .unwrap()
            .into_iter()
            .find(|p| p.uuid.as_str() == project_uuid)
            .expect("project exists");
        self.store
            .project_services()
            .await
            .unwrap()
            .into_iter()
            .find(|ps| ps.project_id == project.id)
            .expect("pair exists")
    }

    async fn scrape_all(&self) {
        let job = self.engine.scrape_job();
        loop {
            match run_once(&job, &self.clock).await.unwrap() {
                TickOutcome::Idle => break,
                TickOutcome::Completed => continue,
                TickOutcome::Failed(e) => panic!("unexpected scrape failure: {e}"),
            }
        }
    }
}

fn usage_report(usage: u64, backend_quota: i64) -> UsageReport {
    UsageReport {
        info_version: 1,
        resources: BTreeMap::from([(
            "capacity".into(),
            ResourceUsageReport {
                quota: Some(backend_quota),
                per_az: BTreeMap::from([(
                    "any".into(),
                    AzUsageReport {
                        usage,
                        ..Default::default()
                    },
                )]),
            },
        )]),
        serialized_state: None,
    }
}

fn capacity_report(capacity: u64) -> CapacityReport {
    CapacityReport {
        info_version: 1,
        resources: BTreeMap::from([(
            "capacity".into(),
            ResourceCapacityReport {
                per_az: BTreeMap::from([(
                    "any".into(),
                    AzCapacity {
                        capacity,
                        ..Default::default()
                    },
                )]),
            },
        )]),
    }
}

// Scenario: empty cluster start. Discovery finds two projects; after one
// scrape both carry the initial quota from configuration, with the backend
// quota recorded and no drift.
#[tokio::test]
async fn empty_cluster_bootstrap() {
    let harness = Harness::new();
    harness.liquid.set_usage("proj-a", usage_report(0, 10));
    harness.liquid.set_usage("proj-b", usage_report(0, 10));
    harness.bootstrap().await;

    assert_eq!(harness.store.projects().await.unwrap().len(), 2);
    harness.scrape_all().await;

    for project in ["proj-a", "proj-b"] {
        let pair = harness.pair(project).await;
        let resources = harness.store.project_resources(pair.id).await.unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].quota, Some(10));
        assert_eq!(resources[0].backend_quota, Some(BackendQuota::Limited(10)));
        assert_eq!(
            resources[0].desired_backend_quota,
            Some(BackendQuota::Limited(10))
        );
        assert!(pair.quota_desynced_at.is_none());
        assert!(pair.scraped_at.is_some());
    }
}

// Scenario: capacity pressure. Two projects with usage 40 and 30 under a
// 1.25 growth multiplier share capacity 100 as 50/50; the backend lags, so
// the drift marker is set and quota sync pushes the new values. When usage
// then shifts to 60 and 30 the growth tier no longer fits and the next pass
// yields 60/40.
#[tokio::test]
async fn capacity_distribution_end_to_end() {
    let harness = Harness::new();
    harness.liquid.set_usage("proj-a", usage_report(40, 10));
    harness.liquid.set_usage("proj-b", usage_report(30, 10));
    harness.liquid.set_capacity(capacity_report(100));
    harness.bootstrap().await;
    harness.scrape_all().await;

    let outcome = run_once(&harness.engine.capacity_job(), &harness.clock)
        .await
        .unwrap();
    assert!(matches!(outcome, TickOutcome::Completed));

    // The distribution becomes due after the debounce.
    harness.advance(Duration::from_secs(2));
    let outcome = run_once(&harness.engine.distribution_job(), &harness.clock)
        .await
        .unwrap();
    assert!(matches!(outcome, TickOutcome::Completed));

    let mut quotas = Vec::new();
    for project in ["proj-a", "proj-b"] {
        let pair = harness.pair(project).await;
        let resources = harness.store.project_resources(pair.id).await.unwrap();
        quotas.push(resources[0].quota.unwrap());
        // Desired (50) differs from the backend's 10: drift detected.
        assert!(pair.quota_desynced_at.is_some());
    }
    assert_eq!(quotas, vec![50, 50]);

    // Quota sync pushes both pairs.
    let job = harness.engine.quota_sync_job();
    for _ in 0..2 {
        let outcome = run_once(&job, &harness.clock).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Completed));
    }
    let calls = harness.liquid.quota_calls();
    assert_eq!(calls.len(), 2);
    for (_, request) in &calls {
        assert_eq!(request.resources["capacity"].quota, 50);
    }
    for project in ["proj-a", "proj-b"] {
        let pair = harness.pair(project).await;
        assert!(pair.quota_desynced_at.is_none());
        let resources = harness.store.project_resources(pair.id).await.unwrap();
        assert_eq!(resources[0].backend_quota, Some(BackendQuota::Limited(50)));
    }

    // Usage shifts to 60/30: the remaining 10 cannot cover the growth
    // deltas anymore, so it equalizes the holdings and the next pass yields
    // 60/40.
    harness.liquid.set_usage("proj-a", usage_report(60, 50));
    harness.liquid.set_usage("proj-b", usage_report(30, 50));
    harness.advance(Duration::from_secs(2_000));
    harness.scrape_all().await;

    harness.advance(Duration::from_secs(2));
    let outcome = run_once(&harness.engine.distribution_job(), &harness.clock)
        .await
        .unwrap();
    assert!(matches!(outcome, TickOutcome::Completed));

    let mut quotas = Vec::new();
    for project in ["proj-a", "proj-b"] {
        let pair = harness.pair(project).await;
        let resources = harness.store.project_resources(pair.id).await.unwrap();
        quotas.push(resources[0].quota.unwrap());
        // Desired moved away from the synced backend value of 50 again.
        assert!(pair.quota_desynced_at.is_some());
    }
    assert_eq!(quotas, vec![60, 40]);
}

// Scenario: backend unreachable. Five consecutive transient failures grow
// the cursor's backoff exponentially (capped), populate the error ring, and
// leave resource rows and the other project untouched.
#[tokio::test]
async fn scrape_backoff_on_transient_errors() {
    let harness = Harness::new();
    harness.liquid.set_usage("proj-a", usage_report(5, 10));
    harness.liquid.set_usage("proj-b", usage_report(5, 10));
    harness.bootstrap().await;
    harness.scrape_all().await;

    let pair_a = harness.pair("proj-a").await;
    let resources_before = harness.store.project_resources(pair_a.id).await.unwrap();

    for _ in 0..5 {
        harness
            .liquid
            .enqueue_usage("proj-a", Err(LiquidError::Connect("connection refused".into())));
    }

    // Expected backoff after the n-th consecutive failure: 300s × 2^(n−1),
    // capped at the 1800s scrape interval.
    let expected_backoffs = [300_u64, 600, 1_200, 1_800, 1_800];
    let job = harness.engine.scrape_job();
    for (n, backoff_secs) in expected_backoffs.iter().enumerate() {
        // Make both cursors due; proj-b keeps succeeding.
        harness.advance(Duration::from_secs(2_000));
        let mut saw_failure = false;
        loop {
            match run_once(&job, &harness.clock).await.unwrap() {
                TickOutcome::Idle => break,
                TickOutcome::Completed => continue,
                TickOutcome::Failed(_) => saw_failure = true,
            }
        }
        assert!(saw_failure, "attempt {n} should have failed");

        let pair = harness.pair("proj-a").await;
        assert_eq!(pair.consecutive_errors, u32::try_from(n).unwrap() + 1);
        assert_eq!(pair.next_scrape_at, harness.now() + backoff_secs * 1_000);
        assert!(pair.scrape_error.as_deref().unwrap().contains("connection refused"));

        // The healthy project advanced normally in the same rounds.
        let pair_b = harness.pair("proj-b").await;
        assert_eq!(pair_b.consecutive_errors, 0);
        assert!(pair_b.scrape_error.is_none());
    }

    let pair = harness.pair("proj-a").await;
    assert_eq!(pair.recent_errors.len(), 5);
    let resources_after = harness.store.project_resources(pair.id).await.unwrap();
    assert_eq!(resources_before, resources_after);
}

// Scenario: quota drift and sync. An operator grant moves the desired
// backend quota ahead of the backend; quota sync converges them and clears
// the marker.
#[tokio::test]
async fn drift_detection_and_quota_sync() {
    let harness = Harness::new();
    harness.liquid.set_usage("proj-a", usage_report(20, 150));
    harness.liquid.set_usage("proj-b", usage_report(0, 10));
    harness.bootstrap().await;
    harness.scrape_all().await;

    let pair = harness.pair("proj-a").await;
    let resource_id = harness.store.project_resources(pair.id).await.unwrap()[0].id;
    harness
        .store
        .set_quota_by_operator(resource_id, 200, BackendQuota::Limited(200), harness.now())
        .await
        .unwrap();

    let pair = harness.pair("proj-a").await;
    assert_eq!(pair.quota_desynced_at, Some(harness.now()));

    let outcome = run_once(&harness.engine.quota_sync_job(), &harness.clock)
        .await
        .unwrap();
    assert!(matches!(outcome, TickOutcome::Completed));

    let calls = harness.liquid.quota_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0.as_str(), "proj-a");
    assert_eq!(calls[0].1.resources["capacity"].quota, 200);

    let pair = harness.pair("proj-a").await;
    assert!(pair.quota_desynced_at.is_none());
    let resources = harness.store.project_resources(pair.id).await.unwrap();
    assert_eq!(resources[0].backend_quota, Some(BackendQuota::Limited(200)));
}

// Scenario: quota sync failure leaves the desync marker set and backs off.
#[tokio::test]
async fn quota_sync_failure_keeps_marker() {
    let harness = Harness::new();
    harness.liquid.set_usage("proj-a", usage_report(20, 150));
    harness.liquid.set_usage("proj-b", usage_report(0, 10));
    harness.bootstrap().await;
    harness.scrape_all().await;

    let pair = harness.pair("proj-a").await;
    let resource_id = harness.store.project_resources(pair.id).await.unwrap()[0].id;
    harness
        .store
        .set_quota_by_operator(resource_id, 200, BackendQuota::Limited(200), harness.now())
        .await
        .unwrap();

    harness
        .liquid
        .enqueue_quota_error(LiquidError::Status { code: 503, body: "overloaded".into() });
    let outcome = run_once(&harness.engine.quota_sync_job(), &harness.clock)
        .await
        .unwrap();
    assert!(matches!(outcome, TickOutcome::Failed(_)));

    let pair = harness.pair("proj-a").await;
    assert!(pair.quota_desynced_at.is_some());
    assert_eq!(pair.quota_sync_errors, 1);
    assert_eq!(pair.quota_sync_after, harness.now() + 300_000);

    // Until the backoff passes, the pair is not claimable.
    let outcome = run_once(&harness.engine.quota_sync_job(), &harness.clock)
        .await
        .unwrap();
    assert!(matches!(outcome, TickOutcome::Idle));

    harness.advance(Duration::from_secs(301));
    let outcome = run_once(&harness.engine.quota_sync_job(), &harness.clock)
        .await
        .unwrap();
    assert!(matches!(outcome, TickOutcome::Completed));
}

// Scenario: commitment confirmation and expiry. A pending commitment is
// confirmed by the distributor once capacity allows, and the cleanup sweep
// expires it once its lifetime lapses.
#[tokio::test]
async fn commitment_expiry_sweep() {
    let harness = Harness::new();
    harness.liquid.set_usage("proj-a", usage_report(10, 10));
    harness.liquid.set_usage("proj-b", usage_report(10, 10));
    harness.liquid.set_capacity(capacity_report(100));
    harness.bootstrap().await;
    harness.scrape_all().await;
    run_once(&harness.engine.capacity_job(), &harness.clock)
        .await
        .unwrap();

    let pair = harness.pair("proj-a").await;
    let resource_id = harness.store.project_resources(pair.id).await.unwrap()[0].id;
    let az_row_id = harness.store.az_resources(resource_id).await.unwrap()[0].id;

    let workflows = harness.engine.commitments();
    let commitment = workflows
        .create(CommitmentRequest {
            az_resource_id: az_row_id,
            amount: 40,
            duration: Duration::from_secs(3_600),
            confirm_by: None,
            notify_on_confirm: false,
        })
        .await
        .unwrap();
    assert_eq!(commitment.state, CommitmentState::Pending);

    // The creation armed the distributor; the pass confirms the commitment.
    harness.advance(Duration::from_secs(1));
    let outcome = run_once(&harness.engine.distribution_job(), &harness.clock)
        .await
        .unwrap();
    assert!(matches!(outcome, TickOutcome::Completed));
    let record = harness.store.get_commitment(commitment.id).await.unwrap();
    assert_eq!(record.commitment.state, CommitmentState::Confirmed);
    let expires_at = record.commitment.expires_at.unwrap();
    assert_eq!(expires_at, harness.now() + 3_600_000);

    // Before expiry the sweep does nothing to it.
    run_once(&harness.engine.cleanup_job(), &harness.clock)
        .await
        .unwrap();
    let record = harness.store.get_commitment(commitment.id).await.unwrap();
    assert_eq!(record.commitment.state, CommitmentState::Confirmed);

    // Past expiry the sweep transitions it and re-arms the distributor,
    // whose next pass shrinks the project's share.
    harness.advance(Duration::from_secs(3_700));
    run_once(&harness.engine.cleanup_job(), &harness.clock)
        .await
        .unwrap();
    let record = harness.store.get_commitment(commitment.id).await.unwrap();
    assert_eq!(record.commitment.state, CommitmentState::Expired);
    assert_eq!(
        harness
            .engine
            .metrics()
            .commitment_gauge("shared", CommitmentState::Expired),
        1
    );

    let outcome = run_once(&harness.engine.distribution_job(), &harness.clock)
        .await
        .unwrap();
    assert!(matches!(outcome, TickOutcome::Completed));
}

// Scenario: commitment creation is vetoed by the backend's advisory review.
#[tokio::test]
async fn commitment_rejected_by_review() {
    let harness = Harness::new();
    harness.liquid.set_usage("proj-a", usage_report(10, 10));
    harness.liquid.set_usage("proj-b", usage_report(10, 10));
    harness.bootstrap().await;
    harness.scrape_all().await;
    harness.liquid.reject_commitments("domain cap exceeded");

    let pair = harness.pair("proj-a").await;
    let resource_id = harness.store.project_resources(pair.id).await.unwrap()[0].id;
    let az_row_id = harness.store.az_resources(resource_id).await.unwrap()[0].id;

    let err = harness
        .engine
        .commitments()
        .create(CommitmentRequest {
            az_resource_id: az_row_id,
            amount: 40,
            duration: Duration::from_secs(3_600),
            confirm_by: None,
            notify_on_confirm: false,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("domain cap exceeded"));
    assert!(harness.store.list_commitments().await.unwrap().is_empty());
}

// Scheduler fairness: with every cursor due simultaneously, a small worker
// fleet serves all of them promptly and exactly once.
#[tokio::test(flavor = "multi_thread")]
async fn workers_drain_all_due_cursors() {
    let harness = Harness::new();
    harness.liquid.set_usage("proj-a", usage_report(1, 10));
    harness.liquid.set_usage("proj-b", usage_report(2, 10));
    harness.bootstrap().await;

    let shutdown = tokio_util::sync::CancellationToken::new();
    let handles = limes_collector::spawn_workers(
        Arc::new(harness.engine.scrape_job()),
        2,
        harness.clock.clone(),
        shutdown.clone(),
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let pairs = harness.store.project_services().await.unwrap();
        if pairs.iter().all(|ps| ps.scraped_at.is_some()) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "workers did not drain the due cursors in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown.cancel();
    for handle in handles {
        handle.await.unwrap();
    }

    for project in ["proj-a", "proj-b"] {
        let pair = harness.pair(project).await;
        assert_eq!(pair.consecutive_errors, 0);
        assert!(pair.scrape_error.is_none());
    }
}
