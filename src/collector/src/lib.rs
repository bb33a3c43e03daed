// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The control loop engine.
//!
//! The collector keeps thousands of per-(project, service) cursors moving
//! forward concurrently: discovery mirrors the identity provider, the scrape
//! loops pull usage and capacity from the backend adapters, the quota sync
//! loop pushes reconciled quotas back, and the consistency sweep repairs
//! whatever partial failure left behind. One generic job engine drives all
//! of them; see [`jobs`].
//!
//! Failure containment is the organizing principle: an individual cursor's
//! failure is recorded on that cursor and never propagates to another.

pub mod capacity;
pub mod cleanup;
pub mod discovery;
pub mod distribution;
pub mod engine;
pub mod info;
pub mod jobs;
pub mod metrics;
pub mod quota_sync;
pub mod scrape;

pub use engine::{Engine, EngineError};
pub use jobs::{run_once, spawn_workers, JobDefinition, JobError, TickOutcome};
pub use metrics::{render_data_metrics, CollectorMetrics};
