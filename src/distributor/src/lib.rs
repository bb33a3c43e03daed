// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The capacity distribution engine and commitment lifecycle.
//!
//! This crate turns cluster-wide capacity and aggregated demand into
//! per-project quotas. The computation is deterministic (same snapshot, same
//! configuration, same result, with the project UUID as the tie-break),
//! works on an immutable snapshot, and writes back under optimistic
//! concurrency, so it can race freely with the scrape loops.

pub mod apportion;
pub mod autogrow;
pub mod commitment;
pub mod distribute;

pub use commitment::{
    validate_transition, CommitmentError, CommitmentRequest, CommitmentWorkflows, SweepSummary,
};
pub use distribute::{
    growth_target, plan, DistributeError, Distributor, PassSummary, SnapshotCell,
};
