// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Durable accounting state.
//!
//! The store is the sole owner of persisted state. Components hold only
//! short-lived snapshots and write through the transactional operations of
//! the [`Store`] trait; nothing outside this crate mutates rows directly.
//!
//! The [`MemoryStore`] implementation backs tests and single-process
//! deployments. A relational implementation lives behind the same trait and
//! is deliberately out of scope here; the trait is written so that each
//! method maps onto one database transaction.

pub mod entities;
pub mod snapshot;

mod memory;
#[allow(clippy::module_inception)]
mod store;

pub use memory::MemoryStore;
pub use store::{
    AggregateDemand, AzResourceContext, CapacityScrapeCommit, CommitmentRecord, CommitmentWrite,
    DeclaredResource,
    DiscoveredDomain, DiscoveredProject, DiscoverySummary, DistributionOutcome, NewCommitment,
    ObservedAz, ObservedClusterAz, ObservedClusterResource, ObservedResource,
    ProjectResourceMetric, QuotaSyncClaim, QuotaWrite, ScrapeClaim, Store, StoreError,
    UsageScrapeCommit,
};
