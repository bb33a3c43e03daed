// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The adapter ("liquid") contract.
//!
//! Each backend service is fronted by a liquid: a process that translates
//! between the backend's native API and the five operations the core needs.
//! The core holds a [`Liquid`] client per service type and knows nothing else
//! about the backend.
//!
//! Liquids must be safe to call concurrently from independent project
//! contexts. Every call takes a deadline; the transport implementation turns
//! deadline overruns into [`LiquidError::Timeout`], which the collector
//! treats as transient.
//!
//! Responses embed the service info version they were produced under. The
//! caller rejects responses whose version differs from the most recently
//! retrieved [`ServiceInfo`], which is what makes resource declarations and
//! reports consistent without a coordination protocol.

use std::time::Duration;

use async_trait::async_trait;
use limes_repr::ProjectUuid;

mod client;
mod error;
mod registry;
mod types;

pub mod testing;

pub use client::HttpLiquid;
pub use error::LiquidError;
pub use registry::{LiquidBinding, LiquidRegistry, RegistryError};
pub use types::{
    AzCapacity, AzUsageReport, CapacityReport, CapacityRequest, CommitmentChangeRequest,
    CommitmentReview, DemandSignal, ProjectMetadata, QuotaTarget, RateInfo, ResourceCapacityReport,
    ResourceInfo, ResourceUsageReport, ServiceInfo, SetQuotaRequest, SetQuotaResponse,
    UsageReport, UsageRequest,
};

/// The contract every backend adapter implements.
#[async_trait]
pub trait Liquid: Send + Sync {
    /// Describes the service: its resources, rates and capability flags.
    ///
    /// Called once at startup and again whenever a response reports a newer
    /// version than the one on file.
    async fn build_service_info(&self, deadline: Duration) -> Result<ServiceInfo, LiquidError>;

    /// Reports cluster-wide capacity, per resource and availability zone.
    async fn scan_capacity(
        &self,
        req: CapacityRequest,
        deadline: Duration,
    ) -> Result<CapacityReport, LiquidError>;

    /// Reports one project's quota and usage, per resource and availability
    /// zone.
    async fn scan_usage(
        &self,
        project: &ProjectUuid,
        req: UsageRequest,
        deadline: Duration,
    ) -> Result<UsageReport, LiquidError>;

    /// Applies quotas in the backend. Idempotent: applying the same request
    /// twice is indistinguishable from applying it once.
    async fn set_quota(
        &self,
        project: &ProjectUuid,
        req: SetQuotaRequest,
        deadline: Duration,
    ) -> Result<SetQuotaResponse, LiquidError>;

    /// Advisory review of a commitment change. The adapter may reject
    /// changes that violate backend-side policy.
    async fn review_commitment_change(
        &self,
        req: CommitmentChangeRequest,
        deadline: Duration,
    ) -> Result<CommitmentReview, LiquidError>;
}
