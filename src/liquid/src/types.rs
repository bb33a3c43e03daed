// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Wire payloads of the adapter protocol.
//!
//! These types are serialized as JSON on the adapter transport. The `-1`
//! quota sentinel exists only here; use [`BackendQuota::from_wire`] and
//! [`BackendQuota::to_wire`] at the boundary.
//!
//! [`BackendQuota::from_wire`]: limes_repr::BackendQuota::from_wire
//! [`BackendQuota::to_wire`]: limes_repr::BackendQuota::to_wire

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use limes_repr::{
    AvailabilityZone, DomainUuid, ProjectUuid, ResourceName, Topology, Unit,
};

/// A service's self-description.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Monotonically increasing version of this description. Reports carry
    /// the version they were produced under.
    pub version: u64,
    /// The resources the service tracks.
    pub resources: BTreeMap<ResourceName, ResourceInfo>,
    /// The rates the service tracks.
    #[serde(default)]
    pub rates: BTreeMap<String, RateInfo>,
    /// Whether usage scans need the project metadata snapshot.
    #[serde(default)]
    pub usage_report_needs_project_metadata: bool,
    /// Whether quota updates need the project metadata snapshot.
    #[serde(default)]
    pub quota_update_needs_project_metadata: bool,
}

/// A resource declaration within a [`ServiceInfo`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceInfo {
    /// The unit of measurement.
    pub unit: Unit,
    /// How values are tracked across availability zones.
    pub topology: Topology,
    /// Whether capacity scans report this resource.
    pub has_capacity: bool,
    /// Whether the backend enforces a quota for this resource.
    pub has_quota: bool,
}

/// A rate declaration within a [`ServiceInfo`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RateInfo {
    /// The unit of measurement.
    pub unit: Unit,
}

/// The project metadata snapshot passed to adapters that request it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    /// The project's stable identifier.
    pub uuid: ProjectUuid,
    /// The project's display name.
    pub name: String,
    /// The domain the project belongs to.
    pub domain_uuid: DomainUuid,
    /// The parent project, if nested.
    #[serde(default)]
    pub parent_uuid: Option<ProjectUuid>,
}

/// The aggregate demand for one resource in one availability zone, passed to
/// capacity scans for resources that declare a need for it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DemandSignal {
    /// Total usage across all projects.
    pub usage: u64,
    /// Total confirmed-but-unused commitments across all projects.
    pub unused_commitments: u64,
    /// Total commitments requested but not yet confirmed.
    pub pending_commitments: u64,
}

/// Request payload for capacity scans.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CapacityRequest {
    /// The service info version the caller has on file.
    pub info_version: u64,
    /// All availability zones known to the cluster.
    pub all_azs: Vec<AvailabilityZone>,
    /// Aggregate demand per resource and AZ, for resources that need it.
    #[serde(default)]
    pub demands: BTreeMap<ResourceName, BTreeMap<AvailabilityZone, DemandSignal>>,
}

/// Response payload of capacity scans.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CapacityReport {
    /// The service info version this report was produced under.
    pub info_version: u64,
    /// Capacity per resource.
    pub resources: BTreeMap<ResourceName, ResourceCapacityReport>,
}

/// Capacity for one resource.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceCapacityReport {
    /// Capacity per availability zone, in raw units.
    pub per_az: BTreeMap<AvailabilityZone, AzCapacity>,
}

/// Capacity for one resource in one availability zone.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AzCapacity {
    /// Raw capacity.
    pub capacity: u64,
    /// Usage as seen by the capacity scan, if the adapter reports it.
    #[serde(default)]
    pub usage: Option<u64>,
    /// Opaque subcapacity breakdown.
    #[serde(default)]
    pub subcapacities: Vec<serde_json::Value>,
}

/// Request payload for usage scans.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageRequest {
    /// The service info version the caller has on file.
    pub info_version: u64,
    /// All availability zones known to the cluster.
    pub all_azs: Vec<AvailabilityZone>,
    /// Project metadata, present iff the service info requests it.
    #[serde(default)]
    pub project_metadata: Option<ProjectMetadata>,
    /// The serialized state the adapter returned from the previous scan of
    /// this project, if any. Adapters use this to carry running counters
    /// across scrapes.
    #[serde(default)]
    pub serialized_state: Option<serde_json::Value>,
}

/// Response payload of usage scans.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    /// The service info version this report was produced under.
    pub info_version: u64,
    /// Usage per resource.
    pub resources: BTreeMap<ResourceName, ResourceUsageReport>,
    /// Opaque state to pass back on the next scan.
    #[serde(default)]
    pub serialized_state: Option<serde_json::Value>,
}

/// Usage of one resource by one project.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsageReport {
    /// The backend's current project-level quota. `-1` means unlimited;
    /// absent means the backend enforces no quota for this resource.
    #[serde(default)]
    pub quota: Option<i64>,
    /// Usage per availability zone.
    pub per_az: BTreeMap<AvailabilityZone, AzUsageReport>,
}

/// Usage of one resource in one availability zone.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AzUsageReport {
    /// Current usage.
    pub usage: u64,
    /// Physically used portion of the usage, if the backend distinguishes
    /// (e.g. thin-provisioned volumes). Never exceeds `usage`.
    #[serde(default)]
    pub physical_usage: Option<u64>,
    /// Opaque subresource listing.
    #[serde(default)]
    pub subresources: Vec<serde_json::Value>,
    /// The backend's per-AZ quota, for az-separated resources only. `-1`
    /// means unlimited.
    #[serde(default)]
    pub backend_quota: Option<i64>,
}

/// Request payload for quota updates.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SetQuotaRequest {
    /// The service info version the caller has on file.
    pub info_version: u64,
    /// Project metadata, present iff the service info requests it.
    #[serde(default)]
    pub project_metadata: Option<ProjectMetadata>,
    /// The quotas to apply, per resource. `-1` means unlimited.
    pub resources: BTreeMap<ResourceName, QuotaTarget>,
}

/// The quota to apply for one resource.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaTarget {
    /// The project-level quota. `-1` means unlimited.
    pub quota: i64,
    /// Per-AZ quotas, for az-separated resources only.
    #[serde(default)]
    pub per_az: Option<BTreeMap<AvailabilityZone, i64>>,
}

/// Response payload of quota updates.
///
/// A successful update means the backend accepted exactly the requested
/// values, except for resources listed in `floors`, which were clamped up to
/// the backend's minimum.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SetQuotaResponse {
    /// Backend-side minimums that clamped the request, per resource.
    #[serde(default)]
    pub floors: BTreeMap<ResourceName, u64>,
}

/// Request payload for commitment reviews.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitmentChangeRequest {
    /// The service info version the caller has on file.
    pub info_version: u64,
    /// The project whose committed total changes.
    pub project: ProjectUuid,
    /// The resource being committed.
    pub resource: ResourceName,
    /// The availability zone being committed.
    pub az: AvailabilityZone,
    /// The project's committed total before the change.
    pub committed_before: u64,
    /// The project's committed total after the change.
    pub committed_after: u64,
}

/// The adapter's verdict on a commitment change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "kebab-case")]
pub enum CommitmentReview {
    /// The change may proceed.
    Accepted,
    /// The change violates backend-side policy.
    Rejected {
        /// A human-readable explanation, surfaced to the requester.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::{AzUsageReport, CommitmentReview, ResourceUsageReport, UsageReport};

    #[test]
    fn test_usage_report_wire_shape() {
        let json = r#"{
            "info_version": 3,
            "resources": {
                "capacity": {
                    "quota": -1,
                    "per_az": {"az-one": {"usage": 42, "physical_usage": 40}}
                }
            }
        }"#;
        let report: UsageReport = serde_json::from_str(json).unwrap();
        let resource: &ResourceUsageReport = &report.resources["capacity"];
        assert_eq!(resource.quota, Some(-1));
        let az: &AzUsageReport = &resource.per_az["az-one"];
        assert_eq!(az.usage, 42);
        assert_eq!(az.physical_usage, Some(40));
        assert!(az.subresources.is_empty());
        assert!(report.serialized_state.is_none());
    }

    #[test]
    fn test_review_verdict_tagging() {
        let accepted = serde_json::to_value(CommitmentReview::Accepted).unwrap();
        assert_eq!(accepted["verdict"], "accepted");
        let rejected: CommitmentReview =
            serde_json::from_str(r#"{"verdict": "rejected", "reason": "domain cap"}"#).unwrap();
        assert_eq!(
            rejected,
            CommitmentReview::Rejected {
                reason: "domain cap".into()
            }
        );
    }
}
