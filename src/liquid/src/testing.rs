// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A scripted adapter for tests.
//!
//! [`ScriptedLiquid`] plays back queued responses and records the requests it
//! receives, which is all the collector and distributor tests need to drive
//! the loops through their failure paths without a network.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use limes_repr::{ProjectUuid, ResourceName, Topology, Unit};

use crate::error::LiquidError;
use crate::types::{
    CapacityReport, CapacityRequest, CommitmentChangeRequest, CommitmentReview, ResourceInfo,
    ServiceInfo, SetQuotaRequest, SetQuotaResponse, UsageReport, UsageRequest,
};
use crate::Liquid;

/// Builds a [`ServiceInfo`] from resource declarations.
pub fn service_info(
    version: u64,
    resources: impl IntoIterator<Item = (&'static str, ResourceInfo)>,
) -> ServiceInfo {
    ServiceInfo {
        version,
        resources: resources
            .into_iter()
            .map(|(name, info)| (ResourceName::from(name), info))
            .collect(),
        ..Default::default()
    }
}

/// A resource declaration with flat topology, capacity and quota.
pub fn flat_resource(unit: Unit) -> ResourceInfo {
    ResourceInfo {
        unit,
        topology: Topology::Flat,
        has_capacity: true,
        has_quota: true,
    }
}

/// A resource declaration with az-aware topology, capacity and quota.
pub fn az_aware_resource(unit: Unit) -> ResourceInfo {
    ResourceInfo {
        topology: Topology::AzAware,
        ..flat_resource(unit)
    }
}

/// A [`Liquid`] that plays back scripted responses.
#[derive(Debug, Default)]
pub struct ScriptedLiquid {
    info: Mutex<ServiceInfo>,
    usage_queues: Mutex<BTreeMap<ProjectUuid, VecDeque<Result<UsageReport, LiquidError>>>>,
    usage_fallbacks: Mutex<BTreeMap<ProjectUuid, UsageReport>>,
    capacity: Mutex<Option<CapacityReport>>,
    capacity_errors: Mutex<VecDeque<LiquidError>>,
    capacity_requests: Mutex<Vec<CapacityRequest>>,
    quota_calls: Mutex<Vec<(ProjectUuid, SetQuotaRequest)>>,
    quota_errors: Mutex<VecDeque<LiquidError>>,
    quota_floors: Mutex<BTreeMap<ResourceName, u64>>,
    review_rejection: Mutex<Option<String>>,
}

impl ScriptedLiquid {
    /// Creates a scripted adapter with the given self-description.
    pub fn new(info: ServiceInfo) -> ScriptedLiquid {
        ScriptedLiquid {
            info: Mutex::new(info),
            ..Default::default()
        }
    }

    /// Sets the report to repeat for every scan of `project` once its queue
    /// is empty.
    pub fn set_usage(&self, project: impl Into<ProjectUuid>, report: UsageReport) {
        self.usage_fallbacks
            .lock()
            .unwrap()
            .insert(project.into(), report);
    }

    /// Queues one scan result for `project`, consumed before the fallback.
    pub fn enqueue_usage(
        &self,
        project: impl Into<ProjectUuid>,
        result: Result<UsageReport, LiquidError>,
    ) {
        self.usage_queues
            .lock()
            .unwrap()
            .entry(project.into())
            .or_default()
            .push_back(result);
    }

    /// Sets the capacity report to repeat.
    pub fn set_capacity(&self, report: CapacityReport) {
        *self.capacity.lock().unwrap() = Some(report);
    }

    /// Queues one capacity scan failure, consumed before the report.
    pub fn enqueue_capacity_error(&self, error: LiquidError) {
        self.capacity_errors.lock().unwrap().push_back(error);
    }

    /// Queues one quota update failure.
    pub fn enqueue_quota_error(&self, error: LiquidError) {
        self.quota_errors.lock().unwrap().push_back(error);
    }

    /// Makes quota updates report a clamping floor for `resource`.
    pub fn set_quota_floor(&self, resource: impl Into<ResourceName>, floor: u64) {
        self.quota_floors
            .lock()
            .unwrap()
            .insert(resource.into(), floor);
    }

    /// Makes commitment reviews reject with `reason`.
    pub fn reject_commitments(&self, reason: impl Into<String>) {
        *self.review_rejection.lock().unwrap() = Some(reason.into());
    }

    /// Makes commitment reviews accept again.
    pub fn accept_commitments(&self) {
        *self.review_rejection.lock().unwrap() = None;
    }

    /// Returns all quota updates received so far.
    pub fn quota_calls(&self) -> Vec<(ProjectUuid, SetQuotaRequest)> {
        self.quota_calls.lock().unwrap().clone()
    }

    /// Returns all capacity requests received so far.
    pub fn capacity_requests(&self) -> Vec<CapacityRequest> {
        self.capacity_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Liquid for ScriptedLiquid {
    async fn build_service_info(&self, _deadline: Duration) -> Result<ServiceInfo, LiquidError> {
        Ok(self.info.lock().unwrap().clone())
    }

    async fn scan_capacity(
        &self,
        req: CapacityRequest,
        _deadline: Duration,
    ) -> Result<CapacityReport, LiquidError> {
        self.capacity_requests.lock().unwrap().push(req);
        if let Some(err) = self.capacity_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.capacity
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| LiquidError::Contract("no scripted capacity report".into()))
    }

    async fn scan_usage(
        &self,
        project: &ProjectUuid,
        _req: UsageRequest,
        _deadline: Duration,
    ) -> Result<UsageReport, LiquidError> {
        if let Some(queue) = self.usage_queues.lock().unwrap().get_mut(project) {
            if let Some(result) = queue.pop_front() {
                return result;
            }
        }
        self.usage_fallbacks
            .lock()
            .unwrap()
            .get(project)
            .cloned()
            .ok_or_else(|| LiquidError::Contract(format!("no scripted usage for {project}")))
    }

    async fn set_quota(
        &self,
        project: &ProjectUuid,
        req: SetQuotaRequest,
        _deadline: Duration,
    ) -> Result<SetQuotaResponse, LiquidError> {
        if let Some(err) = self.quota_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.quota_calls
            .lock()
            .unwrap()
            .push((project.clone(), req));
        Ok(SetQuotaResponse {
            floors: self.quota_floors.lock().unwrap().clone(),
        })
    }

    async fn review_commitment_change(
        &self,
        _req: CommitmentChangeRequest,
        _deadline: Duration,
    ) -> Result<CommitmentReview, LiquidError> {
        match self.review_rejection.lock().unwrap().clone() {
            Some(reason) => Ok(CommitmentReview::Rejected { reason }),
            None => Ok(CommitmentReview::Accepted),
        }
    }
}
