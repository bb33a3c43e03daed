// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The HTTP+JSON transport of the adapter protocol.
//!
//! Each operation is a `POST` against the adapter's `/v1/` namespace. The
//! transport is deliberately boring: one request, one JSON body each way, a
//! deadline enforced by the caller's clock rather than the adapter's.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use limes_repr::{ProjectUuid, ServiceType};

use crate::error::LiquidError;
use crate::types::{
    CapacityReport, CapacityRequest, CommitmentChangeRequest, CommitmentReview, ServiceInfo,
    SetQuotaRequest, SetQuotaResponse, UsageReport, UsageRequest,
};
use crate::Liquid;

/// A [`Liquid`] talking to an adapter process over HTTP.
#[derive(Debug, Clone)]
pub struct HttpLiquid {
    service_type: ServiceType,
    base_url: String,
    client: reqwest::Client,
}

impl HttpLiquid {
    /// Creates a client for the adapter at `base_url`.
    pub fn new(service_type: ServiceType, base_url: impl Into<String>) -> HttpLiquid {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        HttpLiquid {
            service_type,
            base_url,
            // Connection pooling lives in the client; deadlines are enforced
            // per call, so no global timeout is configured here.
            client: reqwest::Client::new(),
        }
    }

    async fn post<Req, Resp>(
        &self,
        path: &str,
        req: &Req,
        deadline: Duration,
    ) -> Result<Resp, LiquidError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/v1/{}", self.base_url, path);
        debug!(service_type = %self.service_type, %url, "adapter call");
        let fut = async {
            let resp = self
                .client
                .post(&url)
                .json(req)
                .send()
                .await
                .map_err(classify_reqwest_error)?;
            let status = resp.status();
            let body = resp
                .text()
                .await
                .map_err(|e| LiquidError::Connect(e.to_string()))?;
            if !status.is_success() {
                return Err(LiquidError::Status {
                    code: status.as_u16(),
                    body,
                });
            }
            serde_json::from_str(&body)
                .map_err(|e| LiquidError::Contract(format!("undecodable response: {e}")))
        };
        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(LiquidError::Timeout(deadline)),
        }
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> LiquidError {
    if e.is_timeout() {
        LiquidError::Connect(format!("request timed out: {e}"))
    } else {
        LiquidError::Connect(e.to_string())
    }
}

#[async_trait]
impl Liquid for HttpLiquid {
    async fn build_service_info(&self, deadline: Duration) -> Result<ServiceInfo, LiquidError> {
        self.post("service-info", &serde_json::json!({}), deadline)
            .await
    }

    async fn scan_capacity(
        &self,
        req: CapacityRequest,
        deadline: Duration,
    ) -> Result<CapacityReport, LiquidError> {
        let expected = req.info_version;
        let report: CapacityReport = self.post("capacity", &req, deadline).await?;
        check_info_version(expected, report.info_version)?;
        Ok(report)
    }

    async fn scan_usage(
        &self,
        project: &ProjectUuid,
        req: UsageRequest,
        deadline: Duration,
    ) -> Result<UsageReport, LiquidError> {
        let expected = req.info_version;
        let report: UsageReport = self
            .post(&format!("usage/{project}"), &req, deadline)
            .await?;
        check_info_version(expected, report.info_version)?;
        Ok(report)
    }

    async fn set_quota(
        &self,
        project: &ProjectUuid,
        req: SetQuotaRequest,
        deadline: Duration,
    ) -> Result<SetQuotaResponse, LiquidError> {
        self.post(&format!("quota/{project}"), &req, deadline).await
    }

    async fn review_commitment_change(
        &self,
        req: CommitmentChangeRequest,
        deadline: Duration,
    ) -> Result<CommitmentReview, LiquidError> {
        self.post("commitment-review", &req, deadline).await
    }
}

fn check_info_version(expected: u64, actual: u64) -> Result<(), LiquidError> {
    if expected == actual {
        Ok(())
    } else {
        Err(LiquidError::VersionMismatch { expected, actual })
    }
}
