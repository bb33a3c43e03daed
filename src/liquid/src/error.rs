// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Adapter error taxonomy.

use std::time::Duration;

use thiserror::Error;

/// An error from an adapter call.
///
/// The taxonomy exists for one decision: is retrying the same call worth
/// anything? [`LiquidError::is_transient`] answers that; everything else
/// about the error is operator-facing detail.
#[derive(Debug, Error)]
pub enum LiquidError {
    /// The call did not complete within its deadline.
    #[error("adapter call timed out after {0:?}")]
    Timeout(Duration),

    /// The adapter could not be reached.
    #[error("failed to reach adapter: {0}")]
    Connect(String),

    /// The adapter answered with a non-success status.
    #[error("adapter returned status {code}: {body}")]
    Status {
        /// The HTTP status code.
        code: u16,
        /// The response body, for the error ring buffer.
        body: String,
    },

    /// The adapter answered with a payload that violates the contract
    /// (undecodable, negative usage, quota sentinel misuse, ...).
    #[error("adapter violated its contract: {0}")]
    Contract(String),

    /// The adapter answered under a service info version other than the one
    /// on file.
    #[error("adapter reported service info version {actual}, expected {expected}")]
    VersionMismatch {
        /// The version on file.
        expected: u64,
        /// The version the response carried.
        actual: u64,
    },
}

impl LiquidError {
    /// Reports whether retrying the same call may succeed.
    ///
    /// Transient errors are recorded and retried with backoff; permanent
    /// errors are recorded and rescheduled at the normal cadence.
    pub fn is_transient(&self) -> bool {
        match self {
            LiquidError::Timeout(_) | LiquidError::Connect(_) => true,
            LiquidError::Status { code, .. } => *code >= 500 || *code == 429,
            LiquidError::Contract(_) | LiquidError::VersionMismatch { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::LiquidError;

    #[test]
    fn test_transience_classification() {
        assert!(LiquidError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(LiquidError::Connect("refused".into()).is_transient());
        assert!(LiquidError::Status { code: 503, body: String::new() }.is_transient());
        assert!(LiquidError::Status { code: 429, body: String::new() }.is_transient());
        assert!(!LiquidError::Status { code: 404, body: String::new() }.is_transient());
        assert!(!LiquidError::Contract("negative usage".into()).is_transient());
        assert!(!LiquidError::VersionMismatch { expected: 1, actual: 2 }.is_transient());
    }
}
