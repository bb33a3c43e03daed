// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Scalar domain types: units, topologies, distribution models, overcommit
//! arithmetic and the backend quota option type.

use std::fmt;

use limes_ore::cast::CastLossy;
use serde::{Deserialize, Serialize};

/// The unit in which a resource is measured.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    /// A counted resource without a physical unit.
    #[default]
    #[serde(rename = "none")]
    None,
    /// Bytes.
    #[serde(rename = "B")]
    Bytes,
    /// Kibibytes.
    #[serde(rename = "KiB")]
    KibiBytes,
    /// Mebibytes.
    #[serde(rename = "MiB")]
    MebiBytes,
    /// Gibibytes.
    #[serde(rename = "GiB")]
    GibiBytes,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Unit::None => "",
            Unit::Bytes => "B",
            Unit::KibiBytes => "KiB",
            Unit::MebiBytes => "MiB",
            Unit::GibiBytes => "GiB",
        };
        f.write_str(s)
    }
}

/// How a resource's values are tracked across availability zones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    /// A single pool; no per-AZ breakdown exists.
    #[default]
    Flat,
    /// Per-AZ usage is reported, but quota is a single project-level number.
    /// The per-AZ usage values sum to at most the project-level usage.
    AzAware,
    /// Quota and usage are tracked per AZ; the per-AZ usage values sum to
    /// exactly the project-level usage and the backend receives per-AZ
    /// quotas.
    AzSeparated,
}

/// The algorithm that turns cluster capacity into per-project quotas.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DistributionModel {
    /// Tiered fair-share distribution of all available capacity.
    #[default]
    Autogrow,
    /// Quota follows actual demand plus a configured headroom; excess
    /// capacity is not distributed.
    Hierarchical,
}

/// A multiplier that converts raw capacity into effective capacity.
///
/// Values exist in exactly two domains: *raw* (what the hardware physically
/// provides, as reported by capacity scans) and *effective* (what may be
/// promised to projects). The factor is applied only at the two boundary
/// conversions below; raw fields never hold effective values and vice versa.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OvercommitFactor(f64);

impl Default for OvercommitFactor {
    fn default() -> Self {
        OvercommitFactor(1.0)
    }
}

impl OvercommitFactor {
    /// Creates a new factor. Returns `None` unless the factor is finite and
    /// strictly positive.
    pub fn new(factor: f64) -> Option<OvercommitFactor> {
        if factor.is_finite() && factor > 0.0 {
            Some(OvercommitFactor(factor))
        } else {
            None
        }
    }

    /// Reports whether this factor is the identity.
    pub fn is_identity(&self) -> bool {
        self.0 == 1.0
    }

    /// Converts a raw capacity into the effective domain, rounding down so
    /// that the effective capacity is never an overpromise.
    pub fn effective_capacity(&self, raw: u64) -> u64 {
        if self.is_identity() {
            return raw;
        }
        u64::cast_lossy((f64::cast_lossy(raw) * self.0).floor())
    }

    /// Converts an effective demand back into the raw domain, rounding up so
    /// that raw reservations always cover the demand.
    pub fn raw_demand(&self, effective: u64) -> u64 {
        if self.is_identity() {
            return effective;
        }
        u64::cast_lossy((f64::cast_lossy(effective) / self.0).ceil())
    }
}

impl fmt::Display for OvercommitFactor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A quota as understood by a backend.
///
/// On the adapter wire, `-1` means "unlimited". That sentinel is translated
/// here at the boundary and never appears in in-memory code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendQuota {
    /// The backend enforces the contained limit.
    Limited(u64),
    /// The backend enforces no limit.
    Unlimited,
}

impl BackendQuota {
    /// Parses the wire representation. Negative values other than `-1` are
    /// rejected as contract violations.
    pub fn from_wire(raw: i64) -> Result<BackendQuota, InvalidBackendQuota> {
        match raw {
            -1 => Ok(BackendQuota::Unlimited),
            v if v >= 0 => Ok(BackendQuota::Limited(
                u64::try_from(v).expect("non-negative i64 fits in u64"),
            )),
            v => Err(InvalidBackendQuota(v)),
        }
    }

    /// Renders the wire representation.
    pub fn to_wire(&self) -> i64 {
        match self {
            BackendQuota::Limited(v) => {
                i64::try_from(*v).expect("backend quota exceeds i64 range")
            }
            BackendQuota::Unlimited => -1,
        }
    }

    /// Returns the limit, if one exists.
    pub fn limit(&self) -> Option<u64> {
        match self {
            BackendQuota::Limited(v) => Some(*v),
            BackendQuota::Unlimited => None,
        }
    }
}

impl fmt::Display for BackendQuota {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BackendQuota::Limited(v) => write!(f, "{v}"),
            BackendQuota::Unlimited => f.write_str("unlimited"),
        }
    }
}

/// The error returned when a wire quota is neither non-negative nor `-1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid backend quota on the wire: {0}")]
pub struct InvalidBackendQuota(pub i64);

#[cfg(test)]
mod tests {
    use super::{BackendQuota, OvercommitFactor};

    #[test]
    fn test_overcommit_round_trip_covers_demand() {
        let factor = OvercommitFactor::new(1.5).unwrap();
        assert_eq!(factor.effective_capacity(100), 150);
        assert_eq!(factor.raw_demand(150), 100);
        // Rounding must never let a raw reservation fall short.
        assert_eq!(factor.effective_capacity(3), 4);
        assert_eq!(factor.raw_demand(4), 3);
        assert_eq!(factor.raw_demand(5), 4);
    }

    #[test]
    fn test_overcommit_identity_is_exact() {
        let factor = OvercommitFactor::default();
        assert!(factor.is_identity());
        assert_eq!(factor.effective_capacity(u64::MAX), u64::MAX);
        assert_eq!(factor.raw_demand(u64::MAX), u64::MAX);
    }

    #[test]
    fn test_overcommit_rejects_nonsense() {
        assert!(OvercommitFactor::new(0.0).is_none());
        assert!(OvercommitFactor::new(-2.0).is_none());
        assert!(OvercommitFactor::new(f64::NAN).is_none());
    }

    #[test]
    fn test_backend_quota_wire_translation() {
        assert_eq!(BackendQuota::from_wire(-1), Ok(BackendQuota::Unlimited));
        assert_eq!(BackendQuota::from_wire(0), Ok(BackendQuota::Limited(0)));
        assert_eq!(BackendQuota::from_wire(250), Ok(BackendQuota::Limited(250)));
        assert!(BackendQuota::from_wire(-2).is_err());
        assert_eq!(BackendQuota::Unlimited.to_wire(), -1);
        assert_eq!(BackendQuota::Limited(250).to_wire(), 250);
    }
}
