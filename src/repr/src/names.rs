// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Name types.
//!
//! Each name is a distinct newtype so that a resource name cannot be passed
//! where a service type is expected. All of them are cheap to clone, ordered,
//! and usable as map keys.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! name_type {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(
            Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Returns the name as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> $name {
                $name(s.into())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> $name {
                $name(s)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

name_type! {
    /// The type of a backend service, e.g. `compute` or `object-store`.
    ServiceType
}

name_type! {
    /// The name of a resource within a service, e.g. `cores` or `capacity`.
    ResourceName
}

name_type! {
    /// The identity provider's stable identifier for a domain.
    DomainUuid
}

name_type! {
    /// The identity provider's stable identifier for a project.
    ProjectUuid
}

/// An availability zone, i.e. a failure domain within the cluster.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AvailabilityZone(String);

impl AvailabilityZone {
    /// The pseudo-AZ that holds values not attributable to any one zone.
    ///
    /// Flat resources report everything under this zone.
    pub const ANY: &'static str = "any";

    /// The pseudo-AZ that holds values reported for a zone the cluster does
    /// not know about.
    pub const UNKNOWN: &'static str = "unknown";

    /// Returns the pseudo-AZ for zone-less values.
    pub fn any() -> AvailabilityZone {
        AvailabilityZone(Self::ANY.into())
    }

    /// Returns the pseudo-AZ for unrecognized zones.
    pub fn unknown() -> AvailabilityZone {
        AvailabilityZone(Self::UNKNOWN.into())
    }

    /// Reports whether this is one of the two pseudo-AZs.
    pub fn is_real(&self) -> bool {
        self.0 != Self::ANY && self.0 != Self::UNKNOWN
    }

    /// Returns the zone name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AvailabilityZone {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for AvailabilityZone {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AvailabilityZone {
    fn from(s: &str) -> AvailabilityZone {
        AvailabilityZone(s.into())
    }
}

impl From<String> for AvailabilityZone {
    fn from(s: String) -> AvailabilityZone {
        AvailabilityZone(s)
    }
}

#[cfg(test)]
mod tests {
    use super::AvailabilityZone;

    #[test]
    fn test_pseudo_azs() {
        assert!(!AvailabilityZone::any().is_real());
        assert!(!AvailabilityZone::unknown().is_real());
        assert!(AvailabilityZone::from("az-one").is_real());
    }
}
