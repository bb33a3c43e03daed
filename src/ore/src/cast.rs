// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Cast utilities.

/// A trait for safe, simple, and infallible casts.
///
/// `CastFrom` is like [`std::convert::From`], but it is implemented for some
/// platform-dependent casts that are known to be infallible on the platforms
/// we support (pointer widths of 32 or 64 bits).
pub trait CastFrom<T> {
    /// Performs the cast.
    fn cast_from(from: T) -> Self;
}

macro_rules! cast_from {
    ($from:ty, $to:ty) => {
        impl CastFrom<$from> for $to {
            #[allow(clippy::as_conversions)]
            fn cast_from(from: $from) -> $to {
                from as $to
            }
        }
    };
}

#[cfg(any(target_pointer_width = "32", target_pointer_width = "64"))]
cast_from!(u32, usize);
#[cfg(any(target_pointer_width = "32", target_pointer_width = "64"))]
cast_from!(usize, u64);
#[cfg(target_pointer_width = "64")]
cast_from!(u64, usize);
cast_from!(u32, u64);
cast_from!(u32, i64);
cast_from!(u64, u128);
cast_from!(u64, i128);

/// A trait for potentially-lossy numeric casts with well-defined semantics.
///
/// Lossy casts are kept out of ordinary code by the `as_conversions` lint;
/// the few places that genuinely need one (overcommit arithmetic, metrics
/// export) go through this trait so that the loss is visible at the call
/// site.
pub trait CastLossy<T> {
    /// Performs the lossy cast.
    fn cast_lossy(from: T) -> Self;
}

macro_rules! cast_lossy {
    ($from:ty, $to:ty) => {
        impl CastLossy<$from> for $to {
            #[allow(clippy::as_conversions)]
            fn cast_lossy(from: $from) -> $to {
                from as $to
            }
        }
    };
}

cast_lossy!(u64, f64);
cast_lossy!(f64, u64);
cast_lossy!(u128, u64);
