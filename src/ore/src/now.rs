// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Now utilities.
//!
//! Code that needs the current time asks for a [`NowFn`] instead of calling
//! [`SystemTime::now`] directly, which is what makes schedules, backoff and
//! lifecycle transitions deterministically testable.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

/// A type representing the number of milliseconds since the Unix epoch.
pub type EpochMillis = u64;

/// A function that returns the current time as an [`EpochMillis`].
#[derive(Clone)]
pub struct NowFn(Arc<dyn Fn() -> EpochMillis + Send + Sync>);

impl NowFn {
    /// Returns the current time in seconds, truncating any fractional part.
    pub fn as_secs(&self) -> u64 {
        (self.0)() / 1_000
    }

    /// Returns the current time as a [`Duration`] since the Unix epoch.
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis((self.0)())
    }
}

impl fmt::Debug for NowFn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("<now_fn>")
    }
}

impl Deref for NowFn {
    type Target = dyn Fn() -> EpochMillis + Send + Sync;

    fn deref(&self) -> &Self::Target {
        &(*self.0)
    }
}

impl<F> From<F> for NowFn
where
    F: Fn() -> EpochMillis + Send + Sync + 'static,
{
    fn from(f: F) -> NowFn {
        NowFn(Arc::new(f))
    }
}

fn system_time() -> EpochMillis {
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("failed to get millis since epoch");
    u64::try_from(dur.as_millis()).expect("current time did not fit into u64")
}

fn now_zero() -> EpochMillis {
    0
}

/// A [`NowFn`] that returns the actual system time.
pub static SYSTEM_TIME: Lazy<NowFn> = Lazy::new(|| NowFn::from(system_time));

/// A [`NowFn`] that always returns zero.
///
/// For use in tests that need a clock but not the passage of time.
pub static NOW_ZERO: Lazy<NowFn> = Lazy::new(|| NowFn::from(now_zero));

#[cfg(test)]
mod tests {
    use super::{NowFn, SYSTEM_TIME};

    #[test]
    fn test_system_time_is_recent() {
        // Any time after 2020-01-01 will do.
        assert!((SYSTEM_TIME)() > 1_577_836_800_000);
    }

    #[test]
    fn test_now_fn_from_closure() {
        let now = NowFn::from(|| 42_000);
        assert_eq!((now)(), 42_000);
        assert_eq!(now.as_secs(), 42);
    }
}
