// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry utilities.
//!
//! The design motto is "retry with exponential backoff, but bounded": every
//! retry loop in the workspace shares this one implementation so that caps and
//! growth factors are uniform and testable.

use std::cmp;
use std::future::Future;
use std::time::Duration;

/// Configures a retry operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Retry {
    /// The backoff to apply after the first failure.
    pub initial_backoff: Duration,
    /// The multiplier applied to the backoff after every subsequent failure.
    pub factor: f64,
    /// The maximum backoff, after clamping.
    pub clamp_backoff: Duration,
    /// The maximum number of attempts, if bounded.
    pub max_tries: Option<usize>,
}

impl Default for Retry {
    fn default() -> Self {
        Retry {
            initial_backoff: Duration::from_millis(125),
            factor: 2.0,
            clamp_backoff: Duration::MAX,
            max_tries: None,
        }
    }
}

/// The result of a retryable operation.
#[derive(Debug)]
pub enum RetryResult<T, E> {
    /// The operation succeeded; retrying stops.
    Ok(T),
    /// The operation failed in a way that may be resolved by retrying.
    RetryableErr(E),
    /// The operation failed in a way that retrying will not resolve.
    FatalErr(E),
}

impl<T, E> From<Result<T, E>> for RetryResult<T, E> {
    fn from(res: Result<T, E>) -> RetryResult<T, E> {
        match res {
            Ok(t) => RetryResult::Ok(t),
            Err(e) => RetryResult::RetryableErr(e),
        }
    }
}

/// The state of a retry operation, passed to each attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryState {
    /// The attempt counter, starting at zero.
    pub i: usize,
    /// The backoff that will be applied if this attempt fails, or `None` if
    /// this is the last attempt.
    pub next_backoff: Option<Duration>,
}

impl Retry {
    /// Sets the initial backoff.
    pub fn initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    /// Clamps the backoff to the specified maximum.
    pub fn clamp_backoff(mut self, clamp_backoff: Duration) -> Self {
        self.clamp_backoff = clamp_backoff;
        self
    }

    /// Sets the exponential growth factor.
    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Bounds the total number of attempts.
    pub fn max_tries(mut self, max_tries: usize) -> Self {
        self.max_tries = Some(max_tries);
        self
    }

    /// Returns the backoff to apply after attempt `i` (zero-based).
    pub fn backoff_for(&self, i: usize) -> Duration {
        let factor = self.factor.powi(i32::try_from(i).unwrap_or(i32::MAX));
        let backoff = self.initial_backoff.mul_f64(factor);
        cmp::min(backoff, self.clamp_backoff)
    }

    /// Retries the asynchronous, fallible operation `f` according to this
    /// configuration.
    ///
    /// The operation signals whether a failure is worth retrying by returning
    /// [`RetryResult::RetryableErr`] versus [`RetryResult::FatalErr`].
    pub async fn retry_async<F, U, T, E>(self, mut f: F) -> Result<T, E>
    where
        F: FnMut(RetryState) -> U,
        U: Future<Output = RetryResult<T, E>>,
    {
        let mut i = 0;
        loop {
            let last = self.max_tries.map_or(false, |max| i + 1 >= max);
            let next_backoff = if last { None } else { Some(self.backoff_for(i)) };
            let state = RetryState { i, next_backoff };
            match f(state).await {
                RetryResult::Ok(t) => return Ok(t),
                RetryResult::FatalErr(e) => return Err(e),
                RetryResult::RetryableErr(e) => match next_backoff {
                    None => return Err(e),
                    Some(backoff) => tokio::time::sleep(backoff).await,
                },
            }
            i += 1;
        }
    }

    /// Converts this configuration into an object that sleeps through the
    /// backoff schedule, for retry loops whose body does not fit the
    /// [`Retry::retry_async`] closure shape.
    pub fn into_retry_stream(self) -> RetryStream {
        RetryStream { retry: self, i: 0 }
    }
}

/// See [`Retry::into_retry_stream`].
#[derive(Debug)]
pub struct RetryStream {
    retry: Retry,
    i: usize,
}

impl RetryStream {
    /// Sleeps through the next backoff in the schedule. Returns `false` once
    /// the configured number of attempts is exhausted.
    pub async fn sleep(&mut self) -> bool {
        if let Some(max) = self.retry.max_tries {
            if self.i + 1 >= max {
                return false;
            }
        }
        let backoff = self.retry.backoff_for(self.i);
        self.i += 1;
        tokio::time::sleep(backoff).await;
        true
    }
}
