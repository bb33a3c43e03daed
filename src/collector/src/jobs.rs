// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The generic job engine.
//!
//! Every periodic concern in the collector is one [`JobDefinition`]: a way
//! to claim the next due unit of work, a way to run it, and a way to stamp a
//! failure. The engine is the only place that knows about workers, watchdog
//! deadlines, jitter and shutdown; job implementations stay straight-line
//! code.
//!
//! Claims are mutually exclusive through the store, so M workers per job
//! kind need no coordination among themselves: for a given cursor executions
//! are serial, across cursors they are concurrent, and a slow backend can
//! only ever stall its own job kind's workers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use limes_liquid::LiquidError;
use limes_ore::now::{EpochMillis, NowFn};
use limes_ore::task;
use limes_store::StoreError;

/// How long an in-flight task may keep running after shutdown is signalled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// An error from one task execution.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The backend adapter failed.
    #[error("backend error: {0}")]
    Backend(#[from] LiquidError),
    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The task exceeded its watchdog deadline.
    #[error("task exceeded its deadline of {0:?}")]
    Timeout(Duration),
    /// The report contradicts known state; nothing was mutated.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl JobError {
    /// Reports whether retrying with backoff is worth anything, as opposed
    /// to rescheduling at the normal cadence.
    pub fn is_transient(&self) -> bool {
        match self {
            JobError::Backend(e) => e.is_transient(),
            JobError::Store(_) | JobError::Timeout(_) => true,
            JobError::Invariant(_) => false,
        }
    }
}

/// One periodic concern, scheduled by the engine.
#[async_trait]
pub trait JobDefinition: Send + Sync + 'static {
    /// The unit of work returned by a claim.
    type Claim: Send + Sync;

    /// The job's name, for logs and task names.
    fn name(&self) -> &'static str;

    /// The watchdog deadline for one execution.
    fn max_runtime(&self) -> Duration;

    /// How long a worker sleeps when nothing is due.
    fn idle_interval(&self) -> Duration;

    /// Claims the next due unit of work, or `None` when nothing is due.
    /// The claim must be mutually exclusive across workers and processes.
    async fn claim(&self, now: EpochMillis) -> Result<Option<Self::Claim>, StoreError>;

    /// Runs one unit of work. On success the implementation has already
    /// committed its results and advanced the cursor.
    async fn run(&self, claim: &Self::Claim) -> Result<(), JobError>;

    /// Stamps a failed execution: records the error on the cursor and
    /// schedules the next attempt (backoff for transient failures, normal
    /// cadence otherwise). Must not fail; store errors are logged and the
    /// cursor is left to the stuck-claim sweep.
    async fn record_failure(&self, claim: &Self::Claim, now: EpochMillis, error: &JobError);
}

/// The outcome of [`run_once`].
#[derive(Debug)]
pub enum TickOutcome {
    /// Nothing was due.
    Idle,
    /// A unit of work ran to completion.
    Completed,
    /// A unit of work failed; the failure was recorded.
    Failed(JobError),
}

/// Claims and runs at most one unit of work. This is the single execution
/// path shared by the worker loops and the tests.
pub async fn run_once<J: JobDefinition>(
    job: &J,
    clock: &NowFn,
) -> Result<TickOutcome, StoreError> {
    let Some(claim) = job.claim((clock)()).await? else {
        return Ok(TickOutcome::Idle);
    };
    let result = match tokio::time::timeout(job.max_runtime(), job.run(&claim)).await {
        Ok(result) => result,
        Err(_) => Err(JobError::Timeout(job.max_runtime())),
    };
    match result {
        Ok(()) => Ok(TickOutcome::Completed),
        Err(error) => {
            job.record_failure(&claim, (clock)(), &error).await;
            Ok(TickOutcome::Failed(error))
        }
    }
}

/// Spawns `workers` independent workers for one job kind. Workers exit when
/// `shutdown` fires, letting an in-flight task finish within a small grace
/// window.
pub fn spawn_workers<J: JobDefinition>(
    job: Arc<J>,
    workers: usize,
    clock: NowFn,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|index| {
            let job = Arc::clone(&job);
            let clock = clock.clone();
            let shutdown = shutdown.clone();
            let name = format!("{}-worker-{}", job.name(), index);
            task::spawn(move || name, async move {
                worker_loop(job, clock, shutdown).await
            })
        })
        .collect()
}

async fn worker_loop<J: JobDefinition>(
    job: Arc<J>,
    clock: NowFn,
    shutdown: CancellationToken,
) {
    debug!(job = job.name(), "worker started");
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        let tick = run_once(job.as_ref(), &clock);
        tokio::pin!(tick);
        let outcome = tokio::select! {
            outcome = &mut tick => outcome,
            _ = shutdown.cancelled() => {
                match tokio::time::timeout(SHUTDOWN_GRACE, &mut tick).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(job = job.name(), "abandoning in-flight task at shutdown");
                        break;
                    }
                }
            }
        };
        match outcome {
            Ok(TickOutcome::Completed) => continue,
            Ok(TickOutcome::Failed(error)) => {
                debug!(job = job.name(), error = %error, "task failed");
                continue;
            }
            Ok(TickOutcome::Idle) => {
                if !idle_sleep(jittered(job.idle_interval()), &shutdown).await {
                    break;
                }
            }
            Err(error) => {
                // A failed claim released nothing; back off briefly so a
                // down store is not hammered.
                warn!(job = job.name(), error = %error, "failed to claim work");
                if !idle_sleep(jittered(job.idle_interval()), &shutdown).await {
                    break;
                }
            }
        }
    }
    debug!(job = job.name(), "worker stopped");
}

/// Sleeps for `duration` unless shutdown fires first. Returns `false` on
/// shutdown.
async fn idle_sleep(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.cancelled() => false,
    }
}

/// Perturbs a duration by ±10% to spread load across cursors that would
/// otherwise stay synchronized forever.
pub fn jittered(duration: Duration) -> Duration {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    if millis == 0 {
        return duration;
    }
    let swing = millis / 10;
    let offset = rand::thread_rng().gen_range(0..=swing * 2);
    Duration::from_millis(millis - swing + offset)
}

/// The bounded exponential backoff applied to a cursor after its
/// `consecutive_errors`-th failure: `base × 2^(errors−1)`, capped.
pub fn backoff_interval(base: Duration, consecutive_errors: u32, cap: Duration) -> Duration {
    if consecutive_errors == 0 {
        return base.min(cap);
    }
    let exponent = consecutive_errors.saturating_sub(1).min(16);
    base.saturating_mul(1 << exponent).min(cap)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{backoff_interval, jittered};

    #[test]
    fn test_backoff_grows_exponentially_and_caps() {
        let base = Duration::from_secs(300);
        let cap = Duration::from_secs(1_800);
        assert_eq!(backoff_interval(base, 1, cap), Duration::from_secs(300));
        assert_eq!(backoff_interval(base, 2, cap), Duration::from_secs(600));
        assert_eq!(backoff_interval(base, 3, cap), Duration::from_secs(1_200));
        assert_eq!(backoff_interval(base, 4, cap), cap);
        assert_eq!(backoff_interval(base, 30, cap), cap);
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let base = Duration::from_secs(100);
        for _ in 0..100 {
            let jittered = jittered(base);
            assert!(jittered >= Duration::from_secs(90));
            assert!(jittered <= Duration::from_secs(110));
        }
    }
}
