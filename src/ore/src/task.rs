// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Task spawning with mandatory names.
//!
//! Naming tasks at the spawn site costs nothing and makes `tracing` output
//! and debugger dumps legible, so the bare [`tokio::spawn`] is not used
//! elsewhere in the workspace.

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::debug;

/// Spawns a named task onto the current tokio runtime.
///
/// The name is provided as a closure so that callers can construct dynamic
/// names without paying for the allocation when task spawning is not traced.
pub fn spawn<N, S, F>(name: N, future: F) -> JoinHandle<F::Output>
where
    N: FnOnce() -> S,
    S: AsRef<str>,
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let name = name();
    debug!(task = name.as_ref(), "spawning task");
    tokio::spawn(future)
}
