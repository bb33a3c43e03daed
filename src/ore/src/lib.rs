// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Internal utility libraries for Limes.
//!
//! **ore** (_n_): the raw material from which more valuable materials are
//! extracted. Modules in this crate are kept small and dependency-light; they
//! extend the Rust standard library rather than wrap the rest of the
//! workspace.

#![warn(missing_docs)]
#![warn(clippy::as_conversions)]

pub mod cast;
pub mod now;
pub mod retry;
pub mod task;
