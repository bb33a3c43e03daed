// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A compact time series of usage samples.

use std::time::Duration;

use limes_ore::now::EpochMillis;
use serde::{Deserialize, Serialize};

/// A columnar series of historical usage samples.
///
/// The series maintains three invariants:
///
/// 1. `timestamps` and `values` have equal length;
/// 2. `timestamps` is strictly increasing;
/// 3. adjacent values are never equal (a sample that repeats the previous
///    value carries no information and is dropped on append).
///
/// The only mutations are [`HistoricalUsage::record`] and
/// [`HistoricalUsage::prune`], which is what keeps the invariants easy to
/// preserve and the serialized form stable.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalUsage {
    timestamps: Vec<EpochMillis>,
    values: Vec<u64>,
}

impl HistoricalUsage {
    /// Creates an empty series.
    pub fn new() -> HistoricalUsage {
        HistoricalUsage::default()
    }

    /// Returns the number of samples.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Reports whether the series is empty.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Returns the samples as `(timestamp, value)` pairs, oldest first.
    pub fn samples(&self) -> impl Iterator<Item = (EpochMillis, u64)> + '_ {
        self.timestamps.iter().copied().zip(self.values.iter().copied())
    }

    /// Returns the most recent sample, if any.
    pub fn latest(&self) -> Option<(EpochMillis, u64)> {
        Some((*self.timestamps.last()?, *self.values.last()?))
    }

    /// Appends a sample.
    ///
    /// Samples that do not advance the clock are ignored, as are samples that
    /// repeat the latest value.
    pub fn record(&mut self, now: EpochMillis, value: u64) {
        if let Some((last_ts, last_value)) = self.latest() {
            if now <= last_ts || value == last_value {
                return;
            }
        }
        self.timestamps.push(now);
        self.values.push(value);
    }

    /// Drops all samples older than the retention window, keeping the most
    /// recent out-of-window sample as the baseline for the window's edge.
    pub fn prune(&mut self, now: EpochMillis, retention: Duration) {
        let cutoff = now.saturating_sub(window_millis(retention));
        let first_inside = self.timestamps.partition_point(|ts| *ts < cutoff);
        // Keep one sample before the cutoff so the value at the window edge
        // remains known.
        let drop = first_inside.saturating_sub(1);
        if drop > 0 {
            self.timestamps.drain(..drop);
            self.values.drain(..drop);
        }
    }
}

fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX)
}
