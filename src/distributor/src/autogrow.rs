// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The autogrow distribution model.
//!
//! Capacity is handed out in tiers, each fully satisfied before the next is
//! considered:
//!
//! 1. capacity-reserving commitments (guaranteed and confirmed);
//! 2. usage not covered by those commitments;
//! 3. commitments awaiting confirmation;
//! 4. growth headroom (usage × growth multiplier, minus what the earlier
//!    tiers already requested), granted only when it fits in full.
//!
//! Commitments outrank bare usage: a confirmed commitment of amount N is
//! honored in full even when the sum of all demand exceeds capacity. Within
//! the first demand tier (1 to 3) that cannot be fully funded, the remaining
//! capacity is apportioned by the largest-remainder method and later tiers
//! receive nothing. The growth tier is never apportioned: either every
//! growth delta fits or the whole tier is skipped. Capacity left over after
//! the tiers is distributed according to the configured balance, which is
//! where the capacity of a skipped growth tier ends up.

use limes_repr::Balance;

use crate::apportion::{largest_remainder, water_fill};

/// One project's demand within a single capacity pool.
///
/// Callers sort lines by project UUID before distribution; every function in
/// this crate is deterministic in input order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DemandLine {
    /// The total of capacity-reserving commitments.
    pub committed: u64,
    /// Current usage.
    pub usage: u64,
    /// The total of commitments awaiting confirmation.
    pub pending: u64,
    /// Usage multiplied by the growth multiplier, rounded up.
    pub growth_target: u64,
}

impl DemandLine {
    fn uncommitted_usage(&self) -> u64 {
        self.usage.saturating_sub(self.committed)
    }

    fn growth_delta(&self) -> u64 {
        let already_requested = self.committed.max(self.usage).saturating_add(self.pending);
        self.growth_target.saturating_sub(already_requested)
    }
}

/// Distributes `capacity` (in effective units) across the demand lines.
///
/// Returns one grant per line, in input order. The grants never exceed the
/// capacity in sum; with [`Balance::Equalize`] they exhaust it whenever total
/// demand reaches it.
pub fn distribute(capacity: u64, lines: &[DemandLine], balance: Balance) -> Vec<u64> {
    let mut grants = vec![0_u64; lines.len()];
    let mut remaining = capacity;

    let demand_tiers: [Vec<u64>; 3] = [
        lines.iter().map(|l| l.committed).collect(),
        lines.iter().map(|l| l.uncommitted_usage()).collect(),
        lines.iter().map(|l| l.pending).collect(),
    ];

    for requests in demand_tiers {
        if remaining == 0 {
            break;
        }
        let tier_grants = largest_remainder(remaining, &requests);
        for (grant, tier_grant) in grants.iter_mut().zip(&tier_grants) {
            *grant += tier_grant;
            remaining -= tier_grant;
        }
    }

    // Growth headroom is all-or-nothing; on shortfall the remainder is left
    // to the balance stage.
    let growth: Vec<u64> = lines.iter().map(|l| l.growth_delta()).collect();
    let growth_total: u128 = growth.iter().map(|g| u128::from(*g)).sum();
    if remaining > 0 && growth_total <= u128::from(remaining) {
        for (grant, delta) in grants.iter_mut().zip(&growth) {
            *grant += delta;
            remaining -= delta;
        }
    }

    if remaining > 0 && !lines.is_empty() && balance == Balance::Equalize {
        let increments = water_fill(remaining, &grants);
        for (grant, increment) in grants.iter_mut().zip(&increments) {
            *grant += increment;
        }
    }
    grants
}

#[cfg(test)]
mod tests {
    use limes_repr::Balance;

    use super::{distribute, DemandLine};

    fn usage_line(usage: u64, growth_target: u64) -> DemandLine {
        DemandLine {
            usage,
            growth_target,
            ..Default::default()
        }
    }

    #[test]
    fn test_growth_then_equalize() {
        // Usage 40 and 30 with a 1.25 growth multiplier: both growth targets
        // fit, and the leftover equalizes the holdings at 50/50.
        let lines = [usage_line(40, 50), usage_line(30, 38)];
        assert_eq!(distribute(100, &lines, Balance::Equalize), vec![50, 50]);
        // Retain leaves the leftover unallocated instead.
        assert_eq!(distribute(100, &lines, Balance::Retain), vec![50, 38]);
    }

    #[test]
    fn test_growth_deferred_when_underfunded() {
        // Usage 60 and 30: after the usage tier only 10 remain against
        // growth deltas of 15 and 8. The growth tier does not fit, so the
        // leftover equalizes the holdings instead: 60/40.
        let lines = [usage_line(60, 75), usage_line(30, 38)];
        assert_eq!(distribute(100, &lines, Balance::Equalize), vec![60, 40]);
        assert_eq!(distribute(100, &lines, Balance::Retain), vec![60, 30]);
    }

    #[test]
    fn test_usage_shortfall() {
        // Even usage alone exceeds capacity: proportional apportionment, no
        // growth, no balance.
        let lines = [usage_line(80, 80), usage_line(40, 40)];
        assert_eq!(distribute(60, &lines, Balance::Equalize), vec![40, 20]);
    }

    #[test]
    fn test_confirmed_commitment_outranks_usage() {
        // Project A holds a confirmed commitment of 80 with no usage;
        // project B uses 30 and wants to grow to 50. The commitment is
        // honored in full, B is squeezed to the rest.
        let lines = [
            DemandLine {
                committed: 80,
                ..Default::default()
            },
            usage_line(30, 50),
        ];
        let grants = distribute(100, &lines, Balance::Retain);
        assert_eq!(grants, vec![80, 20]);
        assert!(grants[0] >= 80);
        assert!(grants[1] <= 20);
    }

    #[test]
    fn test_commitment_covering_usage_requests_once() {
        // A commitment of 50 covering usage 30 must not demand 80.
        let lines = [DemandLine {
            committed: 50,
            usage: 30,
            ..Default::default()
        }];
        assert_eq!(distribute(100, &lines, Balance::Retain), vec![50]);
    }

    #[test]
    fn test_pending_commitments_rank_before_growth() {
        // 20 remaining after usage; the pending commitment of 20 absorbs all
        // of it, growth gets nothing.
        let lines = [
            DemandLine {
                usage: 50,
                pending: 20,
                growth_target: 75,
                ..Default::default()
            },
            usage_line(30, 45),
        ];
        assert_eq!(distribute(100, &lines, Balance::Retain), vec![70, 30]);
    }

    #[test]
    fn test_monotonic_in_capacity() {
        // Under Retain the grants move with capacity in one direction only:
        // the demand tiers grow weakly and the growth tier switches on once
        // it is fully fundable. (Under Equalize the balance stage redirects
        // leftover at that switch-on point, so monotonicity is pinned here
        // on the tier arithmetic alone.)
        let lines = [usage_line(60, 75), usage_line(30, 38)];
        let grants: Vec<Vec<u64>> = [80, 90, 100, 113, 140]
            .iter()
            .map(|capacity| distribute(*capacity, &lines, Balance::Retain))
            .collect();
        assert_eq!(grants[0], vec![53, 27]);
        assert_eq!(grants[1], vec![60, 30]);
        assert_eq!(grants[2], vec![60, 30]);
        assert_eq!(grants[3], vec![75, 38]);
        assert_eq!(grants[4], vec![75, 38]);
        for pair in grants.windows(2) {
            for (lo, hi) in pair[0].iter().zip(&pair[1]) {
                assert!(lo <= hi);
            }
        }
    }

    #[test]
    fn test_reduced_demand_reduces_grants() {
        // Commitment expiry shrinks demand; with capacity unchanged the
        // freed share flows to the other project.
        let with_commitment = [
            DemandLine {
                committed: 80,
                ..Default::default()
            },
            usage_line(30, 50),
        ];
        let without = [usage_line(0, 0), usage_line(30, 50)];
        assert_eq!(
            distribute(100, &with_commitment, Balance::Retain),
            vec![80, 20]
        );
        assert_eq!(distribute(100, &without, Balance::Retain), vec![0, 50]);
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(distribute(100, &[], Balance::Equalize), Vec::<u64>::new());
        assert_eq!(
            distribute(0, &[usage_line(10, 12)], Balance::Equalize),
            vec![0]
        );
    }
}
