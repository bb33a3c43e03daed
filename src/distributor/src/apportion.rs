// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Integer apportionment primitives.
//!
//! Both functions are deterministic in their input order: callers establish
//! the tie-break by sorting their inputs (by project UUID) before calling.

use limes_ore::cast::CastFrom;

/// Distributes `capacity` proportionally to `requests` using the
/// largest-remainder method.
///
/// Returns one grant per request, in input order, with two exact guarantees:
/// the grants sum to `min(capacity, Σ requests)`, and no grant exceeds its
/// request. When capacity runs short, each request first receives the integer
/// floor of its proportional share; the units lost to flooring go to the
/// requests with the largest fractional remainders, earlier inputs winning
/// ties.
pub fn largest_remainder(capacity: u64, requests: &[u64]) -> Vec<u64> {
    let total: u128 = requests.iter().map(|r| u128::cast_from(*r)).sum();
    if total <= u128::cast_from(capacity) {
        return requests.to_vec();
    }

    let capacity = u128::cast_from(capacity);
    let mut grants = Vec::with_capacity(requests.len());
    let mut remainders = Vec::with_capacity(requests.len());
    let mut granted: u128 = 0;
    for (i, request) in requests.iter().enumerate() {
        let product = capacity * u128::cast_from(*request);
        let floor = product / total;
        granted += floor;
        grants.push(u64::try_from(floor).expect("floor is at most the request"));
        remainders.push((product % total, i));
    }

    // Hand the rounding loss out by largest fractional remainder; the input
    // index keeps equal remainders deterministic.
    let mut leftover = capacity - granted;
    remainders.sort_by(|(rem_a, i_a), (rem_b, i_b)| rem_b.cmp(rem_a).then(i_a.cmp(i_b)));
    for (remainder, i) in remainders {
        if leftover == 0 {
            break;
        }
        // A zero remainder means the floor was exact; such requests never
        // need a compensation unit.
        if remainder == 0 {
            break;
        }
        grants[i] += 1;
        leftover -= 1;
    }
    grants
}

/// Distributes `amount` across holdings by water-filling: the lowest holding
/// is raised first, until all holdings meet at a common level or the amount
/// runs out.
///
/// Returns one increment per holding, in input order, summing to `amount`
/// exactly (the level where everything meets is fractional in general; the
/// sub-unit rest goes to the lowest holdings, earlier inputs winning ties).
pub fn water_fill(amount: u64, holdings: &[u64]) -> Vec<u64> {
    let mut increments = vec![0_u64; holdings.len()];
    if holdings.is_empty() || amount == 0 {
        return increments;
    }

    let mut order: Vec<usize> = (0..holdings.len()).collect();
    order.sort_by_key(|i| (holdings[*i], *i));

    // Find how many of the lowest holdings can be raised to the level of the
    // next one before the amount runs out.
    let mut remaining = u128::cast_from(amount);
    let mut k = 1;
    while k < order.len() {
        let level = u128::cast_from(holdings[order[k]]);
        let cost: u128 = order[..k]
            .iter()
            .map(|i| level - u128::cast_from(holdings[*i]))
            .sum();
        if cost > remaining {
            break;
        }
        k += 1;
    }

    // Raise the k lowest holdings to a common level, then spread what is
    // left of the sub-level rest one unit at a time.
    let participants = &order[..k];
    let base: u128 = participants
        .iter()
        .map(|i| u128::cast_from(holdings[*i]))
        .sum();
    let level = (base + remaining) / u128::cast_from(u64::cast_from(k));
    for i in participants {
        let holding = u128::cast_from(holdings[*i]);
        if level > holding {
            let raise = u64::try_from(level - holding).expect("raise bounded by amount");
            increments[*i] = raise;
            remaining -= u128::cast_from(raise);
        }
    }
    for i in participants {
        if remaining == 0 {
            break;
        }
        increments[*i] += 1;
        remaining -= 1;
    }
    increments
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{largest_remainder, water_fill};

    #[test]
    fn test_largest_remainder_grants_fully_when_capacity_suffices() {
        assert_eq!(largest_remainder(100, &[40, 30]), vec![40, 30]);
        assert_eq!(largest_remainder(70, &[40, 30]), vec![40, 30]);
    }

    #[test]
    fn test_largest_remainder_shortfall() {
        // 10 across (15, 8): floors 6 and 3, the one compensation unit goes
        // to the larger fractional part.
        assert_eq!(largest_remainder(10, &[15, 8]), vec![7, 3]);
        // Ties break toward the earlier input.
        assert_eq!(largest_remainder(1, &[5, 5]), vec![1, 0]);
        assert_eq!(largest_remainder(3, &[2, 2, 2]), vec![1, 1, 1]);
    }

    #[test]
    fn test_largest_remainder_ignores_zero_requests() {
        assert_eq!(largest_remainder(20, &[0, 30]), vec![0, 20]);
        assert_eq!(largest_remainder(5, &[0, 0]), vec![0, 0]);
    }

    #[test]
    fn test_water_fill_equalizes() {
        assert_eq!(water_fill(12, &[50, 38]), vec![0, 12]);
        assert_eq!(water_fill(30, &[40, 30]), vec![10, 20]);
        assert_eq!(water_fill(10, &[60, 30]), vec![0, 10]);
        // Sub-unit rest goes to the lowest holding.
        assert_eq!(water_fill(5, &[10, 10]), vec![3, 2]);
    }

    #[test]
    fn test_water_fill_degenerate() {
        assert_eq!(water_fill(0, &[1, 2]), vec![0, 0]);
        assert_eq!(water_fill(7, &[]), Vec::<u64>::new());
        assert_eq!(water_fill(7, &[3]), vec![7]);
    }

    proptest! {
        #[test]
        fn proptest_largest_remainder_exact_sum(
            capacity in 0_u64..1_000_000,
            requests in proptest::collection::vec(0_u64..100_000, 0..16),
        ) {
            let grants = largest_remainder(capacity, &requests);
            let total: u64 = requests.iter().sum();
            prop_assert_eq!(grants.iter().sum::<u64>(), capacity.min(total));
            for (grant, request) in grants.iter().zip(&requests) {
                prop_assert!(grant <= request);
            }
        }

        #[test]
        fn proptest_largest_remainder_is_deterministic(
            capacity in 0_u64..100_000,
            requests in proptest::collection::vec(0_u64..10_000, 0..16),
        ) {
            prop_assert_eq!(
                largest_remainder(capacity, &requests),
                largest_remainder(capacity, &requests)
            );
        }

        #[test]
        fn proptest_water_fill_spends_exactly(
            amount in 0_u64..1_000_000,
            holdings in proptest::collection::vec(0_u64..100_000, 1..16),
        ) {
            let increments = water_fill(amount, &holdings);
            prop_assert_eq!(increments.iter().sum::<u64>(), amount);
            // Raised holdings never overshoot an unraised one by more than
            // the single compensation unit.
            let finals: Vec<u64> = holdings
                .iter()
                .zip(&increments)
                .map(|(h, inc)| h + inc)
                .collect();
            let max_raised = finals
                .iter()
                .zip(&increments)
                .filter(|(_, inc)| **inc > 0)
                .map(|(f, _)| *f)
                .max();
            if let Some(max_raised) = max_raised {
                for (f, inc) in finals.iter().zip(&increments) {
                    if *inc == 0 {
                        prop_assert!(*f + 1 >= max_raised);
                    }
                }
            }
        }
    }
}
