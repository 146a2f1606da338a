//! Property tests for the pricing and accounting invariants.

mod common;

use chrono::Duration;
use common::{sui, Harness, ONE};
use proptest::prelude::*;
use tidepool_engine::config::{DEFAULT_PRICE_STALENESS_MS, PRICE_SCALE};
use tidepool_engine::shares::share_ratio;
use tidepool_engine::{LossTracker, VaultError};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn price_is_readable_exactly_within_the_staleness_bound(age_ms in 0i64..(3 * DEFAULT_PRICE_STALENESS_MS as i64)) {
        let h = Harness::frictionless();
        let later = h.clock.now + Duration::milliseconds(age_ms);
        let read = h.prices.read(&sui(), later);
        if age_ms <= DEFAULT_PRICE_STALENESS_MS as i64 {
            prop_assert_eq!(read, Ok((PRICE_SCALE, 9)));
        } else {
            let is_stale = matches!(read, Err(VaultError::StalePrice { .. }));
            prop_assert!(is_stale);
        }
    }

    #[test]
    fn share_ratio_is_never_zero(total_value in any::<u64>(), total_shares in any::<u64>()) {
        match share_ratio(u128::from(total_value), u128::from(total_shares)) {
            Ok(ratio) => prop_assert!(ratio > 0),
            Err(err) => {
                let is_zero_denominator = matches!(err, VaultError::ZeroDenominator(_));
                prop_assert!(is_zero_denominator);
            }
        }
    }

    #[test]
    fn round_trip_never_pays_out_more_than_deposited(
        seed in ONE..1_000_000 * ONE,
        amount in ONE..1_000_000 * ONE,
        price in PRICE_SCALE..100 * PRICE_SCALE,
    ) {
        let mut h = Harness::frictionless();
        h.set_quote(&sui(), price);
        h.revalue_coins();
        h.deposit("seed", seed);
        let (receipt, shares) = h.deposit("alice", amount);

        let request = h.vault.enqueue_withdraw(&receipt, "alice", shares, 0, &h.clock).unwrap();
        let payout = h
            .vault
            .execute_withdraw(&h.operator, &h.prices, request, u128::MAX, &h.clock)
            .unwrap()
            .payout
            .amount;

        prop_assert!(payout <= amount);
        prop_assert!(payout + 2 >= amount);
        prop_assert!(h.vault.share_ratio(h.clock.now).unwrap() > 0);
    }

    #[test]
    fn recorded_losses_never_exceed_the_budget(
        base in ONE..1_000_000 * ONE,
        tolerance_bps in 1u64..1_000,
        losses in proptest::collection::vec(0u128..10 * ONE, 1..20),
    ) {
        let mut tracker = LossTracker::new(tolerance_bps).unwrap();
        tracker.roll_epoch_if_needed(1, false, base);
        for loss in losses {
            if tracker.check_loss(loss).is_ok() {
                tracker.record_loss(loss).unwrap();
            }
            prop_assert!(tracker.cumulative_loss() <= tracker.limit().unwrap());
        }
    }
}
