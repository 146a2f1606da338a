//! # Epoch Loss Tolerance
//!
//! Bounds how much value operator activity may lose in one accounting
//! epoch. When the epoch advances (or the admin forces a reset) the tracker
//! takes the vault's current total as its base and starts counting from zero.
//! Every completed operation reports its realized loss; once the running
//! total would exceed `base × tolerance`, the operation is refused.
//!
//! ```text
//! limit = base_usd_value × tolerance_bps / 10_000
//! cumulative_loss ≤ limit          (except after an emergency override)
//! ```
//!
//! The emergency override records its loss with
//! [`record_loss_unchecked`](LossTracker::record_loss_unchecked) and may push
//! the total past the limit. While it is past, no operation can start until
//! the admin resets the budget or the epoch advances.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{validate_loss_tolerance, BPS_SCALE, DEFAULT_LOSS_TOLERANCE_BPS};
use crate::error::VaultError;
use crate::math::mul_div;

/// Epoch loss state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LossTracker {
    epoch_id: u64,
    base_usd_value: u128,
    cumulative_loss: u128,
    tolerance_bps: u64,
}

impl Default for LossTracker {
    fn default() -> Self {
        Self {
            epoch_id: 0,
            base_usd_value: 0,
            cumulative_loss: 0,
            tolerance_bps: DEFAULT_LOSS_TOLERANCE_BPS,
        }
    }
}

impl LossTracker {
    /// Creates a tracker with the given tolerance.
    pub fn new(tolerance_bps: u64) -> Result<Self, VaultError> {
        validate_loss_tolerance(tolerance_bps)?;
        Ok(Self {
            tolerance_bps,
            ..Self::default()
        })
    }

    /// Epoch the current budget belongs to.
    pub fn epoch_id(&self) -> u64 {
        self.epoch_id
    }

    /// Vault value the current budget is measured against.
    pub fn base_usd_value(&self) -> u128 {
        self.base_usd_value
    }

    /// Loss recorded so far this epoch.
    pub fn cumulative_loss(&self) -> u128 {
        self.cumulative_loss
    }

    /// Tolerance in basis points.
    pub fn tolerance_bps(&self) -> u64 {
        self.tolerance_bps
    }

    /// Maximum cumulative loss this epoch.
    pub fn limit(&self) -> Result<u128, VaultError> {
        mul_div(
            self.base_usd_value,
            u128::from(self.tolerance_bps),
            u128::from(BPS_SCALE),
            "loss limit",
        )
    }

    /// `true` if [`roll_epoch_if_needed`](Self::roll_epoch_if_needed) would
    /// reset for `now_epoch`.
    pub fn needs_roll(&self, now_epoch: u64, forced: bool) -> bool {
        forced || now_epoch > self.epoch_id
    }

    /// Starts a new budget at `current_total` if forced or if `now_epoch`
    /// is past the tracked epoch. Returns whether it reset.
    pub fn roll_epoch_if_needed(&mut self, now_epoch: u64, forced: bool, current_total: u128) -> bool {
        if !self.needs_roll(now_epoch, forced) {
            return false;
        }
        info!(
            from_epoch = self.epoch_id,
            to_epoch = now_epoch,
            base_usd_value = current_total,
            forced,
            "loss epoch rolled"
        );
        self.epoch_id = self.epoch_id.max(now_epoch);
        self.base_usd_value = current_total;
        self.cumulative_loss = 0;
        true
    }

    /// Cumulative loss after adding `amount`, without recording it.
    ///
    /// # Errors
    ///
    /// [`VaultError::ExceedsLossLimit`] if the result would pass the limit.
    pub fn check_loss(&self, amount: u128) -> Result<u128, VaultError> {
        let cumulative = self
            .cumulative_loss
            .checked_add(amount)
            .ok_or(VaultError::ArithmeticOverflow("cumulative loss"))?;
        let limit = self.limit()?;
        if cumulative > limit {
            warn!(cumulative, limit, "loss limit exceeded");
            return Err(VaultError::ExceedsLossLimit { cumulative, limit });
        }
        Ok(cumulative)
    }

    /// Records `amount` of realized loss.
    pub fn record_loss(&mut self, amount: u128) -> Result<(), VaultError> {
        self.cumulative_loss = self.check_loss(amount)?;
        Ok(())
    }

    /// Records `amount` without enforcing the limit. Only the emergency
    /// override uses this; the overshoot stays visible in
    /// [`cumulative_loss`](Self::cumulative_loss).
    pub fn record_loss_unchecked(&mut self, amount: u128) {
        self.cumulative_loss = self.cumulative_loss.saturating_add(amount);
        warn!(
            amount,
            cumulative = self.cumulative_loss,
            "loss recorded without limit enforcement"
        );
    }

    /// Changes the tolerance. 100% or more is rejected.
    pub fn set_tolerance(&mut self, tolerance_bps: u64) -> Result<(), VaultError> {
        validate_loss_tolerance(tolerance_bps)?;
        self.tolerance_bps = tolerance_bps;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(base: u128, bps: u64) -> LossTracker {
        let mut tracker = LossTracker::new(bps).unwrap();
        tracker.roll_epoch_if_needed(1, false, base);
        tracker
    }

    #[test]
    fn losses_up_to_the_limit_are_accepted() {
        // 1% of 1_000_000 = 10_000.
        let mut tracker = tracker(1_000_000, 100);
        tracker.record_loss(4_000).unwrap();
        tracker.record_loss(6_000).unwrap();
        assert_eq!(tracker.cumulative_loss(), 10_000);
    }

    #[test]
    fn one_unit_past_the_limit_is_rejected() {
        let mut tracker = tracker(1_000_000, 100);
        tracker.record_loss(10_000).unwrap();
        assert_eq!(
            tracker.record_loss(1),
            Err(VaultError::ExceedsLossLimit {
                cumulative: 10_001,
                limit: 10_000
            })
        );
        // Rejected loss is not recorded.
        assert_eq!(tracker.cumulative_loss(), 10_000);
    }

    #[test]
    fn epoch_advance_resets_the_budget() {
        let mut tracker = tracker(1_000_000, 100);
        tracker.record_loss(10_000).unwrap();

        assert!(!tracker.roll_epoch_if_needed(1, false, 2_000_000));
        assert_eq!(tracker.cumulative_loss(), 10_000);

        assert!(tracker.roll_epoch_if_needed(2, false, 2_000_000));
        assert_eq!(tracker.cumulative_loss(), 0);
        assert_eq!(tracker.base_usd_value(), 2_000_000);
        assert_eq!(tracker.limit().unwrap(), 20_000);
    }

    #[test]
    fn forced_reset_within_an_epoch() {
        let mut tracker = tracker(1_000_000, 100);
        tracker.record_loss(5_000).unwrap();
        assert!(tracker.roll_epoch_if_needed(1, true, 900_000));
        assert_eq!(tracker.epoch_id(), 1);
        assert_eq!(tracker.cumulative_loss(), 0);
    }

    #[test]
    fn full_tolerance_is_refused() {
        assert!(LossTracker::new(10_000).is_err());
        let mut tracker = LossTracker::default();
        assert!(tracker.set_tolerance(10_000).is_err());
        assert_eq!(tracker.tolerance_bps(), DEFAULT_LOSS_TOLERANCE_BPS);
    }

    #[test]
    fn unchecked_recording_overshoots_visibly() {
        let mut tracker = tracker(1_000, 100);
        tracker.record_loss_unchecked(500);
        assert_eq!(tracker.cumulative_loss(), 500);
        assert!(tracker.check_loss(0).is_err());
    }
}
