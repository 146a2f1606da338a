//! Position valuation contract.
//!
//! External protocol adaptors (lending markets, AMMs, other vaults) implement
//! [`PositionValuator`]. A valuation must report every economically
//! claimable component of the position separately so the vault can store
//! their sum; an adaptor that leaves out uncollected fees or rewards
//! undervalues the vault.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::asset::PositionRef;
use crate::error::VaultError;
use crate::oracle::PriceCache;

/// Canonical-precision USD value of a position, by component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionValuation {
    /// Supplied collateral net of debt, or the liquidity's token amounts.
    pub principal_usd: u128,
    /// Fees earned but not yet collected.
    pub unclaimed_fees_usd: u128,
    /// Incentive rewards earned but not yet claimed.
    pub unclaimed_rewards_usd: u128,
}

impl PositionValuation {
    /// Checked sum of all components.
    pub fn total(&self) -> Result<u128, VaultError> {
        self.principal_usd
            .checked_add(self.unclaimed_fees_usd)
            .and_then(|v| v.checked_add(self.unclaimed_rewards_usd))
            .ok_or(VaultError::ArithmeticOverflow("position valuation"))
    }
}

/// Prices an external position.
pub trait PositionValuator {
    /// Values `position` using normalized prices from `prices` at `now`.
    ///
    /// Implementations must propagate [`VaultError::StalePrice`] rather than
    /// substitute a zero price.
    fn value_usd(
        &self,
        position: &PositionRef,
        prices: &PriceCache,
        now: DateTime<Utc>,
    ) -> Result<PositionValuation, VaultError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_includes_unclaimed_components() {
        let valuation = PositionValuation {
            principal_usd: 1_000,
            unclaimed_fees_usd: 15,
            unclaimed_rewards_usd: 5,
        };
        assert_eq!(valuation.total().unwrap(), 1_020);
    }

    #[test]
    fn total_overflow_is_an_error() {
        let valuation = PositionValuation {
            principal_usd: u128::MAX,
            unclaimed_fees_usd: 1,
            unclaimed_rewards_usd: 0,
        };
        assert!(matches!(
            valuation.total(),
            Err(VaultError::ArithmeticOverflow(_))
        ));
    }
}
