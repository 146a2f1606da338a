//! Share accounting.
//!
//! Pure conversions between USD value, shares and principal. Ratios are
//! 18-decimal fixed point; see [`crate::config::RATIO_SCALE`]. Every
//! division goes through [`crate::math`], so a zero denominator is an
//! error here, never a zero result.

use crate::config::RATIO_SCALE;
use crate::error::VaultError;
use crate::math::{amount_for_usd, div_d, mul_d};

/// Value of one share.
///
/// A vault with no shares trades at exactly [`RATIO_SCALE`] (1.0). A vault
/// with shares but no value has no meaningful ratio, and that is an error:
/// handing a zero ratio to the next division is how vaults get drained.
pub fn share_ratio(total_value: u128, total_shares: u128) -> Result<u128, VaultError> {
    if total_shares == 0 {
        return Ok(RATIO_SCALE);
    }
    if total_value == 0 {
        return Err(VaultError::ZeroDenominator(
            "share ratio: total value is zero while shares are outstanding",
        ));
    }
    let ratio = div_d(total_value, total_shares, "share ratio")?;
    if ratio == 0 {
        return Err(VaultError::ZeroDenominator(
            "share ratio: value per share rounds to zero",
        ));
    }
    Ok(ratio)
}

/// Shares minted for `usd_delta` of new value at `ratio_before`.
///
/// Callers must reject a zero result.
pub fn shares_for_deposit(usd_delta: u128, ratio_before: u128) -> Result<u128, VaultError> {
    div_d(usd_delta, ratio_before, "share ratio is zero")
}

/// USD value of `shares` at `ratio`.
pub fn usd_for_shares(shares: u128, ratio: u128) -> Result<u128, VaultError> {
    mul_d(shares, ratio)
}

/// Principal units worth `usd_value` at a normalized principal price.
pub fn principal_for_withdraw(usd_value: u128, principal_price: u128) -> Result<u128, VaultError> {
    amount_for_usd(usd_value, principal_price)
}
