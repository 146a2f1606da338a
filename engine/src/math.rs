//! Fixed-point arithmetic.
//!
//! Every division in the engine goes through [`mul_div`]. It checks the
//! denominator before dividing and the product before it can wrap, so call
//! sites never carry their own zero checks.

use crate::config::{BPS_SCALE, CANONICAL_DECIMALS, PRICE_SCALE, RATIO_SCALE};
use crate::error::VaultError;

/// `a × b / denominator`, rounded toward zero.
///
/// Fails with [`VaultError::ZeroDenominator`] (carrying `context`) when the
/// denominator is zero, and with [`VaultError::ArithmeticOverflow`] when the
/// intermediate product does not fit in `u128`.
pub fn mul_div(a: u128, b: u128, denominator: u128, context: &'static str) -> Result<u128, VaultError> {
    if denominator == 0 {
        return Err(VaultError::ZeroDenominator(context));
    }
    let product = a
        .checked_mul(b)
        .ok_or(VaultError::ArithmeticOverflow(context))?;
    Ok(product / denominator)
}

/// `a × b / 10^18`.
pub fn mul_d(a: u128, b: u128) -> Result<u128, VaultError> {
    mul_div(a, b, RATIO_SCALE, "ratio multiplication")
}

/// `a × 10^18 / b`.
pub fn div_d(a: u128, b: u128, context: &'static str) -> Result<u128, VaultError> {
    mul_div(a, RATIO_SCALE, b, context)
}

/// `10^exp` for exponents that fit in `u128`.
pub fn pow10(exp: u32) -> Result<u128, VaultError> {
    10u128
        .checked_pow(exp)
        .ok_or(VaultError::ArithmeticOverflow("power of ten"))
}

/// Rescales an 18-decimal price per whole token so that
/// `amount × normalized / 10^18` is a canonical-precision USD value for an
/// `amount` in the asset's native units.
pub fn normalize_price(price: u128, native_decimals: u8) -> Result<u128, VaultError> {
    let native = u32::from(native_decimals);
    if native < CANONICAL_DECIMALS {
        price
            .checked_mul(pow10(CANONICAL_DECIMALS - native)?)
            .ok_or(VaultError::ArithmeticOverflow("price normalization"))
    } else {
        mul_div(price, 1, pow10(native - CANONICAL_DECIMALS)?, "price normalization")
    }
}

/// USD value of `amount` native units at a normalized price.
pub fn usd_value(amount: u128, normalized_price: u128) -> Result<u128, VaultError> {
    mul_div(amount, normalized_price, PRICE_SCALE, "usd value")
}

/// Native units worth `usd` at a normalized price.
pub fn amount_for_usd(usd: u128, normalized_price: u128) -> Result<u128, VaultError> {
    mul_div(usd, PRICE_SCALE, normalized_price, "price is zero")
}

/// Splits `amount` into `(net, fee)` at `fee_bps`.
pub fn split_fee(amount: u128, fee_bps: u64) -> Result<(u128, u128), VaultError> {
    let fee = mul_div(amount, u128::from(fee_bps), u128::from(BPS_SCALE), "fee")?;
    let net = amount
        .checked_sub(fee)
        .ok_or(VaultError::ArithmeticOverflow("fee exceeds amount"))?;
    Ok((net, fee))
}
