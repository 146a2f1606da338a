//! # Engine Configuration & Constants
//!
//! Every number that shapes vault behaviour lives here: fixed-point scales,
//! fee caps, staleness bounds, locking windows. If you are hardcoding one of
//! these somewhere else, move it here.
//!
//! Runtime-tunable values are grouped into [`VaultConfig`] (one per vault)
//! and [`OracleConfig`] (one per [`PriceCache`](crate::oracle::PriceCache)).
//! Both have `Default` impls built from the constants below and a
//! `validate()` that admin setters run before anything is written.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Fixed-Point Scales
// ---------------------------------------------------------------------------

/// Canonical USD precision. Every cached asset value and every vault total
/// carries exactly this many decimals, whatever the native decimals of the
/// asset it came from.
pub const CANONICAL_DECIMALS: u32 = 9;

/// Oracle prices are USD per whole token with 18 decimals.
pub const PRICE_DECIMALS: u32 = 18;

/// `10^PRICE_DECIMALS`.
pub const PRICE_SCALE: u128 = 1_000_000_000_000_000_000;

/// Share ratio unit. A ratio of `RATIO_SCALE` means one share is worth one
/// canonical USD unit, and is the ratio of a vault with no shares.
pub const RATIO_SCALE: u128 = 1_000_000_000_000_000_000;

/// Basis-point denominator for fees and loss tolerance.
pub const BPS_SCALE: u64 = 10_000;

/// Largest native decimal count an asset may register with. Keeps every
/// power of ten used by price normalization inside `u128`.
pub const MAX_ASSET_DECIMALS: u8 = 36;

// ---------------------------------------------------------------------------
// Fees
// ---------------------------------------------------------------------------

/// Default deposit fee: 10 bps (0.1%).
pub const DEFAULT_DEPOSIT_FEE_BPS: u64 = 10;

/// Default withdraw fee: 10 bps (0.1%).
pub const DEFAULT_WITHDRAW_FEE_BPS: u64 = 10;

/// Hard cap on either fee: 500 bps (5%).
pub const MAX_FEE_BPS: u64 = 500;

// ---------------------------------------------------------------------------
// Loss Tolerance
// ---------------------------------------------------------------------------

/// Default per-epoch loss budget: 10 bps of the epoch's base value.
pub const DEFAULT_LOSS_TOLERANCE_BPS: u64 = 10;

/// Tolerance must stay strictly below this. At 100% the budget covers the
/// whole vault and the control does nothing.
pub const LOSS_TOLERANCE_CEILING_BPS: u64 = BPS_SCALE;

// ---------------------------------------------------------------------------
// Staleness & Windows
// ---------------------------------------------------------------------------

/// Default freshness bound for cached asset values. Zero: every value must
/// have been refreshed at the same instant the total is read.
pub const DEFAULT_VALUATION_FRESHNESS_MS: u64 = 0;

/// Default staleness bound for cached oracle prices: one minute.
pub const DEFAULT_PRICE_STALENESS_MS: u64 = 60_000;

/// Default minimum effective price. Never zero: a zero price would value a
/// whole position at nothing.
pub const DEFAULT_MIN_EFFECTIVE_PRICE: u128 = 1;

/// Default time a receipt must wait after its last deposit before it can
/// request a withdrawal: 12 hours.
pub const DEFAULT_WITHDRAW_LOCK_MS: u64 = 12 * 60 * 60 * 1_000;

/// Default time a request must sit in the ledger before its requester can
/// cancel it: 5 minutes.
pub const DEFAULT_CANCEL_LOCK_MS: u64 = 5 * 60 * 1_000;

/// Default delay after an operation starts before the admin may force it
/// closed: 72 hours.
pub const DEFAULT_EMERGENCY_OVERRIDE_DELAY_MS: u64 = 72 * 60 * 60 * 1_000;

/// The emergency override can never be configured shorter than one hour.
pub const MIN_EMERGENCY_OVERRIDE_DELAY_MS: u64 = 60 * 60 * 1_000;

/// Upper bound for any configured window or staleness bound: 365 days.
pub const MAX_WINDOW_MS: u64 = 365 * 24 * 60 * 60 * 1_000;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A configuration value failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A fee rate exceeds [`MAX_FEE_BPS`].
    #[error("{field} of {value} bps exceeds the {max} bps cap")]
    FeeTooHigh {
        /// Which fee.
        field: &'static str,
        /// The rejected value.
        value: u64,
        /// The cap.
        max: u64,
    },

    /// Loss tolerance at or above 100% disables the loss control entirely.
    #[error("loss tolerance of {0} bps disables the loss control (must be < 10000)")]
    LossToleranceDisablesControl(u64),

    /// A zero minimum effective price would accept zero-priced assets.
    #[error("minimum effective price must be non-zero")]
    ZeroMinimumPrice,

    /// A window or bound exceeds [`MAX_WINDOW_MS`].
    #[error("{field} of {value} ms exceeds the {max} ms maximum")]
    WindowTooLong {
        /// Which window.
        field: &'static str,
        /// The rejected value.
        value: u64,
        /// The maximum.
        max: u64,
    },

    /// The emergency override delay is shorter than the allowed minimum.
    #[error("emergency override delay of {value} ms is below the {min} ms minimum")]
    OverrideDelayTooShort {
        /// The rejected value.
        value: u64,
        /// The minimum.
        min: u64,
    },

    /// A configuration document could not be parsed.
    #[error("malformed configuration: {0}")]
    Malformed(String),
}

// ---------------------------------------------------------------------------
// Field validators
// ---------------------------------------------------------------------------

/// Checks a fee rate against [`MAX_FEE_BPS`].
pub fn validate_fee(field: &'static str, bps: u64) -> Result<(), ConfigError> {
    if bps > MAX_FEE_BPS {
        return Err(ConfigError::FeeTooHigh {
            field,
            value: bps,
            max: MAX_FEE_BPS,
        });
    }
    Ok(())
}

/// Checks a loss tolerance. 100% and above is rejected, not clamped.
pub fn validate_loss_tolerance(bps: u64) -> Result<(), ConfigError> {
    if bps >= LOSS_TOLERANCE_CEILING_BPS {
        return Err(ConfigError::LossToleranceDisablesControl(bps));
    }
    Ok(())
}

/// Checks a millisecond window against [`MAX_WINDOW_MS`].
pub fn validate_window(field: &'static str, ms: u64) -> Result<(), ConfigError> {
    if ms > MAX_WINDOW_MS {
        return Err(ConfigError::WindowTooLong {
            field,
            value: ms,
            max: MAX_WINDOW_MS,
        });
    }
    Ok(())
}

/// Checks the emergency override delay: at least the minimum, at most a year.
pub fn validate_override_delay(ms: u64) -> Result<(), ConfigError> {
    if ms < MIN_EMERGENCY_OVERRIDE_DELAY_MS {
        return Err(ConfigError::OverrideDelayTooShort {
            value: ms,
            min: MIN_EMERGENCY_OVERRIDE_DELAY_MS,
        });
    }
    validate_window("emergency_override_delay_ms", ms)
}

/// Checks the minimum effective price is non-zero.
pub fn validate_min_price(price: u128) -> Result<(), ConfigError> {
    if price == 0 {
        return Err(ConfigError::ZeroMinimumPrice);
    }
    Ok(())
}

/// Converts a validated millisecond window to a `chrono::Duration`.
///
/// Windows are capped at [`MAX_WINDOW_MS`] by validation, so the cast
/// cannot wrap.
pub fn window(ms: u64) -> Duration {
    Duration::milliseconds(ms.min(MAX_WINDOW_MS) as i64)
}

// ---------------------------------------------------------------------------
// VaultConfig
// ---------------------------------------------------------------------------

/// Per-vault tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Deposit fee in basis points, taken from the principal before shares
    /// are minted.
    pub deposit_fee_bps: u64,

    /// Withdraw fee in basis points, taken from the principal paid out.
    pub withdraw_fee_bps: u64,

    /// Per-epoch loss budget as a fraction of the epoch's base value.
    pub loss_tolerance_bps: u64,

    /// Maximum age of a cached asset value before `total_value` refuses it.
    pub valuation_freshness_ms: u64,

    /// Minimum time between a receipt's last deposit and a withdraw request.
    pub withdraw_lock_ms: u64,

    /// Minimum time a request must be queued before it can be cancelled.
    pub cancel_lock_ms: u64,

    /// Time after an operation starts before the admin override unlocks.
    pub emergency_override_delay_ms: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            deposit_fee_bps: DEFAULT_DEPOSIT_FEE_BPS,
            withdraw_fee_bps: DEFAULT_WITHDRAW_FEE_BPS,
            loss_tolerance_bps: DEFAULT_LOSS_TOLERANCE_BPS,
            valuation_freshness_ms: DEFAULT_VALUATION_FRESHNESS_MS,
            withdraw_lock_ms: DEFAULT_WITHDRAW_LOCK_MS,
            cancel_lock_ms: DEFAULT_CANCEL_LOCK_MS,
            emergency_override_delay_ms: DEFAULT_EMERGENCY_OVERRIDE_DELAY_MS,
        }
    }
}

impl VaultConfig {
    /// Validates every field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_fee("deposit_fee_bps", self.deposit_fee_bps)?;
        validate_fee("withdraw_fee_bps", self.withdraw_fee_bps)?;
        validate_loss_tolerance(self.loss_tolerance_bps)?;
        validate_window("valuation_freshness_ms", self.valuation_freshness_ms)?;
        validate_window("withdraw_lock_ms", self.withdraw_lock_ms)?;
        validate_window("cancel_lock_ms", self.cancel_lock_ms)?;
        validate_override_delay(self.emergency_override_delay_ms)?;
        Ok(())
    }

    /// Freshness bound as a duration.
    pub fn valuation_freshness(&self) -> Duration {
        window(self.valuation_freshness_ms)
    }

    /// Withdraw locking window as a duration.
    pub fn withdraw_lock(&self) -> Duration {
        window(self.withdraw_lock_ms)
    }

    /// Cancel locking window as a duration.
    pub fn cancel_lock(&self) -> Duration {
        window(self.cancel_lock_ms)
    }

    /// Emergency override delay as a duration.
    pub fn emergency_override_delay(&self) -> Duration {
        window(self.emergency_override_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// OracleConfig
// ---------------------------------------------------------------------------

/// Price cache tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Maximum age of a cached price before reads fail with `StalePrice`.
    pub staleness_bound_ms: u64,

    /// Refreshes below this price are rejected. Never zero.
    pub min_effective_price: u128,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            staleness_bound_ms: DEFAULT_PRICE_STALENESS_MS,
            min_effective_price: DEFAULT_MIN_EFFECTIVE_PRICE,
        }
    }
}

impl OracleConfig {
    /// Validates every field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_window("staleness_bound_ms", self.staleness_bound_ms)?;
        validate_min_price(self.min_effective_price)?;
        Ok(())
    }

    /// Staleness bound as a duration.
    pub fn staleness_bound(&self) -> Duration {
        window(self.staleness_bound_ms)
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Everything a host needs to stand up one vault and its price cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Vault tunables.
    pub vault: VaultConfig,
    /// Price cache tunables.
    pub oracle: OracleConfig,
}

impl EngineConfig {
    /// Parses and validates a JSON configuration document. Missing fields
    /// take their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            serde_json::from_str(raw).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates both halves.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.vault.validate()?;
        self.oracle.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn scales_match_their_decimals() {
        assert_eq!(PRICE_SCALE, 10u128.pow(PRICE_DECIMALS));
        assert_eq!(RATIO_SCALE, 10u128.pow(18));
    }

    #[test]
    fn full_loss_tolerance_is_rejected() {
        assert_eq!(
            validate_loss_tolerance(10_000),
            Err(ConfigError::LossToleranceDisablesControl(10_000))
        );
        assert!(validate_loss_tolerance(9_999).is_ok());
        assert!(validate_loss_tolerance(0).is_ok());
    }

    #[test]
    fn zero_min_price_is_rejected() {
        let config = OracleConfig {
            min_effective_price: 0,
            ..OracleConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroMinimumPrice));
    }

    #[test]
    fn fee_cap_enforced() {
        assert!(validate_fee("deposit_fee_bps", MAX_FEE_BPS).is_ok());
        assert!(validate_fee("deposit_fee_bps", MAX_FEE_BPS + 1).is_err());
    }

    #[test]
    fn override_delay_has_a_floor() {
        assert!(validate_override_delay(MIN_EMERGENCY_OVERRIDE_DELAY_MS - 1).is_err());
        assert!(validate_override_delay(MIN_EMERGENCY_OVERRIDE_DELAY_MS).is_ok());
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = EngineConfig::from_json_str(r#"{"vault":{"deposit_fee_bps":100}}"#).unwrap();
        assert_eq!(config.vault.deposit_fee_bps, 100);
        assert_eq!(config.vault.withdraw_fee_bps, DEFAULT_WITHDRAW_FEE_BPS);
        assert_eq!(config.oracle, OracleConfig::default());
    }

    #[test]
    fn json_with_invalid_values_is_rejected() {
        let err = EngineConfig::from_json_str(r#"{"oracle":{"min_effective_price":0}}"#);
        assert_eq!(err, Err(ConfigError::ZeroMinimumPrice));

        let err = EngineConfig::from_json_str("not json");
        assert!(matches!(err, Err(ConfigError::Malformed(_))));
    }
}
