//! # Engine Error Taxonomy
//!
//! One error type for every vault entry point. Each variant aborts the call
//! it is returned from; none are retried or recovered inside the engine.
//! Hosts surface [`VaultError::code`] as the failed call's error code.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::asset::AssetType;
use crate::config::ConfigError;
use crate::receipt::ReceiptId;

/// Errors returned by vault, price cache and registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VaultError {
    // -- Taxonomy ----------------------------------------------------------
    /// A cached price is missing or older than the staleness bound.
    #[error("stale price for {asset}: last updated {last_updated:?}")]
    StalePrice {
        /// The asset whose price is stale.
        asset: AssetType,
        /// When the price was last refreshed, if ever.
        last_updated: Option<DateTime<Utc>>,
    },

    /// A cached asset value is missing or older than the freshness bound.
    #[error("stale valuation for {asset}: last updated {last_updated:?}")]
    StaleValuation {
        /// The asset whose value is stale.
        asset: AssetType,
        /// When the value was last updated, if ever.
        last_updated: Option<DateTime<Utc>>,
    },

    /// A division was attempted with a zero denominator.
    #[error("zero denominator: {0}")]
    ZeroDenominator(&'static str),

    /// The vault is not in a status that allows this call.
    #[error("invalid state transition: vault is {current}, expected {expected}")]
    InvalidStateTransition {
        /// The vault's current status.
        current: String,
        /// What the call required.
        expected: String,
    },

    /// A borrowed asset has not been returned, or has not been revalued
    /// since it was returned.
    #[error("asset not returned or not revalued: {0}")]
    AssetNotReturned(AssetType),

    /// Realized loss would push the epoch total past its budget.
    #[error("loss limit exceeded: cumulative loss {cumulative} > limit {limit}")]
    ExceedsLossLimit {
        /// Cumulative epoch loss including the rejected amount.
        cumulative: u128,
        /// The epoch budget.
        limit: u128,
    },

    /// An execution result fell outside the requester's bounds.
    #[error("slippage exceeded: got {actual}, allowed [{min}, {max}]")]
    SlippageExceeded {
        /// What execution would produce.
        actual: u128,
        /// Lower bound from the request.
        min: u128,
        /// Upper bound from the executor.
        max: u128,
    },

    /// The operator capability has been revoked.
    #[error("operator {0} is revoked")]
    OperatorRevoked(Uuid),

    /// No pending request with this id.
    #[error("request not found: {0}")]
    RequestNotFound(String),

    /// The caller is not the identity bound to the request or receipt.
    #[error("identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch {
        /// The bound identity.
        expected: String,
        /// The presented identity.
        actual: String,
    },

    // -- Supporting ----------------------------------------------------------
    /// The asset is not registered.
    #[error("asset not registered: {0}")]
    AssetNotRegistered(AssetType),

    /// The asset is already registered.
    #[error("asset already registered: {0}")]
    AssetAlreadyRegistered(AssetType),

    /// A price refresh was below the configured minimum effective price.
    #[error("price {price} for {asset} is below the minimum effective price {min}")]
    PriceBelowMinimum {
        /// The asset.
        asset: AssetType,
        /// The rejected price.
        price: u128,
        /// The configured minimum.
        min: u128,
    },

    /// The oracle has no valid price for this asset.
    #[error("no valid price available for {0}")]
    PriceUnavailable(AssetType),

    /// The oracle reported a different decimal precision than registered.
    #[error("decimals mismatch for {asset}: registered {registered}, observed {observed}")]
    DecimalsMismatch {
        /// The asset.
        asset: AssetType,
        /// Registered native decimals.
        registered: u8,
        /// Decimals reported by the source.
        observed: u8,
    },

    /// The asset registered with more decimals than the engine supports.
    #[error("unsupported decimals {decimals} for {asset}")]
    UnsupportedDecimals {
        /// The asset.
        asset: AssetType,
        /// The rejected decimals.
        decimals: u8,
    },

    /// Checked arithmetic overflowed or underflowed.
    #[error("arithmetic overflow: {0}")]
    ArithmeticOverflow(&'static str),

    /// A zero amount where a positive one is required.
    #[error("zero amount: {0}")]
    ZeroAmount(&'static str),

    /// The presented capability does not belong to this vault.
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),

    /// No receipt account with this id, or the receipt belongs to another
    /// vault.
    #[error("receipt not found: {0}")]
    ReceiptNotFound(ReceiptId),

    /// The receipt already has a pending request.
    #[error("receipt {0} already has a pending request")]
    ReceiptBusy(ReceiptId),

    /// A locking window has not elapsed yet.
    #[error("{what} locked until {until}")]
    Locked {
        /// Which window.
        what: &'static str,
        /// When it opens.
        until: DateTime<Utc>,
    },

    /// Not enough free principal to cover the call.
    #[error("insufficient liquidity: need {needed}, have {available}")]
    InsufficientLiquidity {
        /// Amount required.
        needed: u128,
        /// Amount available.
        available: u128,
    },

    /// The receipt does not hold enough shares.
    #[error("insufficient shares: need {needed}, have {available}")]
    InsufficientShares {
        /// Shares required.
        needed: u128,
        /// Shares held.
        available: u128,
    },

    /// An asset was returned that was not borrowed, twice, or with the
    /// wrong identity.
    #[error("unexpected asset: {0}")]
    UnexpectedAsset(AssetType),

    /// Total shares moved while an operation was running.
    #[error("total shares changed during operation: {before} -> {after}")]
    SharesChanged {
        /// Shares at operation start.
        before: u128,
        /// Shares at completion.
        after: u128,
    },

    /// The emergency override is still time-locked.
    #[error("emergency override available at {0}")]
    OverrideNotYetAvailable(DateTime<Utc>),

    /// Registering this receipt holding would create an ownership cycle.
    #[error("receipt holding {holder} -> {issuer} would create a cycle")]
    ReceiptCycle {
        /// Vault that would hold the receipt.
        holder: Uuid,
        /// Vault that issued the receipt.
        issuer: Uuid,
    },

    /// No vault with this id in the registry.
    #[error("vault not found: {0}")]
    VaultNotFound(Uuid),

    /// The asset still holds a balance or a non-zero value.
    #[error("asset is not empty: {0}")]
    AssetNotEmpty(AssetType),

    /// An operation ticket does not match the running operation.
    #[error("ticket does not match the running operation")]
    TicketMismatch,

    /// A configuration value was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl VaultError {
    /// Stable numeric code for hosts that report failures as integers.
    pub fn code(&self) -> u16 {
        match self {
            VaultError::StalePrice { .. } => 1001,
            VaultError::StaleValuation { .. } => 1002,
            VaultError::ZeroDenominator(_) => 1003,
            VaultError::InvalidStateTransition { .. } => 1004,
            VaultError::AssetNotReturned(_) => 1005,
            VaultError::ExceedsLossLimit { .. } => 1006,
            VaultError::SlippageExceeded { .. } => 1007,
            VaultError::OperatorRevoked(_) => 1008,
            VaultError::RequestNotFound(_) => 1009,
            VaultError::IdentityMismatch { .. } => 1010,
            VaultError::AssetNotRegistered(_) => 2001,
            VaultError::AssetAlreadyRegistered(_) => 2002,
            VaultError::PriceBelowMinimum { .. } => 2003,
            VaultError::PriceUnavailable(_) => 2004,
            VaultError::DecimalsMismatch { .. } => 2005,
            VaultError::UnsupportedDecimals { .. } => 2006,
            VaultError::ArithmeticOverflow(_) => 2007,
            VaultError::ZeroAmount(_) => 2008,
            VaultError::Unauthorized(_) => 2009,
            VaultError::ReceiptNotFound(_) => 2010,
            VaultError::ReceiptBusy(_) => 2011,
            VaultError::Locked { .. } => 2012,
            VaultError::InsufficientLiquidity { .. } => 2013,
            VaultError::InsufficientShares { .. } => 2014,
            VaultError::UnexpectedAsset(_) => 2015,
            VaultError::SharesChanged { .. } => 2016,
            VaultError::OverrideNotYetAvailable(_) => 2017,
            VaultError::ReceiptCycle { .. } => 2018,
            VaultError::VaultNotFound(_) => 2019,
            VaultError::TicketMismatch => 2020,
            VaultError::AssetNotEmpty(_) => 2021,
            VaultError::Config(_) => 3001,
        }
    }
}
