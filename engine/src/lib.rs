// Copyright (c) 2026 Tidepool Contributors. MIT License.
// See LICENSE for details.

//! # Tidepool Engine — Vault Valuation & Custody Core
//!
//! A Tidepool vault pools deposits of a single principal asset, issues
//! redeemable shares against it, and periodically lends its holdings
//! (coins, lending positions, AMM liquidity, receipts of other vaults) to an
//! operator who puts them to work elsewhere. This crate is the part that has
//! to be right: what the vault is worth, who owns what, and whether the
//! operator brought everything back.
//!
//! ## Architecture
//!
//! Leaf-first, the way data flows through a vault:
//!
//! - **oracle** — [`PriceCache`]: cached prices with staleness bounds and a
//!   single canonical decimal precision.
//! - **valuation** — per-asset USD values and the one function allowed to
//!   sum them.
//! - **shares** — share ratio and the conversions between USD, shares and
//!   principal.
//! - **requests** — buffered deposit/withdraw intents, executed by an
//!   operator against a ratio snapshot.
//! - **operation** — the borrow → return → revalue state machine.
//! - **loss** — per-epoch loss budget fed by every completed operation.
//! - **guard** — the single authorization chokepoint for privileged calls.
//! - **registry** — many vaults side by side, with cycle-free cross-vault
//!   receipt holdings valued from snapshots.
//!
//! ## Design Principles
//!
//! 1. No floats. Every amount is a `u128` fixed-point integer and every
//!    division goes through [`math::mul_div`], which refuses a zero
//!    denominator before it divides.
//! 2. Validate first, commit last. A call that returns `Err` has not touched
//!    the vault.
//! 3. The host owns time. Entry points take a [`Clock`]; the engine never
//!    reads the wall clock.
//! 4. Capabilities, not booleans: admin and operator rights are values you
//!    must present, checked in one place.

pub mod asset;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod guard;
pub mod loss;
pub mod math;
pub mod operation;
pub mod oracle;
pub mod receipt;
pub mod registry;
pub mod requests;
pub mod shares;
pub mod valuation;
pub mod valuator;
pub mod vault;

pub use asset::{Asset, AssetType, Borrow, Holding, PositionKind, PositionRef};
pub use clock::Clock;
pub use config::{ConfigError, EngineConfig, OracleConfig, VaultConfig};
pub use error::VaultError;
pub use events::VaultEvent;
pub use guard::{Access, AdminCap, Guard, OperatorCap, StatusRequirement};
pub use loss::LossTracker;
pub use operation::{
    OperationRecord, OperationSummary, OperationTicket, OverrideSummary, ValueUpdateTicket,
};
pub use oracle::{PriceCache, PriceCacheEntry, PriceObservation, PriceSource};
pub use receipt::{Identity, Receipt, ReceiptAccount, ReceiptId, ReceiptStatus};
pub use registry::{ReceiptBalance, ReceiptValuator, ShareSnapshot, VaultHandle, VaultRegistry};
pub use requests::{
    DepositExecution, DepositRequest, Payout, RequestId, RequestLedger, WithdrawExecution,
    WithdrawRequest,
};
pub use valuation::{AssetValue, ValuationTable};
pub use valuator::{PositionValuation, PositionValuator};
pub use vault::{Vault, VaultId, VaultStatus};
