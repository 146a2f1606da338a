//! # Receipts
//!
//! A [`Receipt`] is what a depositor carries around: a capability naming one
//! [`ReceiptAccount`] inside one vault. The account is what the vault
//! actually keeps. It records who is *entitled* to the account's shares,
//! and that identity moves only through an explicit
//! [`Vault::transfer_entitlement`](crate::vault::Vault::transfer_entitlement)
//! call. Handing the `Receipt` value to someone else moves nothing.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::asset::AssetType;
use crate::error::VaultError;

/// A caller identity as the host authenticates it (an address, an account
/// name). The engine only compares these for equality.
pub type Identity = String;

/// Receipt account id.
pub type ReceiptId = Uuid;

/// Capability referencing a receipt account. Not `Clone`.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    id: ReceiptId,
    vault_id: Uuid,
}

impl Receipt {
    pub(crate) fn new(vault_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            vault_id,
        }
    }

    /// The account this receipt names.
    pub fn id(&self) -> ReceiptId {
        self.id
    }

    /// The vault that issued it.
    pub fn vault_id(&self) -> Uuid {
        self.vault_id
    }
}

/// Whether a receipt account has a request in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptStatus {
    /// No pending request.
    Idle,
    /// A deposit request is queued.
    PendingDeposit,
    /// A withdraw request is queued.
    PendingWithdraw,
}

impl fmt::Display for ReceiptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceiptStatus::Idle => write!(f, "Idle"),
            ReceiptStatus::PendingDeposit => write!(f, "PendingDeposit"),
            ReceiptStatus::PendingWithdraw => write!(f, "PendingWithdraw"),
        }
    }
}

/// Per-depositor accounting record, owned by the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptAccount {
    /// Account id.
    pub receipt_id: ReceiptId,
    /// Identity entitled to this account's shares and payouts.
    pub entitled: Identity,
    /// Request state.
    pub status: ReceiptStatus,
    /// Shares owned.
    pub shares: u128,
    /// Principal buffered by a pending deposit.
    pub pending_deposit: u128,
    /// Shares locked by a pending withdraw.
    pub pending_withdraw_shares: u128,
    /// Cumulative principal deposited, net of fees.
    pub total_deposited: u128,
    /// Cumulative principal paid out, net of fees.
    pub total_withdrawn: u128,
    /// When the last deposit was executed.
    pub last_deposit_at: Option<DateTime<Utc>>,
    /// Reward index per reward asset at the last claim. Stored for the host's
    /// reward distributor; the engine does not advance these.
    pub reward_indices: BTreeMap<AssetType, u128>,
}

impl ReceiptAccount {
    pub(crate) fn open(receipt_id: ReceiptId, entitled: Identity) -> Self {
        Self {
            receipt_id,
            entitled,
            status: ReceiptStatus::Idle,
            shares: 0,
            pending_deposit: 0,
            pending_withdraw_shares: 0,
            total_deposited: 0,
            total_withdrawn: 0,
            last_deposit_at: None,
            reward_indices: BTreeMap::new(),
        }
    }

    /// Fails with [`VaultError::IdentityMismatch`] unless `caller` is the
    /// entitled identity.
    pub fn ensure_entitled(&self, caller: &str) -> Result<(), VaultError> {
        if self.entitled != caller {
            return Err(VaultError::IdentityMismatch {
                expected: self.entitled.clone(),
                actual: caller.to_string(),
            });
        }
        Ok(())
    }

    /// Fails with [`VaultError::ReceiptBusy`] unless the account is idle.
    pub fn ensure_idle(&self) -> Result<(), VaultError> {
        if self.status != ReceiptStatus::Idle {
            return Err(VaultError::ReceiptBusy(self.receipt_id));
        }
        Ok(())
    }

    /// Shares not locked by a pending withdraw.
    pub fn available_shares(&self) -> u128 {
        self.shares.saturating_sub(self.pending_withdraw_shares)
    }
}
