//! Vault event log.
//!
//! Every committed state change appends one [`VaultEvent`]. The host drains
//! them with [`Vault::drain_events`](crate::vault::Vault::drain_events) after
//! each call and forwards them wherever it keeps history. Failed calls append
//! nothing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::asset::AssetType;
use crate::receipt::{Identity, ReceiptId};
use crate::requests::RequestId;
use crate::vault::{VaultId, VaultStatus};

/// A committed vault state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum VaultEvent {
    /// The vault was created.
    VaultCreated {
        vault_id: VaultId,
        principal: AssetType,
    },
    /// A coin or position slot was added.
    AssetRegistered { asset: AssetType },
    /// A slot was removed.
    AssetRemoved { asset: AssetType },
    /// A slot's cached USD value was overwritten.
    ValueUpdated {
        asset: AssetType,
        usd_value: u128,
        at: DateTime<Utc>,
    },
    /// Status changed outside the operation lifecycle (enable/disable).
    StatusChanged { from: VaultStatus, to: VaultStatus },
    /// An operator capability was revoked or restored.
    OperatorFrozen { operator: Uuid, frozen: bool },
    /// A configuration value was changed.
    ConfigUpdated { field: String, value: u128 },
    /// The loss budget started over.
    LossEpochReset {
        epoch: u64,
        base_usd_value: u128,
        forced: bool,
    },
    /// Operator took custody of assets.
    OperationStarted {
        sequence: u64,
        operator: Uuid,
        borrowed: Vec<AssetType>,
        total_usd_value: u128,
    },
    /// Operator handed every borrowed asset back.
    CustodyReturned { sequence: u64 },
    /// Operation finished and the vault is back to normal.
    OperationCompleted {
        sequence: u64,
        loss: u128,
        gain: u128,
        total_usd_value: u128,
    },
    /// Admin forced the operation closed.
    EmergencyOverride {
        sequence: u64,
        written_down: Vec<AssetType>,
        loss: u128,
    },
    /// A receipt account was opened.
    ReceiptOpened {
        receipt_id: ReceiptId,
        owner: Identity,
    },
    /// Entitlement to a receipt account moved.
    EntitlementTransferred {
        receipt_id: ReceiptId,
        from: Identity,
        to: Identity,
    },
    /// A deposit was queued.
    DepositRequested {
        request: RequestId,
        receipt_id: ReceiptId,
        requester: Identity,
        amount: u128,
    },
    /// A withdraw was queued.
    WithdrawRequested {
        request: RequestId,
        receipt_id: ReceiptId,
        requester: Identity,
        shares: u128,
    },
    /// A queued request was withdrawn by its requester.
    RequestCancelled {
        request: RequestId,
        requester: Identity,
    },
    /// A deposit was executed.
    DepositExecuted {
        request: RequestId,
        beneficiary: Identity,
        amount: u128,
        fee: u128,
        shares_minted: u128,
    },
    /// A withdraw was executed.
    WithdrawExecuted {
        request: RequestId,
        recipient: Identity,
        shares_burned: u128,
        amount: u128,
        fee: u128,
    },
    /// Collected fees were paid out.
    FeesRetrieved { operator: Uuid, amount: u128 },
}
