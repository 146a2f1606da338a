//! # Vault
//!
//! The vault owns everything: custody balances, the valuation table, share
//! supply, receipt accounts, the request ledger and the loss tracker. Its
//! entry points are split across modules by concern:
//!
//! - this module: construction, valuation updates, receipts, fees and the
//!   admin surface;
//! - [`crate::operation`]: `start_operation`, `return_custody`,
//!   `complete_operation`, `emergency_override`;
//! - [`crate::requests`]: enqueue, cancel and execute of deposits and
//!   withdrawals.
//!
//! Every entry point validates fully before it mutates anything, so an
//! `Err` return leaves the vault exactly as it was.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::asset::{AssetType, Holding, PositionKind, PositionRef};
use crate::clock::Clock;
use crate::config::VaultConfig;
use crate::error::VaultError;
use crate::events::VaultEvent;
use crate::guard::{Access, AdminCap, Guard, OperatorCap, StatusRequirement};
use crate::loss::LossTracker;
use crate::math::usd_value;
use crate::operation::OperationRecord;
use crate::oracle::PriceCache;
use crate::receipt::{Identity, Receipt, ReceiptAccount, ReceiptId};
use crate::requests::{Payout, RequestLedger};
use crate::shares;
use crate::valuation::ValuationTable;
use crate::valuator::PositionValuator;

/// Vault identifier.
pub type VaultId = Uuid;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VaultStatus {
    /// Serving requests and fee withdrawals.
    Normal,
    /// An operator holds borrowed assets. User requests and fee retrieval
    /// are blocked until the operation completes.
    DuringOperation,
    /// Frozen by the admin. Only reachable from `Normal` (or through the
    /// emergency override).
    Disabled,
}

impl fmt::Display for VaultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VaultStatus::Normal => write!(f, "Normal"),
            VaultStatus::DuringOperation => write!(f, "DuringOperation"),
            VaultStatus::Disabled => write!(f, "Disabled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

/// A pooled multi-asset vault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vault {
    pub(crate) id: VaultId,
    pub(crate) principal: AssetType,
    pub(crate) status: VaultStatus,
    pub(crate) config: VaultConfig,
    pub(crate) guard: Guard,
    pub(crate) total_shares: u128,
    pub(crate) free_principal: u128,
    pub(crate) holdings: BTreeMap<AssetType, Holding>,
    pub(crate) valuations: ValuationTable,
    pub(crate) fees_collected: u128,
    pub(crate) loss: LossTracker,
    pub(crate) ledger: RequestLedger,
    pub(crate) receipts: HashMap<ReceiptId, ReceiptAccount>,
    pub(crate) operation: Option<OperationRecord>,
    pub(crate) op_sequence: u64,
    #[serde(skip)]
    pub(crate) events: Vec<VaultEvent>,
}

impl Vault {
    /// Creates a vault over `principal`, administered by `admin`.
    ///
    /// The principal must already have a price feed in `prices`. Its value
    /// slot starts stale like every other slot.
    pub fn new(
        admin: &AdminCap,
        principal: AssetType,
        prices: &PriceCache,
        config: VaultConfig,
    ) -> Result<Self, VaultError> {
        config.validate()?;
        if !prices.contains(&principal) {
            return Err(VaultError::AssetNotRegistered(principal));
        }
        let loss = LossTracker::new(config.loss_tolerance_bps)?;
        let mut valuations = ValuationTable::new();
        valuations.register(principal.clone())?;

        let id = Uuid::new_v4();
        info!(vault = %id, principal = %principal, "vault created");
        Ok(Self {
            id,
            principal: principal.clone(),
            status: VaultStatus::Normal,
            config,
            guard: Guard::new(admin),
            total_shares: 0,
            free_principal: 0,
            holdings: BTreeMap::new(),
            valuations,
            fees_collected: 0,
            loss,
            ledger: RequestLedger::default(),
            receipts: HashMap::new(),
            operation: None,
            op_sequence: 0,
            events: vec![VaultEvent::VaultCreated {
                vault_id: id,
                principal,
            }],
        })
    }

    // -- Accessors -----------------------------------------------------------

    /// Vault id.
    pub fn id(&self) -> VaultId {
        self.id
    }

    /// Principal asset type.
    pub fn principal(&self) -> &AssetType {
        &self.principal
    }

    /// Current status.
    pub fn status(&self) -> VaultStatus {
        self.status
    }

    /// Current configuration.
    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// Authorization state.
    pub fn guard(&self) -> &Guard {
        &self.guard
    }

    /// Outstanding shares.
    pub fn total_shares(&self) -> u128 {
        self.total_shares
    }

    /// Principal in custody, excluding buffered deposits and fees.
    pub fn free_principal(&self) -> u128 {
        self.free_principal
    }

    /// Fee-collector balance in principal units.
    pub fn fees_collected(&self) -> u128 {
        self.fees_collected
    }

    /// Epoch loss state.
    pub fn loss_tracker(&self) -> &LossTracker {
        &self.loss
    }

    /// Pending requests.
    pub fn ledger(&self) -> &RequestLedger {
        &self.ledger
    }

    /// Per-asset valuations.
    pub fn valuations(&self) -> &ValuationTable {
        &self.valuations
    }

    /// Holding in a non-principal slot. `None` for unknown slots and for
    /// positions that are out on loan.
    pub fn holding(&self, asset: &AssetType) -> Option<&Holding> {
        self.holdings.get(asset)
    }

    /// Receipt account by id.
    pub fn receipt(&self, id: ReceiptId) -> Option<&ReceiptAccount> {
        self.receipts.get(&id)
    }

    /// The running operation, if any.
    pub fn operation(&self) -> Option<&OperationRecord> {
        self.operation.as_ref()
    }

    /// Takes every event recorded since the last drain.
    pub fn drain_events(&mut self) -> Vec<VaultEvent> {
        std::mem::take(&mut self.events)
    }

    // -- Valuation -----------------------------------------------------------

    /// Total USD value. Fails on the first stale slot.
    pub fn total_value(&self, now: DateTime<Utc>) -> Result<u128, VaultError> {
        self.valuations
            .total_value(now, self.config.valuation_freshness())
    }

    /// Current share ratio. See [`shares::share_ratio`].
    pub fn share_ratio(&self, now: DateTime<Utc>) -> Result<u128, VaultError> {
        if self.total_shares == 0 {
            return shares::share_ratio(0, 0);
        }
        shares::share_ratio(self.total_value(now)?, self.total_shares)
    }

    /// Recomputes the principal slot from `free_principal` and the
    /// normalized principal price. Anyone may call this.
    pub fn update_principal_value(&mut self, prices: &PriceCache, clock: &Clock) -> Result<u128, VaultError> {
        self.ensure_not_on_loan(&self.principal)?;
        let price = prices.normalized(&self.principal, clock.now)?;
        let value = usd_value(self.free_principal, price)?;
        let principal = self.principal.clone();
        self.write_value(&principal, value, clock.now)?;
        Ok(value)
    }

    /// Recomputes a coin slot from its balance and normalized price. Anyone
    /// may call this.
    pub fn update_coin_value(
        &mut self,
        prices: &PriceCache,
        asset: &AssetType,
        clock: &Clock,
    ) -> Result<u128, VaultError> {
        if *asset == self.principal {
            return self.update_principal_value(prices, clock);
        }
        self.ensure_not_on_loan(asset)?;
        let amount = match self.holdings.get(asset) {
            Some(Holding::Coin { amount }) => *amount,
            Some(Holding::Position(_)) => return Err(VaultError::UnexpectedAsset(asset.clone())),
            None => return Err(VaultError::AssetNotRegistered(asset.clone())),
        };
        let value = usd_value(amount, prices.normalized(asset, clock.now)?)?;
        self.write_value(asset, value, clock.now)?;
        Ok(value)
    }

    /// Values a position slot with `valuator` and stores the sum of its
    /// components.
    pub fn update_position_value(
        &mut self,
        operator: &OperatorCap,
        asset: &AssetType,
        valuator: &dyn PositionValuator,
        prices: &PriceCache,
        clock: &Clock,
    ) -> Result<u128, VaultError> {
        self.guard
            .authorize(Access::Operator(operator), self.status, StatusRequirement::Any)?;
        self.ensure_not_on_loan(asset)?;
        let position = match self.holdings.get(asset) {
            Some(Holding::Position(position)) => position,
            Some(Holding::Coin { .. }) => return Err(VaultError::UnexpectedAsset(asset.clone())),
            None => return Err(VaultError::AssetNotRegistered(asset.clone())),
        };
        let value = valuator.value_usd(position, prices, clock.now)?.total()?;
        self.write_value(asset, value, clock.now)?;
        Ok(value)
    }

    /// Pushes a raw USD value for a position slot. Coin and principal slots
    /// are always priced by the vault itself.
    pub fn update_asset_value(
        &mut self,
        operator: &OperatorCap,
        asset: &AssetType,
        usd_value: u128,
        clock: &Clock,
    ) -> Result<(), VaultError> {
        self.guard
            .authorize(Access::Operator(operator), self.status, StatusRequirement::Any)?;
        self.ensure_not_on_loan(asset)?;
        match self.holdings.get(asset) {
            Some(Holding::Position(_)) => {}
            Some(Holding::Coin { .. }) => return Err(VaultError::UnexpectedAsset(asset.clone())),
            None if *asset == self.principal => {
                return Err(VaultError::UnexpectedAsset(asset.clone()))
            }
            None => return Err(VaultError::AssetNotRegistered(asset.clone())),
        }
        self.write_value(asset, usd_value, clock.now)
    }

    fn ensure_not_on_loan(&self, asset: &AssetType) -> Result<(), VaultError> {
        match &self.operation {
            Some(record) if record.is_out_on_loan(asset) => {
                Err(VaultError::AssetNotReturned(asset.clone()))
            }
            _ => Ok(()),
        }
    }

    /// Writes a slot value and, mid-operation, marks a returned asset as
    /// revalued.
    fn write_value(&mut self, asset: &AssetType, usd_value: u128, now: DateTime<Utc>) -> Result<(), VaultError> {
        self.valuations.update(asset, usd_value, now)?;
        if let Some(record) = self.operation.as_mut() {
            record.mark_updated(asset);
        }
        debug!(vault = %self.id, asset = %asset, usd_value, "asset value updated");
        self.events.push(VaultEvent::ValueUpdated {
            asset: asset.clone(),
            usd_value,
            at: now,
        });
        Ok(())
    }

    // -- Receipts ------------------------------------------------------------

    /// Opens an empty receipt account entitled to `owner`.
    pub fn open_receipt(&mut self, owner: impl Into<Identity>) -> Receipt {
        let owner = owner.into();
        let receipt = Receipt::new(self.id);
        self.receipts
            .insert(receipt.id(), ReceiptAccount::open(receipt.id(), owner.clone()));
        debug!(vault = %self.id, receipt = %receipt.id(), owner = %owner, "receipt opened");
        self.events.push(VaultEvent::ReceiptOpened {
            receipt_id: receipt.id(),
            owner,
        });
        receipt
    }

    /// Moves entitlement to a receipt account's shares from `caller` to
    /// `new_owner`. Only the entitled identity may do this, and only while
    /// nothing is pending on the account.
    pub fn transfer_entitlement(
        &mut self,
        receipt: &Receipt,
        caller: &str,
        new_owner: impl Into<Identity>,
    ) -> Result<(), VaultError> {
        let new_owner = new_owner.into();
        let account = self.account_mut(receipt)?;
        account.ensure_entitled(caller)?;
        account.ensure_idle()?;
        let from = std::mem::replace(&mut account.entitled, new_owner.clone());
        info!(receipt = %receipt.id(), from = %from, to = %new_owner, "entitlement transferred");
        self.events.push(VaultEvent::EntitlementTransferred {
            receipt_id: receipt.id(),
            from,
            to: new_owner,
        });
        Ok(())
    }

    pub(crate) fn account(&self, receipt: &Receipt) -> Result<&ReceiptAccount, VaultError> {
        if receipt.vault_id() != self.id {
            return Err(VaultError::ReceiptNotFound(receipt.id()));
        }
        self.receipts
            .get(&receipt.id())
            .ok_or(VaultError::ReceiptNotFound(receipt.id()))
    }

    pub(crate) fn account_mut(&mut self, receipt: &Receipt) -> Result<&mut ReceiptAccount, VaultError> {
        if receipt.vault_id() != self.id {
            return Err(VaultError::ReceiptNotFound(receipt.id()));
        }
        self.receipts
            .get_mut(&receipt.id())
            .ok_or(VaultError::ReceiptNotFound(receipt.id()))
    }

    // -- Fees ----------------------------------------------------------------

    /// Pays `amount` of collected fees out to the operator.
    pub fn retrieve_fees(
        &mut self,
        operator: &OperatorCap,
        amount: u128,
        clock: &Clock,
    ) -> Result<Payout, VaultError> {
        self.guard
            .authorize(Access::Operator(operator), self.status, StatusRequirement::Normal)?;
        if amount == 0 {
            return Err(VaultError::ZeroAmount("fee retrieval"));
        }
        if amount > self.fees_collected {
            return Err(VaultError::InsufficientLiquidity {
                needed: amount,
                available: self.fees_collected,
            });
        }
        self.fees_collected -= amount;
        info!(vault = %self.id, operator = %operator.id(), amount, at = %clock.now, "fees retrieved");
        self.events.push(VaultEvent::FeesRetrieved {
            operator: operator.id(),
            amount,
        });
        Ok(Payout {
            recipient: format!("operator:{}", operator.id()),
            amount,
        })
    }

    // -- Admin ---------------------------------------------------------------

    /// Sets the deposit fee.
    pub fn set_deposit_fee_bps(&mut self, admin: &AdminCap, bps: u64) -> Result<(), VaultError> {
        self.update_config(admin, "deposit_fee_bps", u128::from(bps), |c| c.deposit_fee_bps = bps)
    }

    /// Sets the withdraw fee.
    pub fn set_withdraw_fee_bps(&mut self, admin: &AdminCap, bps: u64) -> Result<(), VaultError> {
        self.update_config(admin, "withdraw_fee_bps", u128::from(bps), |c| c.withdraw_fee_bps = bps)
    }

    /// Sets the epoch loss tolerance. 100% or more is rejected.
    pub fn set_loss_tolerance_bps(&mut self, admin: &AdminCap, bps: u64) -> Result<(), VaultError> {
        self.update_config(admin, "loss_tolerance_bps", u128::from(bps), |c| c.loss_tolerance_bps = bps)?;
        self.loss.set_tolerance(bps)
    }

    /// Sets how old a slot value may be and still count towards the total.
    pub fn set_valuation_freshness_ms(&mut self, admin: &AdminCap, ms: u64) -> Result<(), VaultError> {
        self.update_config(admin, "valuation_freshness_ms", u128::from(ms), |c| {
            c.valuation_freshness_ms = ms
        })
    }

    /// Sets the withdraw locking window.
    pub fn set_withdraw_lock_ms(&mut self, admin: &AdminCap, ms: u64) -> Result<(), VaultError> {
        self.update_config(admin, "withdraw_lock_ms", u128::from(ms), |c| c.withdraw_lock_ms = ms)
    }

    /// Sets the cancel locking window.
    pub fn set_cancel_lock_ms(&mut self, admin: &AdminCap, ms: u64) -> Result<(), VaultError> {
        self.update_config(admin, "cancel_lock_ms", u128::from(ms), |c| c.cancel_lock_ms = ms)
    }

    /// Sets the delay before the emergency override becomes available.
    pub fn set_emergency_override_delay_ms(&mut self, admin: &AdminCap, ms: u64) -> Result<(), VaultError> {
        self.update_config(admin, "emergency_override_delay_ms", u128::from(ms), |c| {
            c.emergency_override_delay_ms = ms
        })
    }

    fn update_config(
        &mut self,
        admin: &AdminCap,
        field: &'static str,
        value: u128,
        apply: impl FnOnce(&mut VaultConfig),
    ) -> Result<(), VaultError> {
        self.guard
            .authorize(Access::Admin(admin), self.status, StatusRequirement::NotDuringOperation)?;
        let mut next = self.config.clone();
        apply(&mut next);
        next.validate()?;
        self.config = next;
        info!(vault = %self.id, field, value, "config updated");
        self.events.push(VaultEvent::ConfigUpdated {
            field: field.to_string(),
            value,
        });
        Ok(())
    }

    /// Disables (`false`) or re-enables (`true`) the vault.
    ///
    /// Disabling requires `Normal`; enabling requires `Disabled`.
    pub fn set_enabled(&mut self, admin: &AdminCap, enabled: bool) -> Result<(), VaultError> {
        self.guard
            .authorize(Access::Admin(admin), self.status, StatusRequirement::NotDuringOperation)?;
        let (required, next) = if enabled {
            (VaultStatus::Disabled, VaultStatus::Normal)
        } else {
            (VaultStatus::Normal, VaultStatus::Disabled)
        };
        if self.status != required {
            return Err(VaultError::InvalidStateTransition {
                current: self.status.to_string(),
                expected: required.to_string(),
            });
        }
        info!(vault = %self.id, from = %self.status, to = %next, "vault status changed");
        self.events.push(VaultEvent::StatusChanged {
            from: self.status,
            to: next,
        });
        self.status = next;
        Ok(())
    }

    /// Revokes or restores an operator capability. Allowed in any status.
    pub fn set_operator_frozen(&mut self, admin: &AdminCap, operator: Uuid, frozen: bool) -> Result<(), VaultError> {
        self.guard
            .authorize(Access::Admin(admin), self.status, StatusRequirement::Any)?;
        self.guard.set_operator_frozen(operator, frozen);
        info!(vault = %self.id, operator = %operator, frozen, "operator freeze updated");
        self.events.push(VaultEvent::OperatorFrozen { operator, frozen });
        Ok(())
    }

    /// Starts a new loss budget at the current total value.
    pub fn reset_loss_tolerance(&mut self, admin: &AdminCap, clock: &Clock) -> Result<(), VaultError> {
        self.guard
            .authorize(Access::Admin(admin), self.status, StatusRequirement::NotDuringOperation)?;
        let total = self.total_value(clock.now)?;
        self.roll_loss_epoch(clock.epoch, true, total);
        Ok(())
    }

    pub(crate) fn roll_loss_epoch(&mut self, epoch: u64, forced: bool, total: u128) {
        if self.loss.roll_epoch_if_needed(epoch, forced, total) {
            self.events.push(VaultEvent::LossEpochReset {
                epoch: self.loss.epoch_id(),
                base_usd_value: total,
                forced,
            });
        }
    }

    /// Adds a coin slot. The coin needs a price feed in `prices`.
    pub fn register_coin_asset(
        &mut self,
        admin: &AdminCap,
        asset: AssetType,
        prices: &PriceCache,
    ) -> Result<(), VaultError> {
        self.guard
            .authorize(Access::Admin(admin), self.status, StatusRequirement::NotDuringOperation)?;
        if asset == self.principal || self.valuations.contains(&asset) {
            return Err(VaultError::AssetAlreadyRegistered(asset));
        }
        if !prices.contains(&asset) {
            return Err(VaultError::AssetNotRegistered(asset));
        }
        self.valuations.register(asset.clone())?;
        self.holdings.insert(asset.clone(), Holding::Coin { amount: 0 });
        self.registered(asset);
        Ok(())
    }

    /// Adds a position slot.
    ///
    /// A vault may not hold its own receipt; cycles through other vaults
    /// are checked by [`crate::registry::VaultRegistry`].
    pub fn register_position_asset(&mut self, admin: &AdminCap, position: PositionRef) -> Result<(), VaultError> {
        self.guard
            .authorize(Access::Admin(admin), self.status, StatusRequirement::NotDuringOperation)?;
        if let PositionKind::VaultReceipt { issuer, .. } = position.kind {
            if issuer == self.id {
                return Err(VaultError::ReceiptCycle {
                    holder: self.id,
                    issuer,
                });
            }
        }
        let asset = position.asset_type.clone();
        if asset == self.principal {
            return Err(VaultError::AssetAlreadyRegistered(asset));
        }
        self.valuations.register(asset.clone())?;
        self.holdings.insert(asset.clone(), Holding::Position(position));
        self.registered(asset);
        Ok(())
    }

    fn registered(&mut self, asset: AssetType) {
        info!(vault = %self.id, asset = %asset, "asset registered");
        self.events.push(VaultEvent::AssetRegistered { asset });
    }

    /// Removes a slot. Coins must hold nothing; positions must be valued at
    /// zero. The principal cannot be removed.
    pub fn remove_asset(&mut self, admin: &AdminCap, asset: &AssetType) -> Result<(), VaultError> {
        self.guard
            .authorize(Access::Admin(admin), self.status, StatusRequirement::NotDuringOperation)?;
        if *asset == self.principal {
            return Err(VaultError::Unauthorized("the principal asset cannot be removed"));
        }
        let value = self
            .valuations
            .value(asset)
            .ok_or_else(|| VaultError::AssetNotRegistered(asset.clone()))?;
        let holding_empty = match self.holdings.get(asset) {
            Some(Holding::Coin { amount }) => *amount == 0,
            Some(Holding::Position(_)) | None => true,
        };
        if !holding_empty || value.usd_value != 0 {
            return Err(VaultError::AssetNotEmpty(asset.clone()));
        }
        self.valuations.remove(asset)?;
        self.holdings.remove(asset);
        info!(vault = %self.id, asset = %asset, "asset removed");
        self.events.push(VaultEvent::AssetRemoved {
            asset: asset.clone(),
        });
        Ok(())
    }
}
