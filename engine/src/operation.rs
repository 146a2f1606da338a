//! # Operation State Machine
//!
//! An operation lends vault custody to an operator and refuses to give the
//! vault back to its depositors until every borrowed asset is home and
//! revalued:
//!
//! ```text
//!            start_operation                return_custody
//!  Normal ───────────────────▶ DuringOperation ─────────────▶ DuringOperation
//!    ▲        OperationTicket   (value updates                 (value updates
//!    │                           refused for                    mark borrowed
//!    │                           borrowed assets)               assets updated)
//!    │                                                              │
//!    └──────────────────────── complete_operation ◀─────────────────┘
//!                               ValueUpdateTicket
//! ```
//!
//! Tickets carry the vault id and the operation sequence number and are not
//! `Clone`. They are presented by reference so a rejected step can be
//! retried; the record's phase makes each step succeed at most once.
//!
//! If a borrowed asset can never be revalued, the admin's
//! [`Vault::emergency_override`] closes the operation after a delay, writes
//! the missing value down and leaves the vault `Disabled`. Positions are
//! written down to zero; principal and coin slots keep the value of the
//! balance still in custody.
//!
//! An operation cannot start while the epoch loss budget is already spent
//! (only an override can overspend it). The admin resets the budget, or the
//! next epoch does.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::asset::{Asset, AssetType, Borrow, Holding};
use crate::clock::Clock;
use crate::error::VaultError;
use crate::events::VaultEvent;
use crate::guard::{Access, AdminCap, OperatorCap, StatusRequirement};
use crate::math::{mul_div, usd_value};
use crate::oracle::PriceCache;
use crate::vault::{Vault, VaultId, VaultStatus};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// State of the running operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Operation sequence number within the vault.
    pub sequence: u64,
    /// Operator that started it.
    pub operator: Uuid,
    /// Every slot put under the operation.
    pub borrowed: BTreeSet<AssetType>,
    /// Identity of each borrowed position.
    pub borrowed_positions: BTreeMap<AssetType, Uuid>,
    /// Balance of each borrowed principal or coin slot before the borrow.
    pub held_at_start: BTreeMap<AssetType, u128>,
    /// Slots revalued since custody came back.
    pub updated: BTreeSet<AssetType>,
    /// Total value when the operation started.
    pub total_usd_value_snapshot: u128,
    /// Total shares when the operation started.
    pub total_shares_snapshot: u128,
    /// Set by `return_custody`.
    pub value_update_enabled: bool,
    /// When the operation started.
    pub started_at: DateTime<Utc>,
}

impl OperationRecord {
    /// `true` while `asset` is borrowed and custody has not come back.
    pub fn is_out_on_loan(&self, asset: &AssetType) -> bool {
        !self.value_update_enabled && self.borrowed.contains(asset)
    }

    /// Borrowed slots not yet revalued, in order.
    pub fn pending_revaluation(&self) -> impl Iterator<Item = &AssetType> {
        self.borrowed.difference(&self.updated)
    }

    pub(crate) fn mark_updated(&mut self, asset: &AssetType) {
        if self.value_update_enabled && self.borrowed.contains(asset) {
            self.updated.insert(asset.clone());
        }
    }
}

/// Proof that an operation was started. Presented to
/// [`Vault::return_custody`].
#[must_use = "the operation cannot be finished without its ticket"]
#[derive(Debug)]
pub struct OperationTicket {
    vault_id: VaultId,
    sequence: u64,
}

/// Proof that custody came back. Presented to [`Vault::complete_operation`].
#[must_use = "the operation cannot be finished without its ticket"]
#[derive(Debug)]
pub struct ValueUpdateTicket {
    vault_id: VaultId,
    sequence: u64,
}

macro_rules! ticket_accessors {
    ($ticket:ty) => {
        impl $ticket {
            /// Vault the ticket belongs to.
            pub fn vault_id(&self) -> VaultId {
                self.vault_id
            }

            /// Operation sequence number.
            pub fn sequence(&self) -> u64 {
                self.sequence
            }
        }
    };
}

ticket_accessors!(OperationTicket);
ticket_accessors!(ValueUpdateTicket);

/// Result of a completed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSummary {
    /// Operation sequence number.
    pub sequence: u64,
    /// Total value at start.
    pub total_before: u128,
    /// Total value at completion.
    pub total_after: u128,
    /// `max(0, before − after)`, charged to the epoch budget.
    pub loss: u128,
    /// `max(0, after − before)`.
    pub gain: u128,
}

/// Result of an emergency override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideSummary {
    /// Operation sequence number.
    pub sequence: u64,
    /// Slots that were still pending revaluation and got written down.
    pub written_down: Vec<AssetType>,
    /// Start snapshot minus the cached total after the write-down.
    pub loss: u128,
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

impl Vault {
    /// Hands the assets described by `borrows` to the operator.
    ///
    /// Requires `Normal` and a fresh total value. The total and the share
    /// supply are snapshotted for the completion check, and the loss epoch
    /// rolls over if `clock.epoch` has advanced.
    ///
    /// Fails with [`VaultError::ExceedsLossLimit`] if the current epoch's
    /// budget is already overspent.
    pub fn start_operation(
        &mut self,
        operator: &OperatorCap,
        borrows: Vec<Borrow>,
        clock: &Clock,
    ) -> Result<(Vec<Asset>, OperationTicket), VaultError> {
        self.guard
            .authorize(Access::Operator(operator), self.status, StatusRequirement::Normal)?;

        let mut borrowed = BTreeSet::new();
        let mut borrowed_positions = BTreeMap::new();
        let mut held_at_start = BTreeMap::new();
        let mut principal_out: u128 = 0;
        for borrow in &borrows {
            let asset = match borrow {
                Borrow::Principal { amount } => {
                    if *amount > self.free_principal {
                        return Err(VaultError::InsufficientLiquidity {
                            needed: *amount,
                            available: self.free_principal,
                        });
                    }
                    principal_out = *amount;
                    held_at_start.insert(self.principal.clone(), self.free_principal);
                    self.principal.clone()
                }
                Borrow::Coin { asset, amount } => {
                    match self.holdings.get(asset) {
                        Some(Holding::Coin { amount: held }) if *held >= *amount => {
                            held_at_start.insert(asset.clone(), *held);
                        }
                        Some(Holding::Coin { amount: held }) => {
                            return Err(VaultError::InsufficientLiquidity {
                                needed: *amount,
                                available: *held,
                            })
                        }
                        Some(Holding::Position(_)) => return Err(VaultError::UnexpectedAsset(asset.clone())),
                        None if *asset == self.principal => {
                            return Err(VaultError::UnexpectedAsset(asset.clone()))
                        }
                        None => return Err(VaultError::AssetNotRegistered(asset.clone())),
                    }
                    asset.clone()
                }
                Borrow::Position { asset } => match self.holdings.get(asset) {
                    Some(Holding::Position(position)) => {
                        borrowed_positions.insert(asset.clone(), position.id);
                        asset.clone()
                    }
                    Some(Holding::Coin { .. }) => return Err(VaultError::UnexpectedAsset(asset.clone())),
                    None => return Err(VaultError::AssetNotRegistered(asset.clone())),
                },
            };
            if !borrowed.insert(asset.clone()) {
                return Err(VaultError::UnexpectedAsset(asset));
            }
        }

        let total = self.total_value(clock.now)?;
        if !self.loss.needs_roll(clock.epoch, false) {
            self.loss.check_loss(0)?;
        }

        // Commit.
        self.roll_loss_epoch(clock.epoch, false, total);
        let mut assets = Vec::with_capacity(borrows.len());
        for borrow in borrows {
            match borrow {
                Borrow::Principal { amount } => {
                    self.free_principal -= amount;
                    assets.push(Asset::Principal(amount));
                }
                Borrow::Coin { asset, amount } => {
                    if let Some(Holding::Coin { amount: held }) = self.holdings.get_mut(&asset) {
                        *held -= amount;
                    }
                    assets.push(Asset::Coin { asset, amount });
                }
                Borrow::Position { asset } => {
                    if let Some(Holding::Position(position)) = self.holdings.remove(&asset) {
                        assets.push(Asset::Position(position));
                    }
                }
            }
        }

        self.op_sequence += 1;
        let sequence = self.op_sequence;
        info!(
            vault = %self.id,
            sequence,
            operator = %operator.id(),
            borrowed = borrowed.len(),
            principal_out,
            total_usd_value = total,
            "operation started"
        );
        self.events.push(VaultEvent::OperationStarted {
            sequence,
            operator: operator.id(),
            borrowed: borrowed.iter().cloned().collect(),
            total_usd_value: total,
        });
        self.operation = Some(OperationRecord {
            sequence,
            operator: operator.id(),
            borrowed,
            borrowed_positions,
            held_at_start,
            updated: BTreeSet::new(),
            total_usd_value_snapshot: total,
            total_shares_snapshot: self.total_shares,
            value_update_enabled: false,
            started_at: clock.now,
        });
        self.status = VaultStatus::DuringOperation;

        Ok((
            assets,
            OperationTicket {
                vault_id: self.id,
                sequence,
            },
        ))
    }

    /// Takes back exactly the borrowed set and opens the revaluation phase.
    ///
    /// # Errors
    ///
    /// - [`VaultError::UnexpectedAsset`] for anything not borrowed, returned
    ///   twice, or a position with a different identity.
    /// - [`VaultError::AssetNotReturned`] naming the first borrowed slot
    ///   missing from `returned`.
    pub fn return_custody(
        &mut self,
        operator: &OperatorCap,
        ticket: &OperationTicket,
        returned: Vec<Asset>,
    ) -> Result<ValueUpdateTicket, VaultError> {
        self.guard.authorize(
            Access::Operator(operator),
            self.status,
            StatusRequirement::DuringOperation,
        )?;
        let record = self.running(ticket.vault_id, ticket.sequence)?;
        if record.value_update_enabled {
            return Err(VaultError::InvalidStateTransition {
                current: "custody returned".to_string(),
                expected: "assets on loan".to_string(),
            });
        }

        let mut seen = BTreeSet::new();
        let mut free_principal = self.free_principal;
        let mut coin_balances: BTreeMap<AssetType, u128> = BTreeMap::new();
        for asset in &returned {
            let asset_type = asset.asset_type(&self.principal);
            if !record.borrowed.contains(asset_type) || !seen.insert(asset_type.clone()) {
                return Err(VaultError::UnexpectedAsset(asset_type.clone()));
            }
            let expected_position = record.borrowed_positions.get(asset_type);
            match (asset, expected_position) {
                (Asset::Principal(amount), None) => {
                    free_principal = free_principal
                        .checked_add(*amount)
                        .ok_or(VaultError::ArithmeticOverflow("free principal"))?;
                }
                (Asset::Coin { asset, amount }, None) if *asset != self.principal => {
                    let held = match self.holdings.get(asset) {
                        Some(Holding::Coin { amount }) => *amount,
                        _ => 0,
                    };
                    let balance = held
                        .checked_add(*amount)
                        .ok_or(VaultError::ArithmeticOverflow("coin balance"))?;
                    coin_balances.insert(asset.clone(), balance);
                }
                (Asset::Position(position), Some(id)) if position.id == *id => {}
                _ => return Err(VaultError::UnexpectedAsset(asset_type.clone())),
            }
        }
        if let Some(missing) = record.borrowed.difference(&seen).next() {
            return Err(VaultError::AssetNotReturned(missing.clone()));
        }

        // Commit.
        self.free_principal = free_principal;
        for (asset, amount) in coin_balances {
            self.holdings.insert(asset, Holding::Coin { amount });
        }
        for asset in returned {
            if let Asset::Position(position) = asset {
                self.holdings
                    .insert(position.asset_type.clone(), Holding::Position(position));
            }
        }
        if let Some(record) = self.operation.as_mut() {
            record.value_update_enabled = true;
        }
        info!(vault = %self.id, sequence = ticket.sequence, "custody returned");
        self.events.push(VaultEvent::CustodyReturned {
            sequence: ticket.sequence,
        });
        Ok(ValueUpdateTicket {
            vault_id: ticket.vault_id,
            sequence: ticket.sequence,
        })
    }

    /// Ends the operation once every borrowed slot has been revalued.
    ///
    /// The drop in total value since the start is charged to the epoch loss
    /// budget; if that would exceed the budget nothing changes and the vault
    /// stays `DuringOperation`.
    pub fn complete_operation(
        &mut self,
        operator: &OperatorCap,
        ticket: &ValueUpdateTicket,
        clock: &Clock,
    ) -> Result<OperationSummary, VaultError> {
        self.guard.authorize(
            Access::Operator(operator),
            self.status,
            StatusRequirement::DuringOperation,
        )?;
        let record = self.running(ticket.vault_id, ticket.sequence)?;
        if !record.value_update_enabled {
            return Err(VaultError::InvalidStateTransition {
                current: "assets on loan".to_string(),
                expected: "custody returned".to_string(),
            });
        }
        if let Some(pending) = record.pending_revaluation().next() {
            return Err(VaultError::AssetNotReturned(pending.clone()));
        }

        let total_before = record.total_usd_value_snapshot;
        let total_after = self.total_value(clock.now)?;
        let loss = total_before.saturating_sub(total_after);
        let gain = total_after.saturating_sub(total_before);
        let cumulative = self.loss.check_loss(loss)?;
        if self.total_shares != record.total_shares_snapshot {
            return Err(VaultError::SharesChanged {
                before: record.total_shares_snapshot,
                after: self.total_shares,
            });
        }

        // Commit.
        self.loss.record_loss(loss)?;
        self.operation = None;
        self.status = VaultStatus::Normal;
        info!(
            vault = %self.id,
            sequence = ticket.sequence,
            loss,
            gain,
            cumulative_loss = cumulative,
            total_usd_value = total_after,
            "operation completed"
        );
        self.events.push(VaultEvent::OperationCompleted {
            sequence: ticket.sequence,
            loss,
            gain,
            total_usd_value: total_after,
        });
        Ok(OperationSummary {
            sequence: ticket.sequence,
            total_before,
            total_after,
            loss,
            gain,
        })
    }

    /// Closes a stuck operation.
    ///
    /// Available to the admin once `emergency_override_delay` has passed
    /// since the operation started. Every borrowed slot not revalued since
    /// return (or never returned) is written down: a position to zero, a
    /// principal or coin slot to the value of the balance still in custody.
    /// That balance is priced from `prices`, or pro rata from the slot's
    /// pre-operation value when no usable price exists. The drop from the
    /// start snapshot to the cached total after the write-down is recorded
    /// as loss without enforcing the epoch limit. The vault ends up
    /// `Disabled` and has to be re-enabled explicitly.
    pub fn emergency_override(
        &mut self,
        admin: &AdminCap,
        prices: &PriceCache,
        clock: &Clock,
    ) -> Result<OverrideSummary, VaultError> {
        self.guard
            .authorize(Access::Admin(admin), self.status, StatusRequirement::DuringOperation)?;
        let record = self
            .operation
            .as_ref()
            .ok_or(VaultError::TicketMismatch)?;
        let available_at = record.started_at + self.config.emergency_override_delay();
        if clock.now < available_at {
            return Err(VaultError::OverrideNotYetAvailable(available_at));
        }

        let sequence = record.sequence;
        let snapshot = record.total_usd_value_snapshot;
        let written_down: Vec<AssetType> = record.pending_revaluation().cloned().collect();
        let mut remaining = self.valuations.cached_total()?;
        let mut written_values = Vec::with_capacity(written_down.len());
        for asset in &written_down {
            let previous = self.valuations.value(asset).map_or(0, |v| v.usd_value);
            let value = match record.held_at_start.get(asset) {
                Some(&held_before) => self.residual_value(asset, held_before, previous, prices, clock)?,
                None => 0,
            };
            remaining = remaining
                .saturating_sub(previous)
                .checked_add(value)
                .ok_or(VaultError::ArithmeticOverflow("override total"))?;
            written_values.push(value);
        }
        let loss = snapshot.saturating_sub(remaining);

        // Commit.
        for (asset, value) in written_down.iter().zip(written_values) {
            self.valuations.update(asset, value, clock.now)?;
        }
        self.loss.record_loss_unchecked(loss);
        self.operation = None;
        self.status = VaultStatus::Disabled;
        warn!(
            vault = %self.id,
            sequence,
            written_down = written_down.len(),
            loss,
            "emergency override: operation force-closed, vault disabled"
        );
        self.events.push(VaultEvent::EmergencyOverride {
            sequence,
            written_down: written_down.clone(),
            loss,
        });
        Ok(OverrideSummary {
            sequence,
            written_down,
            loss,
        })
    }

    /// Value of the balance of a fungible slot still in custody.
    fn residual_value(
        &self,
        asset: &AssetType,
        held_before: u128,
        value_before: u128,
        prices: &PriceCache,
        clock: &Clock,
    ) -> Result<u128, VaultError> {
        let held = if *asset == self.principal {
            self.free_principal
        } else {
            match self.holdings.get(asset) {
                Some(Holding::Coin { amount }) => *amount,
                _ => 0,
            }
        };
        if held == 0 {
            return Ok(0);
        }
        match prices.normalized(asset, clock.now) {
            Ok(price) => usd_value(held, price),
            Err(err) => {
                warn!(asset = %asset, error = %err, "no usable price, valuing residual pro rata");
                if held_before == 0 {
                    return Ok(0);
                }
                mul_div(value_before, held.min(held_before), held_before, "override residual")
            }
        }
    }

    fn running(&self, vault_id: VaultId, sequence: u64) -> Result<&OperationRecord, VaultError> {
        match &self.operation {
            Some(record) if vault_id == self.id && record.sequence == sequence => Ok(record),
            _ => Err(VaultError::TicketMismatch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{PositionKind, PositionRef};
    use crate::config::{OracleConfig, VaultConfig, PRICE_SCALE};

    const ONE: u128 = 1_000_000_000;

    fn setup() -> (Vault, PriceCache, AdminCap, OperatorCap, Clock) {
        let admin = AdminCap::generate();
        let operator = OperatorCap::issue(&admin);
        let clock = Clock::from_millis(1_700_000_000_000, 1);
        let mut prices = PriceCache::new(&admin, OracleConfig::default()).unwrap();
        prices.register(AssetType::new("SUI"), 9, "feed/sui").unwrap();
        prices.refresh(&AssetType::new("SUI"), PRICE_SCALE, clock.now).unwrap();
        let mut vault = Vault::new(&admin, AssetType::new("SUI"), &prices, VaultConfig::default()).unwrap();
        vault.free_principal = 1_000 * ONE;
        vault.total_shares = 1_000 * ONE;
        vault.update_principal_value(&prices, &clock).unwrap();
        (vault, prices, admin, operator, clock)
    }

    #[test]
    fn principal_round_trip_restores_normal() {
        let (mut vault, prices, _, operator, clock) = setup();
        let (assets, ticket) = vault
            .start_operation(&operator, vec![Borrow::Principal { amount: 400 * ONE }], &clock)
            .unwrap();
        assert_eq!(vault.status(), VaultStatus::DuringOperation);
        assert_eq!(vault.free_principal(), 600 * ONE);

        // Out on loan: the value cannot be refreshed yet.
        assert!(matches!(
            vault.update_principal_value(&prices, &clock),
            Err(VaultError::AssetNotReturned(_))
        ));

        let ticket = vault.return_custody(&operator, &ticket, assets).unwrap();
        vault.update_principal_value(&prices, &clock).unwrap();
        let summary = vault.complete_operation(&operator, &ticket, &clock).unwrap();

        assert_eq!(summary.loss, 0);
        assert_eq!(vault.status(), VaultStatus::Normal);
        assert_eq!(vault.total_shares(), 1_000 * ONE);
        assert!(vault.operation().is_none());
    }

    #[test]
    fn completion_requires_revaluation() {
        let (mut vault, prices, _, operator, clock) = setup();
        let (assets, ticket) = vault
            .start_operation(&operator, vec![Borrow::Principal { amount: ONE }], &clock)
            .unwrap();
        let ticket = vault.return_custody(&operator, &ticket, assets).unwrap();
        assert_eq!(
            vault.complete_operation(&operator, &ticket, &clock).unwrap_err(),
            VaultError::AssetNotReturned(AssetType::new("SUI"))
        );
        assert_eq!(vault.status(), VaultStatus::DuringOperation);

        // The rejected step can be retried once the asset is revalued.
        vault.update_principal_value(&prices, &clock).unwrap();
        vault.complete_operation(&operator, &ticket, &clock).unwrap();
        assert_eq!(vault.status(), VaultStatus::Normal);
    }

    #[test]
    fn duplicate_borrow_rejected() {
        let (mut vault, _, _, operator, clock) = setup();
        let err = vault
            .start_operation(
                &operator,
                vec![
                    Borrow::Principal { amount: ONE },
                    Borrow::Principal { amount: ONE },
                ],
                &clock,
            )
            .unwrap_err();
        assert!(matches!(err, VaultError::UnexpectedAsset(_)));
        assert_eq!(vault.status(), VaultStatus::Normal);
        assert_eq!(vault.free_principal(), 1_000 * ONE);
    }

    #[test]
    fn swapped_position_identity_rejected() {
        let (mut vault, _, admin, operator, clock) = setup();
        let slot = AssetType::position("navi", 0);
        let position = PositionRef::new(slot.clone(), PositionKind::Lending);
        vault.register_position_asset(&admin, position).unwrap();
        vault.update_asset_value(&operator, &slot, 50 * ONE, &clock).unwrap();

        let (_assets, ticket) = vault
            .start_operation(&operator, vec![Borrow::Position { asset: slot.clone() }], &clock)
            .unwrap();
        let impostor = PositionRef::new(slot.clone(), PositionKind::Lending);
        assert_eq!(
            vault
                .return_custody(&operator, &ticket, vec![Asset::Position(impostor)])
                .unwrap_err(),
            VaultError::UnexpectedAsset(slot)
        );
    }

    #[test]
    fn override_is_time_locked() {
        let (mut vault, prices, admin, operator, clock) = setup();
        let (_assets, _ticket) = vault
            .start_operation(&operator, vec![Borrow::Principal { amount: ONE }], &clock)
            .unwrap();
        assert!(matches!(
            vault.emergency_override(&admin, &prices, &clock.advanced_ms(60_000)),
            Err(VaultError::OverrideNotYetAvailable(_))
        ));
    }
}
