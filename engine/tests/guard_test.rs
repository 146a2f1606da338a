//! Integration tests for capability checks and operator revocation.

mod common;

use common::{Harness, ONE};
use tidepool_engine::{
    AdminCap, AssetType, Borrow, OperatorCap, PositionKind, PositionRef, VaultError,
    VaultRegistry,
};

fn lending() -> AssetType {
    AssetType::position("lending", 0)
}

/// Helper: vault with a seeded deposit, a lending position and a second
/// operator that stays in good standing.
fn setup() -> (Harness, OperatorCap) {
    let mut h = Harness::frictionless();
    h.deposit("seed", 100 * ONE);
    h.vault
        .register_position_asset(&h.admin, PositionRef::new(lending(), PositionKind::Lending))
        .unwrap();
    h.vault
        .update_asset_value(&h.operator, &lending(), 10 * ONE, &h.clock)
        .unwrap();
    let backup = OperatorCap::issue(&h.admin);
    (h, backup)
}

fn revoked(err: VaultError, op: &OperatorCap) -> bool {
    err == VaultError::OperatorRevoked(op.id())
}

// ---------------------------------------------------------------------------
// Revocation
// ---------------------------------------------------------------------------

#[test]
fn revoked_operator_is_refused_everywhere() {
    let (mut h, backup) = setup();
    let bob = h.vault.open_receipt("bob");
    let deposit = h
        .vault
        .enqueue_deposit(&bob, "bob", ONE, 0, &h.clock)
        .unwrap();
    h.vault
        .set_operator_frozen(&h.admin, h.operator.id(), true)
        .unwrap();

    assert!(revoked(
        h.vault
            .start_operation(&h.operator, vec![Borrow::Principal { amount: ONE }], &h.clock)
            .unwrap_err(),
        &h.operator
    ));
    assert!(revoked(
        h.vault
            .execute_deposit(&h.operator, &h.prices, deposit, u128::MAX, &h.clock)
            .unwrap_err(),
        &h.operator
    ));
    assert!(revoked(
        h.vault.retrieve_fees(&h.operator, 1, &h.clock).unwrap_err(),
        &h.operator
    ));
    assert!(revoked(
        h.vault
            .update_asset_value(&h.operator, &lending(), ONE, &h.clock)
            .unwrap_err(),
        &h.operator
    ));
    let valuator = VaultRegistry::new().receipt_valuator(60_000);
    assert!(revoked(
        h.vault
            .update_position_value(&h.operator, &lending(), &valuator, &h.prices, &h.clock)
            .unwrap_err(),
        &h.operator
    ));

    // Mid-operation: the backup operator runs it, the revoked one cannot
    // touch it even with valid tickets.
    let (assets, ticket) = h
        .vault
        .start_operation(&backup, vec![Borrow::Principal { amount: ONE }], &h.clock)
        .unwrap();
    assert!(revoked(
        h.vault
            .return_custody(&h.operator, &ticket, assets.clone())
            .unwrap_err(),
        &h.operator
    ));
    let ticket = h.vault.return_custody(&backup, &ticket, assets).unwrap();
    h.revalue_coins();
    assert!(revoked(
        h.vault.complete_operation(&h.operator, &ticket, &h.clock).unwrap_err(),
        &h.operator
    ));
    h.vault.complete_operation(&backup, &ticket, &h.clock).unwrap();
}

#[test]
fn revoked_operator_cannot_execute_withdrawals() {
    let (mut h, _backup) = setup();
    let (receipt, shares) = h.deposit("alice", 10 * ONE);
    let request = h
        .vault
        .enqueue_withdraw(&receipt, "alice", shares, 0, &h.clock)
        .unwrap();
    h.vault
        .set_operator_frozen(&h.admin, h.operator.id(), true)
        .unwrap();

    assert!(revoked(
        h.vault
            .execute_withdraw(&h.operator, &h.prices, request, u128::MAX, &h.clock)
            .unwrap_err(),
        &h.operator
    ));
}

#[test]
fn restoring_an_operator_restores_access() {
    let (mut h, _backup) = setup();
    h.vault
        .set_operator_frozen(&h.admin, h.operator.id(), true)
        .unwrap();
    assert!(h.vault.guard().is_revoked(h.operator.id()));
    h.vault
        .set_operator_frozen(&h.admin, h.operator.id(), false)
        .unwrap();

    h.vault
        .update_asset_value(&h.operator, &lending(), 12 * ONE, &h.clock)
        .unwrap();
    h.revalue_coins();
    assert_eq!(h.vault.total_value(h.clock.now).unwrap(), 112 * ONE);
}

// ---------------------------------------------------------------------------
// Foreign capabilities
// ---------------------------------------------------------------------------

#[test]
fn capabilities_of_another_vault_are_unauthorized() {
    let (mut h, _backup) = setup();
    let other_admin = AdminCap::generate();
    let other_operator = OperatorCap::issue(&other_admin);

    assert!(matches!(
        h.vault
            .start_operation(&other_operator, vec![Borrow::Principal { amount: ONE }], &h.clock),
        Err(VaultError::Unauthorized(_))
    ));
    assert!(matches!(
        h.vault.set_deposit_fee_bps(&other_admin, 0),
        Err(VaultError::Unauthorized(_))
    ));
    assert!(matches!(
        h.vault
            .set_operator_frozen(&other_admin, h.operator.id(), true),
        Err(VaultError::Unauthorized(_))
    ));
    assert!(!h.vault.guard().is_revoked(h.operator.id()));
}

#[test]
fn config_changes_are_validated_before_commit() {
    let (mut h, _backup) = setup();
    assert!(matches!(
        h.vault.set_loss_tolerance_bps(&h.admin, 10_000),
        Err(VaultError::Config(_))
    ));
    assert!(matches!(
        h.vault.set_deposit_fee_bps(&h.admin, 10_000),
        Err(VaultError::Config(_))
    ));
    assert_eq!(h.vault.config().deposit_fee_bps, 0);

    h.vault.set_loss_tolerance_bps(&h.admin, 50).unwrap();
    assert_eq!(h.vault.config().loss_tolerance_bps, 50);
    assert_eq!(h.vault.loss_tracker().tolerance_bps(), 50);
}

#[test]
fn admin_cannot_change_config_mid_operation() {
    let (mut h, _backup) = setup();
    let (_assets, _ticket) = h
        .vault
        .start_operation(&h.operator, vec![Borrow::Principal { amount: ONE }], &h.clock)
        .unwrap();
    assert!(matches!(
        h.vault.set_withdraw_fee_bps(&h.admin, 20),
        Err(VaultError::InvalidStateTransition { .. })
    ));
    assert!(matches!(
        h.vault.set_enabled(&h.admin, false),
        Err(VaultError::InvalidStateTransition { .. })
    ));
}
