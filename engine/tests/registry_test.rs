//! Integration tests for the vault registry and cross-vault receipts.

mod common;

use std::sync::Arc;
use std::thread;

use common::{Harness, ONE};
use tidepool_engine::config::RATIO_SCALE;
use tidepool_engine::{
    AssetType, Borrow, PositionKind, PositionRef, PositionValuator, ReceiptBalance, ReceiptId,
    VaultError, VaultId, VaultRegistry,
};

fn receipt_slot() -> AssetType {
    AssetType::position("tidepool-receipt", 0)
}

// ---------------------------------------------------------------------------
// Holding graph
// ---------------------------------------------------------------------------

#[test]
fn receipt_holdings_must_stay_acyclic() {
    let registry = VaultRegistry::new();
    let mut a = Harness::frictionless();
    let mut b = Harness::frictionless();
    let (a_id, b_id) = (a.vault.id(), b.vault.id());
    let held_by_a = b.vault.open_receipt(format!("vault:{a_id}"));
    let held_by_b = a.vault.open_receipt(format!("vault:{b_id}"));
    registry.insert(a.vault);
    registry.insert(b.vault);
    assert_eq!(registry.len(), 2);

    registry
        .link_receipt_holding(a_id, b_id, held_by_a.id())
        .unwrap();
    assert_eq!(
        registry
            .link_receipt_holding(b_id, a_id, held_by_b.id())
            .unwrap_err(),
        VaultError::ReceiptCycle {
            holder: b_id,
            issuer: a_id
        }
    );
    assert!(matches!(
        registry.link_receipt_holding(a_id, a_id, held_by_b.id()),
        Err(VaultError::ReceiptCycle { .. })
    ));
    assert_eq!(
        registry
            .link_receipt_holding(a_id, b_id, held_by_b.id())
            .unwrap_err(),
        VaultError::ReceiptNotFound(held_by_b.id())
    );
    let ghost = VaultId::new_v4();
    assert_eq!(
        registry.link_receipt_holding(ghost, b_id, held_by_a.id()).unwrap_err(),
        VaultError::VaultNotFound(ghost)
    );
}

#[test]
fn longer_cycles_are_caught_too() {
    let registry = VaultRegistry::new();
    let mut vaults: Vec<Harness> = (0..3).map(|_| Harness::frictionless()).collect();
    let ids: Vec<VaultId> = vaults.iter().map(|h| h.vault.id()).collect();
    // 0 holds 1, 1 holds 2, 2 would hold 0.
    let r1 = vaults[1].vault.open_receipt("vault:0");
    let r2 = vaults[2].vault.open_receipt("vault:1");
    let r0 = vaults[0].vault.open_receipt("vault:2");
    for h in vaults.drain(..) {
        registry.insert(h.vault);
    }

    registry.link_receipt_holding(ids[0], ids[1], r1.id()).unwrap();
    registry.link_receipt_holding(ids[1], ids[2], r2.id()).unwrap();
    assert!(matches!(
        registry.link_receipt_holding(ids[2], ids[0], r0.id()),
        Err(VaultError::ReceiptCycle { .. })
    ));
}

// ---------------------------------------------------------------------------
// Snapshot valuation
// ---------------------------------------------------------------------------

#[test]
fn receipts_are_valued_from_snapshots_while_the_issuer_is_busy() {
    let registry = VaultRegistry::new();
    let mut issuer = Harness::frictionless();
    let mut holder = Harness::frictionless();
    let (issuer_id, holder_id) = (issuer.vault.id(), holder.vault.id());
    let identity = format!("vault:{holder_id}");

    issuer.deposit("seed", 900 * ONE);
    let (receipt, shares) = issuer.deposit(&identity, 100 * ONE);
    issuer
        .vault
        .enqueue_deposit(&receipt, &identity, 10 * ONE, 0, &issuer.clock)
        .unwrap();

    let position = PositionRef::new(
        receipt_slot(),
        PositionKind::VaultReceipt {
            issuer: issuer_id,
            receipt_id: receipt.id(),
        },
    );
    holder
        .vault
        .register_position_asset(&holder.admin, position)
        .unwrap();

    let issuer_vault = registry.insert(issuer.vault);
    let holder_vault = registry.insert(holder.vault);
    registry
        .link_receipt_holding(holder_id, issuer_id, receipt.id())
        .unwrap();

    let snapshot = registry
        .publish_snapshot(issuer_id, &issuer.prices, issuer.clock.now)
        .unwrap();
    assert_eq!(snapshot.share_ratio, RATIO_SCALE);
    assert_eq!(
        snapshot.receipts.get(&receipt.id()),
        Some(&ReceiptBalance {
            shares,
            pending_deposit: 10 * ONE
        })
    );

    // The issuer lends out half its principal.
    let (_assets, _ticket) = issuer_vault
        .lock()
        .start_operation(
            &issuer.operator,
            vec![Borrow::Principal { amount: 500 * ONE }],
            &issuer.clock,
        )
        .unwrap();
    assert!(matches!(
        registry.publish_snapshot(issuer_id, &issuer.prices, issuer.clock.now),
        Err(VaultError::InvalidStateTransition { .. })
    ));

    let valuator = registry.receipt_valuator(60_000);
    let value = holder_vault
        .lock()
        .update_position_value(
            &holder.operator,
            &receipt_slot(),
            &valuator,
            &holder.prices,
            &holder.clock,
        )
        .unwrap();
    assert_eq!(value, 110 * ONE);

    let later = holder.clock.advanced_ms(60_001);
    assert!(matches!(
        holder_vault.lock().update_position_value(
            &holder.operator,
            &receipt_slot(),
            &valuator,
            &holder.prices,
            &later,
        ),
        Err(VaultError::StaleValuation { last_updated: Some(_), .. })
    ));
}

#[test]
fn receipt_valuator_only_understands_receipts() {
    let registry = VaultRegistry::new();
    let h = Harness::frictionless();
    let valuator = registry.receipt_valuator(60_000);

    let lending = PositionRef::new(AssetType::position("lending", 0), PositionKind::Lending);
    assert!(matches!(
        valuator.value_usd(&lending, &h.prices, h.clock.now),
        Err(VaultError::UnexpectedAsset(_))
    ));

    let unpublished = PositionRef::new(
        receipt_slot(),
        PositionKind::VaultReceipt {
            issuer: VaultId::new_v4(),
            receipt_id: ReceiptId::new_v4(),
        },
    );
    assert!(matches!(
        valuator.value_usd(&unpublished, &h.prices, h.clock.now),
        Err(VaultError::StaleValuation { last_updated: None, .. })
    ));
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn vaults_are_driven_from_independent_threads() {
    let registry = Arc::new(VaultRegistry::new());

    let workers: Vec<_> = (0..4u128)
        .map(|i| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let mut h = Harness::frictionless();
                h.deposit("seed", (i + 1) * 100 * ONE);
                let id = h.vault.id();
                registry.insert(h.vault);
                let snapshot = registry
                    .publish_snapshot(id, &h.prices, h.clock.now)
                    .unwrap();
                (id, snapshot.share_ratio)
            })
        })
        .collect();

    for worker in workers {
        let (id, ratio) = worker.join().unwrap();
        assert_eq!(ratio, RATIO_SCALE);
        assert!(registry.snapshot(id).is_some());
        assert_eq!(registry.get(id).unwrap().lock().total_shares() % (100 * ONE), 0);
    }
    assert_eq!(registry.len(), 4);
}
