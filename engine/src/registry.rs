//! # Vault Registry
//!
//! Independent vaults live side by side behind their own locks, so
//! operators of different vaults never contend with each other. The one
//! place vaults meet is a *receipt holding*: vault A holding a receipt
//! issued by vault B.
//!
//! Reading B's live state while completing an operation on A would make A's
//! progress depend on B's status (and, with a cycle, on A's own). The
//! registry avoids that two ways:
//!
//! 1. Holdings form a DAG. [`VaultRegistry::link_receipt_holding`] refuses
//!    any link that would close a cycle.
//! 2. Receipts are valued from a [`ShareSnapshot`] that B publishes while it
//!    is `Normal`. [`ReceiptValuator`] reads only the snapshot, never B.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::asset::{PositionKind, PositionRef};
use crate::clock::age;
use crate::config::window;
use crate::error::VaultError;
use crate::math::usd_value;
use crate::oracle::PriceCache;
use crate::receipt::ReceiptId;
use crate::shares::usd_for_shares;
use crate::valuator::{PositionValuation, PositionValuator};
use crate::vault::{Vault, VaultId, VaultStatus};

/// Shared handle to one vault.
pub type VaultHandle = Arc<Mutex<Vault>>;

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// A receipt's balances at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptBalance {
    /// Shares owned.
    pub shares: u128,
    /// Principal buffered by a pending deposit.
    pub pending_deposit: u128,
}

/// Point-in-time valuation data published by an issuing vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareSnapshot {
    /// The issuing vault.
    pub vault_id: VaultId,
    /// Share ratio at `taken_at`.
    pub share_ratio: u128,
    /// Normalized principal price at `taken_at`.
    pub principal_price: u128,
    /// Balances of receipts held by other registered vaults.
    pub receipts: BTreeMap<ReceiptId, ReceiptBalance>,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Registry of vaults, their receipt holdings and published snapshots.
#[derive(Debug, Default)]
pub struct VaultRegistry {
    vaults: DashMap<VaultId, VaultHandle>,
    /// holder → issuers whose receipts it holds.
    holdings: RwLock<HashMap<VaultId, HashSet<VaultId>>>,
    /// issuer → its receipts held by registered vaults.
    linked: RwLock<HashMap<VaultId, HashSet<ReceiptId>>>,
    snapshots: Arc<DashMap<VaultId, ShareSnapshot>>,
}

impl VaultRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a vault and returns its handle.
    pub fn insert(&self, vault: Vault) -> VaultHandle {
        let id = vault.id();
        let handle = Arc::new(Mutex::new(vault));
        self.vaults.insert(id, Arc::clone(&handle));
        info!(vault = %id, "vault registered");
        handle
    }

    /// Handle to a registered vault.
    pub fn get(&self, id: VaultId) -> Result<VaultHandle, VaultError> {
        self.vaults
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(VaultError::VaultNotFound(id))
    }

    /// Number of registered vaults.
    pub fn len(&self) -> usize {
        self.vaults.len()
    }

    /// `true` if no vault is registered.
    pub fn is_empty(&self) -> bool {
        self.vaults.is_empty()
    }

    /// Records that `holder` holds receipt `receipt_id` issued by `issuer`.
    ///
    /// # Errors
    ///
    /// [`VaultError::ReceiptCycle`] if `holder == issuer` or if `issuer`
    /// already (transitively) holds a receipt of `holder`.
    pub fn link_receipt_holding(
        &self,
        holder: VaultId,
        issuer: VaultId,
        receipt_id: ReceiptId,
    ) -> Result<(), VaultError> {
        self.get(holder)?;
        let issuer_handle = self.get(issuer)?;
        if holder == issuer {
            return Err(VaultError::ReceiptCycle { holder, issuer });
        }
        if issuer_handle.lock().receipt(receipt_id).is_none() {
            return Err(VaultError::ReceiptNotFound(receipt_id));
        }

        let mut holdings = self.holdings.write();
        if reaches(&holdings, issuer, holder) {
            warn!(holder = %holder, issuer = %issuer, "receipt holding would close a cycle");
            return Err(VaultError::ReceiptCycle { holder, issuer });
        }
        holdings.entry(holder).or_default().insert(issuer);
        self.linked.write().entry(issuer).or_default().insert(receipt_id);
        info!(holder = %holder, issuer = %issuer, receipt = %receipt_id, "receipt holding linked");
        Ok(())
    }

    /// Takes and stores a share snapshot of `issuer`.
    ///
    /// Locks the issuer only for the duration of the read and requires it to
    /// be `Normal` with a fresh valuation.
    pub fn publish_snapshot(
        &self,
        issuer: VaultId,
        prices: &PriceCache,
        now: DateTime<Utc>,
    ) -> Result<ShareSnapshot, VaultError> {
        let handle = self.get(issuer)?;
        let linked: Vec<ReceiptId> = self
            .linked
            .read()
            .get(&issuer)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();

        let snapshot = {
            let vault = handle.lock();
            if vault.status() != VaultStatus::Normal {
                return Err(VaultError::InvalidStateTransition {
                    current: vault.status().to_string(),
                    expected: VaultStatus::Normal.to_string(),
                });
            }
            let share_ratio = vault.share_ratio(now)?;
            let principal_price = prices.normalized(vault.principal(), now)?;
            let receipts = linked
                .iter()
                .filter_map(|id| {
                    vault.receipt(*id).map(|account| {
                        (
                            *id,
                            ReceiptBalance {
                                shares: account.shares,
                                pending_deposit: account.pending_deposit,
                            },
                        )
                    })
                })
                .collect();
            ShareSnapshot {
                vault_id: issuer,
                share_ratio,
                principal_price,
                receipts,
                taken_at: now,
            }
        };

        debug!(vault = %issuer, ratio = snapshot.share_ratio, "share snapshot published");
        self.snapshots.insert(issuer, snapshot.clone());
        Ok(snapshot)
    }

    /// Latest published snapshot of `issuer`.
    pub fn snapshot(&self, issuer: VaultId) -> Option<ShareSnapshot> {
        self.snapshots.get(&issuer).map(|s| s.value().clone())
    }

    /// A valuator for vault-receipt positions that accepts snapshots up to
    /// `max_age_ms` old.
    pub fn receipt_valuator(&self, max_age_ms: u64) -> ReceiptValuator {
        ReceiptValuator {
            snapshots: Arc::clone(&self.snapshots),
            max_age: window(max_age_ms),
        }
    }
}

/// Depth-first search over holder → issuer edges.
fn reaches(graph: &HashMap<VaultId, HashSet<VaultId>>, from: VaultId, to: VaultId) -> bool {
    let mut stack = vec![from];
    let mut visited = HashSet::new();
    while let Some(node) = stack.pop() {
        if node == to {
            return true;
        }
        if !visited.insert(node) {
            continue;
        }
        if let Some(next) = graph.get(&node) {
            stack.extend(next.iter().copied());
        }
    }
    false
}

// ---------------------------------------------------------------------------
// ReceiptValuator
// ---------------------------------------------------------------------------

/// Values receipts of other vaults from published snapshots.
#[derive(Debug, Clone)]
pub struct ReceiptValuator {
    snapshots: Arc<DashMap<VaultId, ShareSnapshot>>,
    max_age: Duration,
}

impl PositionValuator for ReceiptValuator {
    fn value_usd(
        &self,
        position: &PositionRef,
        _prices: &PriceCache,
        now: DateTime<Utc>,
    ) -> Result<PositionValuation, VaultError> {
        let PositionKind::VaultReceipt { issuer, receipt_id } = &position.kind else {
            return Err(VaultError::UnexpectedAsset(position.asset_type.clone()));
        };
        let snapshot = self
            .snapshots
            .get(issuer)
            .ok_or_else(|| VaultError::StaleValuation {
                asset: position.asset_type.clone(),
                last_updated: None,
            })?;
        if age(now, snapshot.taken_at) > self.max_age {
            return Err(VaultError::StaleValuation {
                asset: position.asset_type.clone(),
                last_updated: Some(snapshot.taken_at),
            });
        }
        let balance = snapshot
            .receipts
            .get(receipt_id)
            .ok_or(VaultError::ReceiptNotFound(*receipt_id))?;

        let shares_usd = usd_for_shares(balance.shares, snapshot.share_ratio)?;
        let pending_usd = usd_value(balance.pending_deposit, snapshot.principal_price)?;
        let principal_usd = shares_usd
            .checked_add(pending_usd)
            .ok_or(VaultError::ArithmeticOverflow("receipt valuation"))?;
        Ok(PositionValuation {
            principal_usd,
            unclaimed_fees_usd: 0,
            unclaimed_rewards_usd: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reachability_follows_edges_transitively() {
        let (a, b, c) = (VaultId::new_v4(), VaultId::new_v4(), VaultId::new_v4());
        let mut graph: HashMap<VaultId, HashSet<VaultId>> = HashMap::new();
        graph.entry(a).or_default().insert(b);
        graph.entry(b).or_default().insert(c);
        assert!(reaches(&graph, a, c));
        assert!(!reaches(&graph, c, a));
    }
}
