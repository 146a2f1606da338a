//! # Valuation Table
//!
//! Per-asset USD values (canonical precision) and when each was last
//! written. [`ValuationTable::total_value`] is the only way anything outside
//! this module learns what the vault is worth: it either sums every entry or
//! fails on the first stale one. It never skips an entry and never treats a
//! stale entry as zero.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::asset::AssetType;
use crate::clock::age;
use crate::error::VaultError;

/// Cached USD value of one asset slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetValue {
    /// Canonical-precision USD value.
    pub usd_value: u128,
    /// When the value was written. `None` until the first update.
    pub last_updated: Option<DateTime<Utc>>,
}

/// Registry of asset slots and their cached values.
///
/// Backed by a `BTreeMap` so iteration order, and therefore which stale
/// asset gets reported first, is deterministic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValuationTable {
    entries: BTreeMap<AssetType, AssetValue>,
}

impl ValuationTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a slot. It starts at zero and stale.
    pub fn register(&mut self, asset: AssetType) -> Result<(), VaultError> {
        if self.entries.contains_key(&asset) {
            return Err(VaultError::AssetAlreadyRegistered(asset));
        }
        self.entries.insert(
            asset,
            AssetValue {
                usd_value: 0,
                last_updated: None,
            },
        );
        Ok(())
    }

    /// Removes a slot and returns its last value.
    pub fn remove(&mut self, asset: &AssetType) -> Result<AssetValue, VaultError> {
        self.entries
            .remove(asset)
            .ok_or_else(|| VaultError::AssetNotRegistered(asset.clone()))
    }

    /// `true` if `asset` has a slot.
    pub fn contains(&self, asset: &AssetType) -> bool {
        self.entries.contains_key(asset)
    }

    /// Registered asset types in order.
    pub fn asset_types(&self) -> impl Iterator<Item = &AssetType> {
        self.entries.keys()
    }

    /// Number of registered slots.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached value of `asset`.
    pub fn value(&self, asset: &AssetType) -> Option<AssetValue> {
        self.entries.get(asset).copied()
    }

    /// Timestamp of the last write to `asset`.
    pub fn last_updated(&self, asset: &AssetType) -> Option<DateTime<Utc>> {
        self.entries.get(asset).and_then(|v| v.last_updated)
    }

    /// Overwrites the value of `asset` as of `now`.
    pub fn update(&mut self, asset: &AssetType, usd_value: u128, now: DateTime<Utc>) -> Result<(), VaultError> {
        let entry = self
            .entries
            .get_mut(asset)
            .ok_or_else(|| VaultError::AssetNotRegistered(asset.clone()))?;
        entry.usd_value = usd_value;
        entry.last_updated = Some(now);
        Ok(())
    }

    /// Sum of every slot's value.
    ///
    /// # Errors
    ///
    /// [`VaultError::StaleValuation`] naming the first slot that was never
    /// updated or whose age exceeds `freshness`. A `freshness` of zero
    /// requires every slot to have been written at `now`.
    pub fn total_value(&self, now: DateTime<Utc>, freshness: Duration) -> Result<u128, VaultError> {
        self.sum(now, freshness, None)
    }

    /// Like [`total_value`](Self::total_value), but as if `asset` had just
    /// been written with `usd_value` at `now`. Used to price a pending
    /// change before committing it.
    pub fn total_value_with(
        &self,
        now: DateTime<Utc>,
        freshness: Duration,
        asset: &AssetType,
        usd_value: u128,
    ) -> Result<u128, VaultError> {
        if !self.entries.contains_key(asset) {
            return Err(VaultError::AssetNotRegistered(asset.clone()));
        }
        self.sum(now, freshness, Some((asset, usd_value)))
    }

    /// Sum of the cached values, ignoring their age. Only the emergency
    /// override uses this, to measure what a force-closed operation lost.
    pub fn cached_total(&self) -> Result<u128, VaultError> {
        self.entries.values().try_fold(0u128, |total, value| {
            total
                .checked_add(value.usd_value)
                .ok_or(VaultError::ArithmeticOverflow("total value"))
        })
    }

    fn sum(
        &self,
        now: DateTime<Utc>,
        freshness: Duration,
        substitute: Option<(&AssetType, u128)>,
    ) -> Result<u128, VaultError> {
        let mut total: u128 = 0;
        for (asset, value) in &self.entries {
            let usd_value = match substitute {
                Some((target, replacement)) if target == asset => replacement,
                _ => {
                    match value.last_updated {
                        Some(at) if age(now, at) <= freshness => {}
                        last_updated => {
                            return Err(VaultError::StaleValuation {
                                asset: asset.clone(),
                                last_updated,
                            })
                        }
                    }
                    value.usd_value
                }
            };
            total = total
                .checked_add(usd_value)
                .ok_or(VaultError::ArithmeticOverflow("total value"))?;
        }
        Ok(total)
    }
}
