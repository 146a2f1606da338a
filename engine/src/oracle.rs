//! # Price Cache
//!
//! Holds the last accepted price for every tracked asset together with the
//! asset's native decimals and when the price was refreshed. Nothing here
//! ages a price into validity: an entry starts out unreadable and only an
//! explicit refresh makes it readable, until the staleness bound runs out.
//!
//! ## Decimals
//!
//! Prices are 18-decimal USD per whole token. Assets have whatever native
//! decimals their ledger gives them. Summing values across assets is only
//! meaningful at a single precision, so every consumer that compares or adds
//! across assets reads [`PriceCache::normalized`], never the raw price.
//!
//! ## Authority
//!
//! Mutating a `PriceCache` needs `&mut self`; the host gives that to its
//! oracle keeper and nobody else. Configuration setters additionally demand
//! the admin capability the cache was created with.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::asset::AssetType;
use crate::clock::age;
use crate::config::{validate_min_price, validate_window, OracleConfig, MAX_ASSET_DECIMALS};
use crate::error::VaultError;
use crate::guard::{ensure_admin, AdminCap};
use crate::math::normalize_price;

// ---------------------------------------------------------------------------
// Oracle collaborator
// ---------------------------------------------------------------------------

/// A price reported by an external oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceObservation {
    /// 18-decimal USD price per whole token.
    pub price: u128,
    /// Native decimals of the asset as the oracle knows them.
    pub decimals: u8,
    /// When the oracle produced the price.
    pub timestamp: DateTime<Utc>,
}

/// An external price feed.
///
/// Returning `None` means "no valid price". The cache turns that into
/// [`VaultError::PriceUnavailable`]; it never reads it as zero.
pub trait PriceSource {
    /// Latest observation for the feed identified by `source_ref`.
    fn observe(&self, source_ref: &str) -> Option<PriceObservation>;
}

// ---------------------------------------------------------------------------
// PriceCacheEntry
// ---------------------------------------------------------------------------

/// Cached price state for one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceCacheEntry {
    /// Oracle feed identifier.
    pub source_ref: String,
    /// Native decimals of the asset.
    pub decimals: u8,
    /// Last accepted 18-decimal price. Zero until the first refresh.
    pub price: u128,
    /// When `price` was accepted. `None` until the first refresh.
    pub last_updated: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// PriceCache
// ---------------------------------------------------------------------------

/// Staleness-bounded per-asset price cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceCache {
    admin: Uuid,
    config: OracleConfig,
    entries: HashMap<AssetType, PriceCacheEntry>,
}

impl PriceCache {
    /// Creates an empty cache administered by `admin`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Config`] if `config` fails validation; in
    /// particular a zero minimum effective price is never accepted.
    pub fn new(admin: &AdminCap, config: OracleConfig) -> Result<Self, VaultError> {
        config.validate()?;
        Ok(Self {
            admin: admin.id(),
            config,
            entries: HashMap::new(),
        })
    }

    /// Current configuration.
    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    /// Cached entry for `asset`, if registered.
    pub fn entry(&self, asset: &AssetType) -> Option<&PriceCacheEntry> {
        self.entries.get(asset)
    }

    /// `true` if `asset` is registered.
    pub fn contains(&self, asset: &AssetType) -> bool {
        self.entries.contains_key(asset)
    }

    /// Starts tracking `asset`. The entry is unreadable until refreshed.
    ///
    /// # Errors
    ///
    /// [`VaultError::AssetAlreadyRegistered`] if already tracked;
    /// [`VaultError::UnsupportedDecimals`] above [`MAX_ASSET_DECIMALS`].
    pub fn register(
        &mut self,
        asset: AssetType,
        decimals: u8,
        source_ref: impl Into<String>,
    ) -> Result<(), VaultError> {
        if self.entries.contains_key(&asset) {
            return Err(VaultError::AssetAlreadyRegistered(asset));
        }
        if decimals > MAX_ASSET_DECIMALS {
            return Err(VaultError::UnsupportedDecimals { asset, decimals });
        }
        debug!(asset = %asset, decimals, "price feed registered");
        self.entries.insert(
            asset,
            PriceCacheEntry {
                source_ref: source_ref.into(),
                decimals,
                price: 0,
                last_updated: None,
            },
        );
        Ok(())
    }

    /// Accepts `price` for `asset` as of `now`.
    ///
    /// # Errors
    ///
    /// - [`VaultError::AssetNotRegistered`] for unknown assets.
    /// - [`VaultError::PriceBelowMinimum`] below the minimum effective price
    ///   (which is never zero, so a zero price is always rejected).
    /// - [`VaultError::StalePrice`] if `now` is older than the cached
    ///   timestamp.
    pub fn refresh(&mut self, asset: &AssetType, price: u128, now: DateTime<Utc>) -> Result<(), VaultError> {
        let min = self.config.min_effective_price;
        let entry = self
            .entries
            .get_mut(asset)
            .ok_or_else(|| VaultError::AssetNotRegistered(asset.clone()))?;
        accept(asset, entry, price, now, min)
    }

    /// Pulls the latest observation from `source` and accepts it.
    ///
    /// The observation's own timestamp is what gets cached, so an old
    /// observation cannot be laundered into a fresh one.
    pub fn refresh_from(
        &mut self,
        asset: &AssetType,
        source: &dyn PriceSource,
        now: DateTime<Utc>,
    ) -> Result<(), VaultError> {
        let min = self.config.min_effective_price;
        let bound = self.config.staleness_bound();
        let entry = self
            .entries
            .get_mut(asset)
            .ok_or_else(|| VaultError::AssetNotRegistered(asset.clone()))?;

        let observation = source
            .observe(&entry.source_ref)
            .ok_or_else(|| VaultError::PriceUnavailable(asset.clone()))?;

        if observation.decimals != entry.decimals {
            return Err(VaultError::DecimalsMismatch {
                asset: asset.clone(),
                registered: entry.decimals,
                observed: observation.decimals,
            });
        }
        if age(now, observation.timestamp) > bound {
            return Err(VaultError::StalePrice {
                asset: asset.clone(),
                last_updated: Some(observation.timestamp),
            });
        }
        accept(asset, entry, observation.price, observation.timestamp, min)
    }

    /// Raw price and native decimals for `asset`.
    ///
    /// # Errors
    ///
    /// [`VaultError::StalePrice`] if never refreshed or older than the
    /// staleness bound.
    pub fn read(&self, asset: &AssetType, now: DateTime<Utc>) -> Result<(u128, u8), VaultError> {
        let entry = self
            .entries
            .get(asset)
            .ok_or_else(|| VaultError::AssetNotRegistered(asset.clone()))?;
        match entry.last_updated {
            Some(at) if age(now, at) <= self.config.staleness_bound() => {
                Ok((entry.price, entry.decimals))
            }
            last_updated => Err(VaultError::StalePrice {
                asset: asset.clone(),
                last_updated,
            }),
        }
    }

    /// Price rescaled to canonical precision. See [`normalize_price`].
    pub fn normalized(&self, asset: &AssetType, now: DateTime<Utc>) -> Result<u128, VaultError> {
        let (price, decimals) = self.read(asset, now)?;
        normalize_price(price, decimals)
    }

    /// Changes the staleness bound.
    pub fn set_staleness_bound(&mut self, admin: &AdminCap, ms: u64) -> Result<(), VaultError> {
        ensure_admin(admin, self.admin)?;
        validate_window("staleness_bound_ms", ms)?;
        self.config.staleness_bound_ms = ms;
        Ok(())
    }

    /// Changes the minimum effective price. Zero is rejected.
    pub fn set_min_effective_price(&mut self, admin: &AdminCap, price: u128) -> Result<(), VaultError> {
        ensure_admin(admin, self.admin)?;
        validate_min_price(price)?;
        self.config.min_effective_price = price;
        Ok(())
    }
}

fn accept(
    asset: &AssetType,
    entry: &mut PriceCacheEntry,
    price: u128,
    at: DateTime<Utc>,
    min: u128,
) -> Result<(), VaultError> {
    if price < min {
        return Err(VaultError::PriceBelowMinimum {
            asset: asset.clone(),
            price,
            min,
        });
    }
    if let Some(previous) = entry.last_updated {
        if at < previous {
            return Err(VaultError::StalePrice {
                asset: asset.clone(),
                last_updated: Some(at),
            });
        }
    }
    entry.price = price;
    entry.last_updated = Some(at);
    debug!(asset = %asset, price, "price refreshed");
    Ok(())
}
