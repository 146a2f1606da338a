//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;

use tidepool_engine::config::PRICE_SCALE;
use tidepool_engine::{
    AdminCap, AssetType, Clock, Holding, OperatorCap, OracleConfig, PriceCache, Receipt,
    Vault, VaultConfig,
};

/// One whole unit of a 9-decimal token, and one canonical USD.
pub const ONE: u128 = 1_000_000_000;

/// Wall-clock start used by every harness.
pub const START_MS: i64 = 1_700_000_000_000;

pub fn sui() -> AssetType {
    AssetType::new("SUI")
}

pub fn usdc() -> AssetType {
    AssetType::new("USDC")
}

/// A vault over SUI (9 decimals, $1.00) with a USDC feed (6 decimals, $1.00)
/// registered in the price cache.
pub struct Harness {
    pub admin: AdminCap,
    pub operator: OperatorCap,
    pub prices: PriceCache,
    pub vault: Vault,
    pub clock: Clock,
    pub quotes: BTreeMap<AssetType, u128>,
}

impl Harness {
    pub fn new(config: VaultConfig) -> Self {
        let admin = AdminCap::generate();
        let operator = OperatorCap::issue(&admin);
        let clock = Clock::from_millis(START_MS, 1);
        let mut prices = PriceCache::new(&admin, OracleConfig::default()).unwrap();
        prices.register(sui(), 9, "feed/sui").unwrap();
        prices.register(usdc(), 6, "feed/usdc").unwrap();
        let vault = Vault::new(&admin, sui(), &prices, config).unwrap();

        let mut quotes = BTreeMap::new();
        quotes.insert(sui(), PRICE_SCALE);
        quotes.insert(usdc(), PRICE_SCALE);

        let mut harness = Self {
            admin,
            operator,
            prices,
            vault,
            clock,
            quotes,
        };
        harness.refresh_prices();
        harness.vault.update_principal_value(&harness.prices, &harness.clock).unwrap();
        harness
    }

    /// Default config without fees or locking windows.
    pub fn frictionless() -> Self {
        Self::new(VaultConfig {
            deposit_fee_bps: 0,
            withdraw_fee_bps: 0,
            withdraw_lock_ms: 0,
            cancel_lock_ms: 0,
            ..VaultConfig::default()
        })
    }

    pub fn set_quote(&mut self, asset: &AssetType, price: u128) {
        self.quotes.insert(asset.clone(), price);
        self.prices.refresh(asset, price, self.clock.now).unwrap();
    }

    pub fn refresh_prices(&mut self) {
        for (asset, price) in &self.quotes {
            self.prices.refresh(asset, *price, self.clock.now).unwrap();
        }
    }

    /// Re-prices every coin slot and the principal at the current instant.
    pub fn revalue_coins(&mut self) {
        self.vault.update_principal_value(&self.prices, &self.clock).unwrap();
        let coins: Vec<AssetType> = self
            .vault
            .valuations()
            .asset_types()
            .filter(|a| matches!(self.vault.holding(a), Some(Holding::Coin { .. })))
            .cloned()
            .collect();
        for coin in coins {
            self.vault.update_coin_value(&self.prices, &coin, &self.clock).unwrap();
        }
    }

    /// Moves time forward and refreshes prices (not values).
    pub fn advance(&mut self, ms: i64) {
        self.clock = self.clock.advanced_ms(ms);
        self.refresh_prices();
    }

    /// Opens a receipt for `owner`, deposits `amount` and executes it.
    /// Returns the receipt and the shares minted.
    pub fn deposit(&mut self, owner: &str, amount: u128) -> (Receipt, u128) {
        let receipt = self.vault.open_receipt(owner);
        let shares = self.deposit_into(&receipt, owner, amount);
        (receipt, shares)
    }

    pub fn deposit_into(&mut self, receipt: &Receipt, owner: &str, amount: u128) -> u128 {
        let request = self
            .vault
            .enqueue_deposit(receipt, owner, amount, 0, &self.clock)
            .unwrap();
        self.vault
            .execute_deposit(&self.operator, &self.prices, request, u128::MAX, &self.clock)
            .unwrap()
            .shares_minted
    }
}
