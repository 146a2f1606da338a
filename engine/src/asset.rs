//! # Assets, Holdings & Positions
//!
//! A vault tracks three kinds of things it owns:
//!
//! - the **principal** asset, kept as a plain balance (`free_principal`);
//! - other **coins**, kept as balances keyed by asset type;
//! - **positions** in external protocols (a lending account, an AMM range,
//!   a receipt issued by another vault), kept as opaque references that an
//!   external valuator knows how to price.
//!
//! Operators borrow these with [`Borrow`] descriptors and hand them back as
//! [`Asset`] values. The types here are deliberately dumb; the rules live in
//! [`crate::operation`].

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::receipt::ReceiptId;

/// Identifies an asset slot in a vault: a coin type (`"SUI"`, `"USDC"`) or a
/// position slot (`"lending:navi#0"`). Unique per vault.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssetType(String);

impl AssetType {
    /// Wraps a raw asset type name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Builds the slot name for the `index`-th position of a protocol kind,
    /// e.g. `AssetType::position("cetus", 2)` → `"cetus#2"`.
    pub fn position(kind: &str, index: u32) -> Self {
        Self(format!("{kind}#{index}"))
    }

    /// The raw name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// What kind of external position a [`PositionRef`] points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionKind {
    /// A lending-market account (supplied collateral, borrows, incentives).
    Lending,
    /// A concentrated-liquidity AMM position (two-sided liquidity plus
    /// uncollected swap fees and rewards).
    Liquidity,
    /// A receipt issued by another Tidepool vault.
    VaultReceipt {
        /// The vault that issued the receipt.
        issuer: Uuid,
        /// The receipt's id inside the issuing vault.
        receipt_id: ReceiptId,
    },
}

/// An opaque handle to an external position held by the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRef {
    /// The vault slot this position occupies.
    pub asset_type: AssetType,
    /// Identity of the position object. Must survive a borrow unchanged.
    pub id: Uuid,
    /// What the position is.
    pub kind: PositionKind,
}

impl PositionRef {
    /// Creates a new position reference with a fresh id.
    pub fn new(asset_type: AssetType, kind: PositionKind) -> Self {
        Self {
            asset_type,
            id: Uuid::new_v4(),
            kind,
        }
    }
}

/// What the vault holds in a non-principal slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Holding {
    /// A coin balance in the asset's native units.
    Coin {
        /// Balance in native units.
        amount: u128,
    },
    /// An external position.
    Position(PositionRef),
}

impl Holding {
    /// `true` if the holding carries nothing of value in custody.
    pub fn is_empty(&self) -> bool {
        matches!(self, Holding::Coin { amount: 0 })
    }
}

/// One item an operator asks to borrow at the start of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Borrow {
    /// Take `amount` of free principal.
    Principal {
        /// Amount in principal native units.
        amount: u128,
    },
    /// Take `amount` of a registered coin.
    Coin {
        /// The coin slot.
        asset: AssetType,
        /// Amount in native units. Zero is allowed: it still puts the slot
        /// under the operation so the operator can return proceeds into it.
        amount: u128,
    },
    /// Take a whole position.
    Position {
        /// The position slot.
        asset: AssetType,
    },
}

/// An asset in transit between the vault and an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Asset {
    /// Principal balance.
    Principal(u128),
    /// A coin balance.
    Coin {
        /// The coin slot.
        asset: AssetType,
        /// Amount in native units.
        amount: u128,
    },
    /// A position object.
    Position(PositionRef),
}

impl Asset {
    /// The vault slot this asset belongs to, given the vault's principal type.
    pub fn asset_type<'a>(&'a self, principal: &'a AssetType) -> &'a AssetType {
        match self {
            Asset::Principal(_) => principal,
            Asset::Coin { asset, .. } => asset,
            Asset::Position(position) => &position.asset_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_slot_names() {
        assert_eq!(AssetType::position("cetus", 2).as_str(), "cetus#2");
        assert_eq!(AssetType::from("SUI").to_string(), "SUI");
    }

    #[test]
    fn asset_type_resolution() {
        let principal = AssetType::new("SUI");
        let coin = Asset::Coin {
            asset: AssetType::new("USDC"),
            amount: 5,
        };
        assert_eq!(Asset::Principal(1).asset_type(&principal), &principal);
        assert_eq!(coin.asset_type(&principal).as_str(), "USDC");
    }

    #[test]
    fn only_zero_coin_holdings_are_empty() {
        assert!(Holding::Coin { amount: 0 }.is_empty());
        assert!(!Holding::Coin { amount: 1 }.is_empty());
        let position = PositionRef::new(AssetType::position("navi", 0), PositionKind::Lending);
        assert!(!Holding::Position(position).is_empty());
    }
}
