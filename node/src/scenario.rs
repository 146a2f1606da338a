//! # Scenario Format
//!
//! A scenario is a JSON document describing the price feeds a vault starts
//! with and an ordered list of steps to apply to it. Every step names one
//! engine entry point; the runner supplies the capabilities and the clock.
//!
//! ```json
//! {
//!   "name": "basic",
//!   "principal": "SUI",
//!   "feeds": [{ "asset": "SUI", "decimals": 9, "price": 1000000000000000000 }],
//!   "steps": [
//!     { "action": { "open_receipt": { "receipt": "alice", "owner": "alice" } } },
//!     { "action": { "deposit": { "receipt": "alice", "owner": "alice", "amount": 1000000000 } } },
//!     { "action": { "execute": { "receipt": "alice" } } }
//!   ]
//! }
//! ```
//!
//! Receipts are referred to by a label chosen in `open_receipt`. A step may
//! declare `expect_error` with a [`VaultError::code`](tidepool_engine::VaultError::code);
//! the report then counts that failure as expected.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tidepool_engine::{Asset, AssetType, Borrow, PositionKind};

/// Default scenario start, 2023-11-14T22:13:20Z.
pub const DEFAULT_START_MS: i64 = 1_700_000_000_000;

/// A full scenario file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Label echoed in the report.
    #[serde(default)]
    pub name: String,
    /// Wall-clock start in milliseconds since the Unix epoch.
    #[serde(default = "default_start_ms")]
    pub start_ms: i64,
    /// Loss epoch the run starts in.
    #[serde(default = "default_start_epoch")]
    pub start_epoch: u64,
    /// The vault's principal asset. Must have a feed.
    pub principal: AssetType,
    /// Price feeds registered before the first step.
    pub feeds: Vec<Feed>,
    /// Steps, applied in order.
    pub steps: Vec<Step>,
}

fn default_start_ms() -> i64 {
    DEFAULT_START_MS
}

fn default_start_epoch() -> u64 {
    1
}

impl Scenario {
    /// Reads and parses a scenario file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario {}", path.display()))?;
        Self::from_json_str(&raw)
            .with_context(|| format!("failed to parse scenario {}", path.display()))
    }

    /// Parses a scenario document.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let scenario: Scenario = serde_json::from_str(raw)?;
        if !scenario.feeds.iter().any(|f| f.asset == scenario.principal) {
            anyhow::bail!("principal {} has no price feed", scenario.principal);
        }
        Ok(scenario)
    }
}

/// A price feed and its opening quote.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Feed {
    pub asset: AssetType,
    /// Native decimals of the asset.
    pub decimals: u8,
    /// Opening price, 18-decimal USD per whole token.
    pub price: u128,
}

/// One scenario step.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    pub action: Action,
    /// Error code this step is expected to fail with.
    #[serde(default)]
    pub expect_error: Option<u16>,
}

/// Position kinds a scenario can register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KindName {
    Lending,
    Liquidity,
}

impl From<KindName> for PositionKind {
    fn from(name: KindName) -> Self {
        match name {
            KindName::Lending => PositionKind::Lending,
            KindName::Liquidity => PositionKind::Liquidity,
        }
    }
}

/// Something to borrow at the start of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Loan {
    Principal { amount: u128 },
    Coin { asset: AssetType, amount: u128 },
    Position { asset: AssetType },
}

impl From<&Loan> for Borrow {
    fn from(loan: &Loan) -> Self {
        match loan {
            Loan::Principal { amount } => Borrow::Principal { amount: *amount },
            Loan::Coin { asset, amount } => Borrow::Coin {
                asset: asset.clone(),
                amount: *amount,
            },
            Loan::Position { asset } => Borrow::Position {
                asset: asset.clone(),
            },
        }
    }
}

/// Something handed back at the end of an operation.
///
/// Positions are named by slot; the runner hands back the position object
/// it received when the operation started.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Giveback {
    Principal { amount: u128 },
    Coin { asset: AssetType, amount: u128 },
    Position { asset: AssetType },
}

impl Giveback {
    /// Resolves this item against the assets currently on loan.
    pub fn resolve(&self, on_loan: &[Asset]) -> Result<Asset> {
        Ok(match self {
            Giveback::Principal { amount } => Asset::Principal(*amount),
            Giveback::Coin { asset, amount } => Asset::Coin {
                asset: asset.clone(),
                amount: *amount,
            },
            Giveback::Position { asset } => on_loan
                .iter()
                .find(|a| matches!(a, Asset::Position(p) if p.asset_type == *asset))
                .cloned()
                .with_context(|| format!("position {asset} is not on loan"))?,
        })
    }
}

/// Admin-settable configuration fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigField {
    DepositFeeBps,
    WithdrawFeeBps,
    LossToleranceBps,
    ValuationFreshnessMs,
    WithdrawLockMs,
    CancelLockMs,
    EmergencyOverrideDelayMs,
}

/// An engine call.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Push a new quote for `asset` at the current instant.
    SetPrice { asset: AssetType, price: u128 },
    /// Move time forward and re-push the last quote of every feed.
    Advance { ms: i64 },
    /// Move to the next loss epoch.
    NextEpoch,
    RegisterCoin { asset: AssetType },
    RegisterPosition {
        asset: AssetType,
        kind: KindName,
    },
    RemoveAsset { asset: AssetType },
    OpenReceipt { receipt: String, owner: String },
    TransferEntitlement {
        receipt: String,
        from: String,
        to: String,
    },
    Deposit {
        receipt: String,
        owner: String,
        amount: u128,
        #[serde(default)]
        expected_shares: u128,
    },
    Withdraw {
        receipt: String,
        owner: String,
        shares: u128,
        #[serde(default)]
        expected_principal: u128,
    },
    Cancel { receipt: String, owner: String },
    /// Execute the pending request of a receipt. `max` bounds shares minted
    /// or principal paid.
    Execute {
        receipt: String,
        #[serde(default)]
        max: Option<u128>,
    },
    /// Re-price the principal and every coin slot.
    Revalue,
    /// Operator push of a position slot's USD value.
    SetPositionValue { asset: AssetType, usd_value: u128 },
    StartOperation { borrow: Vec<Loan> },
    ReturnCustody { assets: Vec<Giveback> },
    CompleteOperation,
    EmergencyOverride,
    SetEnabled { enabled: bool },
    RetrieveFees { amount: u128 },
    FreezeOperator { frozen: bool },
    ResetLossTolerance,
    SetConfig { field: ConfigField, value: u64 },
}

impl Action {
    /// Short name for logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            Action::SetPrice { .. } => "set_price",
            Action::Advance { .. } => "advance",
            Action::NextEpoch => "next_epoch",
            Action::RegisterCoin { .. } => "register_coin",
            Action::RegisterPosition { .. } => "register_position",
            Action::RemoveAsset { .. } => "remove_asset",
            Action::OpenReceipt { .. } => "open_receipt",
            Action::TransferEntitlement { .. } => "transfer_entitlement",
            Action::Deposit { .. } => "deposit",
            Action::Withdraw { .. } => "withdraw",
            Action::Cancel { .. } => "cancel",
            Action::Execute { .. } => "execute",
            Action::Revalue => "revalue",
            Action::SetPositionValue { .. } => "set_position_value",
            Action::StartOperation { .. } => "start_operation",
            Action::ReturnCustody { .. } => "return_custody",
            Action::CompleteOperation => "complete_operation",
            Action::EmergencyOverride => "emergency_override",
            Action::SetEnabled { .. } => "set_enabled",
            Action::RetrieveFees { .. } => "retrieve_fees",
            Action::FreezeOperator { .. } => "freeze_operator",
            Action::ResetLossTolerance => "reset_loss_tolerance",
            Action::SetConfig { .. } => "set_config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"{
        "principal": "SUI",
        "feeds": [{ "asset": "SUI", "decimals": 9, "price": 1000000000000000000 }],
        "steps": [
            { "action": "revalue" },
            { "action": { "start_operation": { "borrow": [{ "principal": { "amount": 5 } }] } } },
            { "action": "complete_operation", "expect_error": 1004 }
        ]
    }"#;

    #[test]
    fn parses_unit_and_struct_actions() {
        let scenario = Scenario::from_json_str(MINIMAL).unwrap();
        assert_eq!(scenario.start_ms, DEFAULT_START_MS);
        assert_eq!(scenario.start_epoch, 1);
        assert_eq!(scenario.steps.len(), 3);
        assert_eq!(scenario.steps[0].action.name(), "revalue");
        match &scenario.steps[1].action {
            Action::StartOperation { borrow } => {
                assert_eq!(borrow, &vec![Loan::Principal { amount: 5 }]);
            }
            other => panic!("unexpected action {other:?}"),
        }
        assert_eq!(scenario.steps[2].expect_error, Some(1004));
    }

    #[test]
    fn principal_needs_a_feed() {
        let raw = r#"{ "principal": "SUI", "feeds": [], "steps": [] }"#;
        assert!(Scenario::from_json_str(raw).is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = r#"{ "principal": "SUI", "feeds": [], "steps": [], "extra": 1 }"#;
        assert!(Scenario::from_json_str(raw).is_err());
    }

    #[test]
    fn loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let scenario = Scenario::load(file.path()).unwrap();
        assert_eq!(scenario.principal, AssetType::new("SUI"));
    }

    #[test]
    fn missing_file_reports_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let err = Scenario::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("absent.json"));
    }

    #[test]
    fn giveback_finds_the_loaned_position() {
        let lending = AssetType::position("lending", 0);
        let position = tidepool_engine::PositionRef::new(lending.clone(), PositionKind::Lending);
        let on_loan = vec![Asset::Principal(3), Asset::Position(position.clone())];

        let resolved = Giveback::Position { asset: lending }.resolve(&on_loan).unwrap();
        assert_eq!(resolved, Asset::Position(position));
        assert!(Giveback::Position {
            asset: AssetType::position("lending", 1)
        }
        .resolve(&on_loan)
        .is_err());
    }
}
