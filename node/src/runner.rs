//! # Scenario Runner
//!
//! Owns one vault, its price cache, the admin and operator capabilities and
//! the clock, and applies scenario steps to them one at a time. A failing
//! step is recorded and the run continues; the engine guarantees a failed
//! call left the vault untouched.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tidepool_engine::{
    AdminCap, Asset, AssetType, Borrow, Clock, EngineConfig, Holding, OperationTicket, OperatorCap,
    PositionRef, PriceCache, Receipt, RequestId, ValueUpdateTicket, Vault, VaultError, VaultEvent,
    VaultId, VaultStatus,
};
use tracing::{debug, info, warn};

use crate::metrics::{gauge_value, NodeMetrics};
use crate::scenario::{Action, ConfigField, Scenario, Step};

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Outcome of one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub action: &'static str,
    pub ok: bool,
    /// `false` when the step failed without `expect_error`, failed with a
    /// different code, or succeeded despite `expect_error`.
    pub expected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

/// Vault state after the last step.
#[derive(Debug, Clone, Serialize)]
pub struct VaultSummary {
    pub vault_id: VaultId,
    pub status: VaultStatus,
    pub total_shares: u128,
    pub free_principal: u128,
    pub fees_collected: u128,
    /// `None` if some slot is stale at the final instant.
    pub total_usd_value: Option<u128>,
    pub share_ratio: Option<u128>,
    pub loss_epoch: u64,
    pub cumulative_loss: u128,
    pub pending_requests: usize,
    pub holdings: BTreeMap<AssetType, Holding>,
}

/// Full run report.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub scenario: String,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepReport>,
    pub unexpected: usize,
    pub vault: VaultSummary,
    pub events: Vec<VaultEvent>,
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// Live state of a scenario run.
pub struct Simulation<'m> {
    admin: AdminCap,
    operator: OperatorCap,
    prices: PriceCache,
    vault: Vault,
    clock: Clock,
    quotes: BTreeMap<AssetType, u128>,
    receipts: HashMap<String, Receipt>,
    pending: HashMap<String, RequestId>,
    on_loan: Vec<Asset>,
    operation: Option<OperationTicket>,
    value_update: Option<ValueUpdateTicket>,
    events: Vec<VaultEvent>,
    metrics: &'m NodeMetrics,
}

impl<'m> Simulation<'m> {
    /// Registers the scenario's feeds and creates the vault.
    pub fn new(scenario: &Scenario, config: &EngineConfig, metrics: &'m NodeMetrics) -> Result<Self> {
        let admin = AdminCap::generate();
        let operator = OperatorCap::issue(&admin);
        let clock = Clock::from_millis(scenario.start_ms, scenario.start_epoch);

        let mut prices = PriceCache::new(&admin, config.oracle.clone())?;
        let mut quotes = BTreeMap::new();
        for feed in &scenario.feeds {
            prices
                .register(feed.asset.clone(), feed.decimals, format!("scenario/{}", feed.asset))
                .with_context(|| format!("feed {}", feed.asset))?;
            prices
                .refresh(&feed.asset, feed.price, clock.now)
                .with_context(|| format!("opening quote for {}", feed.asset))?;
            quotes.insert(feed.asset.clone(), feed.price);
        }

        let mut vault = Vault::new(&admin, scenario.principal.clone(), &prices, config.vault.clone())?;
        vault.update_principal_value(&prices, &clock)?;
        let events = vault.drain_events();
        info!(vault = %vault.id(), principal = %scenario.principal, "simulation vault created");

        Ok(Self {
            admin,
            operator,
            prices,
            vault,
            clock,
            quotes,
            receipts: HashMap::new(),
            pending: HashMap::new(),
            on_loan: Vec::new(),
            operation: None,
            value_update: None,
            events,
            metrics,
        })
    }

    /// Applies every step and produces the report.
    pub fn run(mut self, name: &str, steps: &[Step]) -> Report {
        let mut reports = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            let started = Instant::now();
            let result = self.apply(&step.action);
            self.metrics
                .step_latency_seconds
                .observe(started.elapsed().as_secs_f64());
            self.events.extend(self.vault.drain_events());
            reports.push(self.record(index, step, result));
        }

        let vault = self.summary();
        self.metrics.realized_loss.set(gauge_value(vault.cumulative_loss));
        if let Some(total) = vault.total_usd_value {
            self.metrics.total_value.set(gauge_value(total));
        }
        let unexpected = reports.iter().filter(|r| !r.expected).count();
        info!(steps = reports.len(), unexpected, status = %vault.status, "scenario finished");

        Report {
            scenario: name.to_string(),
            finished_at: self.clock.now,
            steps: reports,
            unexpected,
            vault,
            events: self.events,
        }
    }

    fn record(&self, index: usize, step: &Step, result: Result<Value>) -> StepReport {
        let action = step.action.name();
        match result {
            Ok(output) => {
                debug!(index, action, "step applied");
                StepReport {
                    index,
                    action,
                    ok: true,
                    expected: step.expect_error.is_none(),
                    output: Some(output),
                    error: None,
                    code: None,
                }
            }
            Err(err) => {
                self.metrics.failed_steps_total.inc();
                let code = err.downcast_ref::<VaultError>().map(VaultError::code);
                let expected = step.expect_error.is_some() && step.expect_error == code;
                if expected {
                    debug!(index, action, ?code, "step failed as expected");
                } else {
                    warn!(index, action, ?code, error = %format!("{err:#}"), "step failed");
                }
                StepReport {
                    index,
                    action,
                    ok: false,
                    expected,
                    output: None,
                    error: Some(format!("{err:#}")),
                    code,
                }
            }
        }
    }

    fn summary(&self) -> VaultSummary {
        let now = self.clock.now;
        let holdings = self
            .vault
            .valuations()
            .asset_types()
            .filter_map(|a| self.vault.holding(a).map(|h| (a.clone(), h.clone())))
            .collect();
        VaultSummary {
            vault_id: self.vault.id(),
            status: self.vault.status(),
            total_shares: self.vault.total_shares(),
            free_principal: self.vault.free_principal(),
            fees_collected: self.vault.fees_collected(),
            total_usd_value: self.vault.total_value(now).ok(),
            share_ratio: self.vault.share_ratio(now).ok(),
            loss_epoch: self.vault.loss_tracker().epoch_id(),
            cumulative_loss: self.vault.loss_tracker().cumulative_loss(),
            pending_requests: self.vault.ledger().len(),
            holdings,
        }
    }

    fn apply(&mut self, action: &Action) -> Result<Value> {
        match action {
            Action::SetPrice { asset, price } => {
                self.prices.refresh(asset, *price, self.clock.now)?;
                self.quotes.insert(asset.clone(), *price);
                Ok(json!({ "asset": asset }))
            }
            Action::Advance { ms } => {
                self.clock = self.clock.advanced_ms(*ms);
                for (asset, price) in &self.quotes {
                    self.prices.refresh(asset, *price, self.clock.now)?;
                }
                Ok(json!({ "now": self.clock.now }))
            }
            Action::NextEpoch => {
                self.clock = self.clock.next_epoch();
                Ok(json!({ "epoch": self.clock.epoch }))
            }
            Action::RegisterCoin { asset } => {
                self.vault
                    .register_coin_asset(&self.admin, asset.clone(), &self.prices)?;
                self.vault.update_coin_value(&self.prices, asset, &self.clock)?;
                Ok(json!({ "asset": asset }))
            }
            Action::RegisterPosition { asset, kind } => {
                let position = PositionRef::new(asset.clone(), (*kind).into());
                let id = position.id;
                self.vault.register_position_asset(&self.admin, position)?;
                Ok(json!({ "asset": asset, "position_id": id }))
            }
            Action::RemoveAsset { asset } => {
                self.vault.remove_asset(&self.admin, asset)?;
                Ok(json!({ "asset": asset }))
            }
            Action::OpenReceipt { receipt, owner } => {
                if self.receipts.contains_key(receipt) {
                    return Err(anyhow!("receipt label {receipt} is already in use"));
                }
                let opened = self.vault.open_receipt(owner.clone());
                let id = opened.id();
                self.receipts.insert(receipt.clone(), opened);
                Ok(json!({ "receipt_id": id }))
            }
            Action::TransferEntitlement { receipt, from, to } => {
                let handle = lookup(&self.receipts, receipt)?;
                self.vault.transfer_entitlement(handle, from, to.clone())?;
                Ok(json!({ "entitled": to }))
            }
            Action::Deposit {
                receipt,
                owner,
                amount,
                expected_shares,
            } => {
                let handle = lookup(&self.receipts, receipt)?;
                let id = self
                    .vault
                    .enqueue_deposit(handle, owner, *amount, *expected_shares, &self.clock)?;
                self.pending.insert(receipt.clone(), id);
                Ok(json!({ "request": id.to_string() }))
            }
            Action::Withdraw {
                receipt,
                owner,
                shares,
                expected_principal,
            } => {
                let handle = lookup(&self.receipts, receipt)?;
                let id = self.vault.enqueue_withdraw(
                    handle,
                    owner,
                    *shares,
                    *expected_principal,
                    &self.clock,
                )?;
                self.pending.insert(receipt.clone(), id);
                Ok(json!({ "request": id.to_string() }))
            }
            Action::Cancel { receipt, owner } => {
                let id = self.pending_request(receipt)?;
                let refund = self.vault.cancel_request(id, owner, &self.clock)?;
                self.pending.remove(receipt);
                Ok(serde_json::to_value(refund)?)
            }
            Action::Execute { receipt, max } => {
                let id = self.pending_request(receipt)?;
                let max = max.unwrap_or(u128::MAX);
                let output = match id {
                    RequestId::Deposit(_) => {
                        let done = self.vault.execute_deposit(
                            &self.operator,
                            &self.prices,
                            id,
                            max,
                            &self.clock,
                        )?;
                        self.metrics.deposits_executed_total.inc();
                        serde_json::to_value(done)?
                    }
                    RequestId::Withdraw(_) => {
                        let done = self.vault.execute_withdraw(
                            &self.operator,
                            &self.prices,
                            id,
                            max,
                            &self.clock,
                        )?;
                        self.metrics.withdrawals_executed_total.inc();
                        serde_json::to_value(done)?
                    }
                };
                self.pending.remove(receipt);
                Ok(output)
            }
            Action::Revalue => {
                let mut values = BTreeMap::new();
                let principal = self.vault.principal().clone();
                values.insert(
                    principal,
                    self.vault.update_principal_value(&self.prices, &self.clock)?,
                );
                let coins: Vec<AssetType> = self
                    .vault
                    .valuations()
                    .asset_types()
                    .filter(|a| matches!(self.vault.holding(a), Some(Holding::Coin { .. })))
                    .cloned()
                    .collect();
                for coin in coins {
                    let value = self.vault.update_coin_value(&self.prices, &coin, &self.clock)?;
                    values.insert(coin, value);
                }
                Ok(serde_json::to_value(values)?)
            }
            Action::SetPositionValue { asset, usd_value } => {
                self.vault
                    .update_asset_value(&self.operator, asset, *usd_value, &self.clock)?;
                Ok(json!({ "asset": asset }))
            }
            Action::StartOperation { borrow } => {
                if self.operation.is_some() || self.value_update.is_some() {
                    return Err(anyhow!("an operation is already running"));
                }
                let borrows: Vec<Borrow> = borrow.iter().map(Borrow::from).collect();
                let (assets, ticket) =
                    self.vault
                        .start_operation(&self.operator, borrows, &self.clock)?;
                let sequence = ticket.sequence();
                self.on_loan = assets;
                self.operation = Some(ticket);
                Ok(json!({ "sequence": sequence, "borrowed": self.on_loan.len() }))
            }
            Action::ReturnCustody { assets } => {
                let ticket = self
                    .operation
                    .as_ref()
                    .context("no operation is waiting for custody")?;
                let returned = assets
                    .iter()
                    .map(|g| g.resolve(&self.on_loan))
                    .collect::<Result<Vec<_>>>()?;
                let update = self
                    .vault
                    .return_custody(&self.operator, ticket, returned)?;
                let sequence = update.sequence();
                self.operation = None;
                self.on_loan.clear();
                self.value_update = Some(update);
                Ok(json!({ "sequence": sequence }))
            }
            Action::CompleteOperation => {
                let ticket = self
                    .value_update
                    .as_ref()
                    .context("no operation is waiting for completion")?;
                let summary = self
                    .vault
                    .complete_operation(&self.operator, ticket, &self.clock)?;
                self.value_update = None;
                self.metrics.operations_completed_total.inc();
                Ok(serde_json::to_value(summary)?)
            }
            Action::EmergencyOverride => {
                let summary =
                    self.vault
                        .emergency_override(&self.admin, &self.prices, &self.clock)?;
                self.operation = None;
                self.value_update = None;
                self.on_loan.clear();
                self.metrics.emergency_overrides_total.inc();
                Ok(serde_json::to_value(summary)?)
            }
            Action::SetEnabled { enabled } => {
                self.vault.set_enabled(&self.admin, *enabled)?;
                Ok(json!({ "status": self.vault.status() }))
            }
            Action::RetrieveFees { amount } => {
                let payout = self
                    .vault
                    .retrieve_fees(&self.operator, *amount, &self.clock)?;
                Ok(serde_json::to_value(payout)?)
            }
            Action::FreezeOperator { frozen } => {
                self.vault
                    .set_operator_frozen(&self.admin, self.operator.id(), *frozen)?;
                Ok(json!({ "frozen": frozen }))
            }
            Action::ResetLossTolerance => {
                self.vault.reset_loss_tolerance(&self.admin, &self.clock)?;
                Ok(json!({ "epoch": self.vault.loss_tracker().epoch_id() }))
            }
            Action::SetConfig { field, value } => {
                let admin = &self.admin;
                let value = *value;
                match field {
                    ConfigField::DepositFeeBps => self.vault.set_deposit_fee_bps(admin, value),
                    ConfigField::WithdrawFeeBps => self.vault.set_withdraw_fee_bps(admin, value),
                    ConfigField::LossToleranceBps => {
                        self.vault.set_loss_tolerance_bps(admin, value)
                    }
                    ConfigField::ValuationFreshnessMs => {
                        self.vault.set_valuation_freshness_ms(admin, value)
                    }
                    ConfigField::WithdrawLockMs => self.vault.set_withdraw_lock_ms(admin, value),
                    ConfigField::CancelLockMs => self.vault.set_cancel_lock_ms(admin, value),
                    ConfigField::EmergencyOverrideDelayMs => {
                        self.vault.set_emergency_override_delay_ms(admin, value)
                    }
                }?;
                Ok(json!({ "field": field, "value": value }))
            }
        }
    }

    fn pending_request(&self, receipt: &str) -> Result<RequestId> {
        self.pending
            .get(receipt)
            .copied()
            .with_context(|| format!("receipt {receipt} has no pending request"))
    }
}

fn lookup<'a>(receipts: &'a HashMap<String, Receipt>, label: &str) -> Result<&'a Receipt> {
    receipts
        .get(label)
        .with_context(|| format!("unknown receipt label {label}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONE: u128 = 1_000_000_000;

    fn run(raw: &str) -> Report {
        let scenario = Scenario::from_json_str(raw).unwrap();
        let metrics = NodeMetrics::new().unwrap();
        let config = EngineConfig::default();
        Simulation::new(&scenario, &config, &metrics)
            .unwrap()
            .run(&scenario.name, &scenario.steps)
    }

    const ROUND_TRIP: &str = r#"{
        "name": "round-trip",
        "principal": "SUI",
        "feeds": [
            { "asset": "SUI", "decimals": 9, "price": 1000000000000000000 },
            { "asset": "USDC", "decimals": 6, "price": 1000000000000000000 }
        ],
        "steps": [
            { "action": { "set_config": { "field": "deposit_fee_bps", "value": 0 } } },
            { "action": { "register_coin": { "asset": "USDC" } } },
            { "action": { "register_position": { "asset": "lending#0", "kind": "lending" } } },
            { "action": { "set_position_value": { "asset": "lending#0", "usd_value": 50000000000 } } },
            { "action": { "open_receipt": { "receipt": "alice", "owner": "alice" } } },
            { "action": { "deposit": { "receipt": "alice", "owner": "alice", "amount": 1000000000000 } } },
            { "action": { "execute": { "receipt": "alice" } } },
            { "action": { "start_operation": { "borrow": [
                { "principal": { "amount": 100000000000 } },
                { "coin": { "asset": "USDC", "amount": 0 } },
                { "position": { "asset": "lending#0" } }
            ] } } },
            { "action": "complete_operation", "expect_error": null },
            { "action": { "return_custody": { "assets": [
                { "principal": { "amount": 0 } },
                { "coin": { "asset": "USDC", "amount": 100000000 } },
                { "position": { "asset": "lending#0" } }
            ] } } },
            { "action": "revalue" },
            { "action": "complete_operation", "expect_error": 1005 },
            { "action": { "set_position_value": { "asset": "lending#0", "usd_value": 51000000000 } } },
            { "action": "complete_operation" }
        ]
    }"#;

    #[test]
    fn replays_a_full_operation() {
        let report = run(ROUND_TRIP);
        assert_eq!(report.scenario, "round-trip");

        // Completing before custody came back is a runner error, not a vault one.
        assert!(!report.steps[8].ok);
        assert!(!report.steps[8].expected);
        assert_eq!(report.steps[8].code, None);

        assert!(!report.steps[11].ok);
        assert!(report.steps[11].expected);
        assert_eq!(report.steps[11].code, Some(1005));

        assert!(report.steps[13].ok);
        assert_eq!(report.unexpected, 1);
        assert_eq!(report.vault.status, VaultStatus::Normal);
        assert_eq!(report.vault.total_shares, 1_000 * ONE);
        assert_eq!(report.vault.free_principal, 900 * ONE);
        assert_eq!(report.vault.total_usd_value, Some(1_051 * ONE));
        assert!(report
            .events
            .iter()
            .any(|e| matches!(e, VaultEvent::OperationCompleted { .. })));
    }

    #[test]
    fn metrics_follow_the_run() {
        let scenario = Scenario::from_json_str(ROUND_TRIP).unwrap();
        let metrics = NodeMetrics::new().unwrap();
        Simulation::new(&scenario, &EngineConfig::default(), &metrics)
            .unwrap()
            .run(&scenario.name, &scenario.steps);

        assert_eq!(metrics.deposits_executed_total.get(), 1);
        assert_eq!(metrics.operations_completed_total.get(), 1);
        assert_eq!(metrics.failed_steps_total.get(), 2);
        assert_eq!(metrics.realized_loss.get(), 0);
    }

    #[test]
    fn unknown_labels_fail_without_touching_the_vault() {
        let report = run(r#"{
            "principal": "SUI",
            "feeds": [{ "asset": "SUI", "decimals": 9, "price": 1000000000000000000 }],
            "steps": [
                { "action": { "deposit": { "receipt": "ghost", "owner": "ghost", "amount": 1 } } },
                { "action": { "cancel": { "receipt": "ghost", "owner": "ghost" } } }
            ]
        }"#);
        assert!(report.steps.iter().all(|s| !s.ok && s.code.is_none()));
        assert_eq!(report.vault.pending_requests, 0);
    }

    #[test]
    fn rejected_prices_surface_their_code() {
        let report = run(r#"{
            "principal": "SUI",
            "feeds": [{ "asset": "SUI", "decimals": 9, "price": 1000000000000000000 }],
            "steps": [
                { "action": { "open_receipt": { "receipt": "a", "owner": "a" } } },
                { "action": { "deposit": { "receipt": "a", "owner": "a", "amount": 1000 } } },
                { "action": { "set_price": { "asset": "SUI", "price": 0 } }, "expect_error": 2003 }
            ]
        }"#);
        assert!(report.steps[2].expected);
        assert_eq!(report.unexpected, 0);
    }
}
