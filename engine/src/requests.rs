//! # Request Ledger
//!
//! Users never touch shares directly. They queue a deposit or withdraw
//! request against their receipt; an operator later executes it against the
//! share ratio of that moment, inside the requester's slippage bounds.
//!
//! A request captures the identity that made it. Execution pays and credits
//! that identity, whoever happens to hold the [`Receipt`] by then.
//!
//! ## Windows
//!
//! - A withdraw can only be requested once `withdraw_lock` has passed since
//!   the receipt's last executed deposit.
//! - A request can only be cancelled once `cancel_lock` has passed since it
//!   was queued, and never while an operation is running.
//!
//! Requests do not expire. A long operation simply leaves them queued.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clock::Clock;
use crate::error::VaultError;
use crate::events::VaultEvent;
use crate::guard::{Access, OperatorCap, StatusRequirement};
use crate::math::{split_fee, usd_value};
use crate::oracle::PriceCache;
use crate::receipt::{Identity, Receipt, ReceiptId, ReceiptStatus};
use crate::shares::{principal_for_withdraw, share_ratio, shares_for_deposit, usd_for_shares};
use crate::vault::Vault;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Identifies a queued request. Ids are monotonic across both kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RequestId {
    /// A deposit request.
    Deposit(u64),
    /// A withdraw request.
    Withdraw(u64),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Deposit(id) => write!(f, "deposit#{id}"),
            RequestId::Withdraw(id) => write!(f, "withdraw#{id}"),
        }
    }
}

/// A queued deposit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRequest {
    /// Request id.
    pub id: RequestId,
    /// Receipt account to credit.
    pub receipt_id: ReceiptId,
    /// Identity captured at enqueue time.
    pub requester: Identity,
    /// Principal buffered for the deposit.
    pub amount: u128,
    /// Minimum acceptable shares.
    pub expected_shares: u128,
    /// When the request was queued.
    pub created_at: DateTime<Utc>,
}

/// A queued withdraw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawRequest {
    /// Request id.
    pub id: RequestId,
    /// Receipt account to debit.
    pub receipt_id: ReceiptId,
    /// Identity captured at enqueue time.
    pub requester: Identity,
    /// Shares to burn.
    pub shares: u128,
    /// Minimum acceptable principal, net of fees.
    pub expected_principal: u128,
    /// When the request was queued.
    pub created_at: DateTime<Utc>,
}

/// Principal leaving the vault for an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    /// Who receives it.
    pub recipient: Identity,
    /// Amount in principal units.
    pub amount: u128,
}

/// Outcome of [`Vault::execute_deposit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositExecution {
    /// The executed request.
    pub request_id: RequestId,
    /// Credited account.
    pub receipt_id: ReceiptId,
    /// Identity the shares belong to.
    pub beneficiary: Identity,
    /// Shares minted.
    pub shares_minted: u128,
    /// Fee taken, in principal units.
    pub fee: u128,
}

/// Outcome of [`Vault::execute_withdraw`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawExecution {
    /// The executed request.
    pub request_id: RequestId,
    /// Debited account.
    pub receipt_id: ReceiptId,
    /// Principal paid to the requester.
    pub payout: Payout,
    /// Fee taken, in principal units.
    pub fee: u128,
    /// Shares burned.
    pub shares_burned: u128,
}

// ---------------------------------------------------------------------------
// RequestLedger
// ---------------------------------------------------------------------------

/// Pending requests of one vault.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestLedger {
    next_id: u64,
    deposits: BTreeMap<u64, DepositRequest>,
    withdrawals: BTreeMap<u64, WithdrawRequest>,
    buffered_principal: u128,
}

impl RequestLedger {
    /// Principal held for pending deposits. Not part of the vault's value.
    pub fn buffered_principal(&self) -> u128 {
        self.buffered_principal
    }

    /// Pending deposits in id order.
    pub fn pending_deposits(&self) -> impl Iterator<Item = &DepositRequest> {
        self.deposits.values()
    }

    /// Pending withdrawals in id order.
    pub fn pending_withdrawals(&self) -> impl Iterator<Item = &WithdrawRequest> {
        self.withdrawals.values()
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.deposits.len() + self.withdrawals.len()
    }

    /// `true` if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A pending deposit.
    pub fn deposit(&self, id: RequestId) -> Result<&DepositRequest, VaultError> {
        match id {
            RequestId::Deposit(n) => self.deposits.get(&n),
            RequestId::Withdraw(_) => None,
        }
        .ok_or_else(|| VaultError::RequestNotFound(id.to_string()))
    }

    /// A pending withdraw.
    pub fn withdraw(&self, id: RequestId) -> Result<&WithdrawRequest, VaultError> {
        match id {
            RequestId::Withdraw(n) => self.withdrawals.get(&n),
            RequestId::Deposit(_) => None,
        }
        .ok_or_else(|| VaultError::RequestNotFound(id.to_string()))
    }

    fn allocate(&mut self) -> Result<u64, VaultError> {
        self.next_id = self
            .next_id
            .checked_add(1)
            .ok_or(VaultError::ArithmeticOverflow("request id"))?;
        Ok(self.next_id)
    }

    fn insert_deposit(&mut self, request: DepositRequest) -> Result<(), VaultError> {
        self.buffered_principal = self
            .buffered_principal
            .checked_add(request.amount)
            .ok_or(VaultError::ArithmeticOverflow("buffered principal"))?;
        if let RequestId::Deposit(n) = request.id {
            self.deposits.insert(n, request);
        }
        Ok(())
    }

    fn remove_deposit(&mut self, id: RequestId) -> Option<DepositRequest> {
        let RequestId::Deposit(n) = id else {
            return None;
        };
        let request = self.deposits.remove(&n)?;
        self.buffered_principal = self.buffered_principal.saturating_sub(request.amount);
        Some(request)
    }

    fn remove_withdraw(&mut self, id: RequestId) -> Option<WithdrawRequest> {
        let RequestId::Withdraw(n) = id else {
            return None;
        };
        self.withdrawals.remove(&n)
    }
}

// ---------------------------------------------------------------------------
// Vault entry points
// ---------------------------------------------------------------------------

impl Vault {
    /// Queues a deposit of `amount` principal into `receipt`.
    ///
    /// `requester` must be the identity entitled to the receipt account; it
    /// is captured and is who the minted shares will belong to.
    pub fn enqueue_deposit(
        &mut self,
        receipt: &Receipt,
        requester: &str,
        amount: u128,
        expected_shares: u128,
        clock: &Clock,
    ) -> Result<RequestId, VaultError> {
        self.guard
            .authorize(Access::Public, self.status, StatusRequirement::Normal)?;
        if amount == 0 {
            return Err(VaultError::ZeroAmount("deposit amount"));
        }
        let account = self.account(receipt)?;
        account.ensure_entitled(requester)?;
        account.ensure_idle()?;

        let id = RequestId::Deposit(self.ledger.allocate()?);
        self.ledger.insert_deposit(DepositRequest {
            id,
            receipt_id: receipt.id(),
            requester: requester.to_string(),
            amount,
            expected_shares,
            created_at: clock.now,
        })?;
        let account = self.account_mut(receipt)?;
        account.status = ReceiptStatus::PendingDeposit;
        account.pending_deposit = amount;

        info!(vault = %self.id, request = %id, requester, amount, "deposit requested");
        self.events.push(VaultEvent::DepositRequested {
            request: id,
            receipt_id: receipt.id(),
            requester: requester.to_string(),
            amount,
        });
        Ok(id)
    }

    /// Queues a withdraw of `shares` from `receipt`.
    pub fn enqueue_withdraw(
        &mut self,
        receipt: &Receipt,
        requester: &str,
        shares: u128,
        expected_principal: u128,
        clock: &Clock,
    ) -> Result<RequestId, VaultError> {
        self.guard
            .authorize(Access::Public, self.status, StatusRequirement::Normal)?;
        if shares == 0 {
            return Err(VaultError::ZeroAmount("withdraw shares"));
        }
        let account = self.account(receipt)?;
        account.ensure_entitled(requester)?;
        account.ensure_idle()?;
        if shares > account.shares {
            return Err(VaultError::InsufficientShares {
                needed: shares,
                available: account.shares,
            });
        }
        if let Some(last_deposit) = account.last_deposit_at {
            let until = last_deposit + self.config.withdraw_lock();
            if clock.now < until {
                return Err(VaultError::Locked {
                    what: "withdraw",
                    until,
                });
            }
        }

        let n = self.ledger.allocate()?;
        let id = RequestId::Withdraw(n);
        self.ledger.withdrawals.insert(
            n,
            WithdrawRequest {
                id,
                receipt_id: receipt.id(),
                requester: requester.to_string(),
                shares,
                expected_principal,
                created_at: clock.now,
            },
        );
        let account = self.account_mut(receipt)?;
        account.status = ReceiptStatus::PendingWithdraw;
        account.pending_withdraw_shares = shares;

        info!(vault = %self.id, request = %id, requester, shares, "withdraw requested");
        self.events.push(VaultEvent::WithdrawRequested {
            request: id,
            receipt_id: receipt.id(),
            requester: requester.to_string(),
            shares,
        });
        Ok(id)
    }

    /// Cancels a pending request. Only the identity that queued it may do
    /// this. A cancelled deposit refunds its buffered principal.
    pub fn cancel_request(
        &mut self,
        request: RequestId,
        requester: &str,
        clock: &Clock,
    ) -> Result<Option<Payout>, VaultError> {
        self.guard
            .authorize(Access::Public, self.status, StatusRequirement::NotDuringOperation)?;
        let (owner, receipt_id, created_at) = match request {
            RequestId::Deposit(_) => {
                let r = self.ledger.deposit(request)?;
                (&r.requester, r.receipt_id, r.created_at)
            }
            RequestId::Withdraw(_) => {
                let r = self.ledger.withdraw(request)?;
                (&r.requester, r.receipt_id, r.created_at)
            }
        };
        if owner != requester {
            return Err(VaultError::IdentityMismatch {
                expected: owner.clone(),
                actual: requester.to_string(),
            });
        }
        let until = created_at + self.config.cancel_lock();
        if clock.now < until {
            return Err(VaultError::Locked { what: "cancel", until });
        }
        if !self.receipts.contains_key(&receipt_id) {
            return Err(VaultError::ReceiptNotFound(receipt_id));
        }

        // Commit.
        let payout = match request {
            RequestId::Deposit(_) => self.ledger.remove_deposit(request).map(|r| Payout {
                recipient: r.requester,
                amount: r.amount,
            }),
            RequestId::Withdraw(_) => {
                self.ledger.remove_withdraw(request);
                None
            }
        };
        if let Some(account) = self.receipts.get_mut(&receipt_id) {
            account.status = ReceiptStatus::Idle;
            account.pending_deposit = 0;
            account.pending_withdraw_shares = 0;
        }
        info!(vault = %self.id, request = %request, requester, "request cancelled");
        self.events.push(VaultEvent::RequestCancelled {
            request,
            requester: requester.to_string(),
        });
        Ok(payout)
    }

    /// Executes a pending deposit.
    ///
    /// The net principal (after the deposit fee) joins `free_principal` and
    /// the principal slot is revalued. The increase in total value, divided
    /// by the pre-deposit share ratio, is what gets minted. The result must
    /// lie in `[expected_shares, max_shares]`.
    pub fn execute_deposit(
        &mut self,
        operator: &OperatorCap,
        prices: &PriceCache,
        request_id: RequestId,
        max_shares: u128,
        clock: &Clock,
    ) -> Result<DepositExecution, VaultError> {
        self.guard
            .authorize(Access::Operator(operator), self.status, StatusRequirement::Normal)?;
        let request = self.ledger.deposit(request_id)?.clone();
        let account = self
            .receipts
            .get(&request.receipt_id)
            .ok_or(VaultError::ReceiptNotFound(request.receipt_id))?;
        account.ensure_entitled(&request.requester)?;

        let freshness = self.config.valuation_freshness();
        let price = prices.normalized(&self.principal, clock.now)?;
        let principal_before = usd_value(self.free_principal, price)?;
        let total_before =
            self.valuations
                .total_value_with(clock.now, freshness, &self.principal, principal_before)?;
        let ratio_before = share_ratio(total_before, self.total_shares)?;

        let (net, fee) = split_fee(request.amount, self.config.deposit_fee_bps)?;
        let free_principal = self
            .free_principal
            .checked_add(net)
            .ok_or(VaultError::ArithmeticOverflow("free principal"))?;
        let principal_after = usd_value(free_principal, price)?;
        let total_after =
            self.valuations
                .total_value_with(clock.now, freshness, &self.principal, principal_after)?;
        let delta = total_after
            .checked_sub(total_before)
            .ok_or(VaultError::ArithmeticOverflow("deposit value delta"))?;

        let minted = shares_for_deposit(delta, ratio_before)?;
        if minted == 0 {
            return Err(VaultError::ZeroAmount("minted shares"));
        }
        if minted < request.expected_shares || minted > max_shares {
            return Err(VaultError::SlippageExceeded {
                actual: minted,
                min: request.expected_shares,
                max: max_shares,
            });
        }
        let total_shares = self
            .total_shares
            .checked_add(minted)
            .ok_or(VaultError::ArithmeticOverflow("total shares"))?;
        let account_shares = account
            .shares
            .checked_add(minted)
            .ok_or(VaultError::ArithmeticOverflow("receipt shares"))?;
        let fees_collected = self
            .fees_collected
            .checked_add(fee)
            .ok_or(VaultError::ArithmeticOverflow("fees collected"))?;

        // Commit.
        self.ledger.remove_deposit(request_id);
        self.free_principal = free_principal;
        self.total_shares = total_shares;
        self.fees_collected = fees_collected;
        let principal = self.principal.clone();
        self.valuations.update(&principal, principal_after, clock.now)?;
        if let Some(account) = self.receipts.get_mut(&request.receipt_id) {
            account.shares = account_shares;
            account.pending_deposit = 0;
            account.status = ReceiptStatus::Idle;
            account.total_deposited = account.total_deposited.saturating_add(net);
            account.last_deposit_at = Some(clock.now);
        }

        info!(
            vault = %self.id,
            request = %request_id,
            beneficiary = %request.requester,
            amount = request.amount,
            fee,
            shares = minted,
            "deposit executed"
        );
        self.events.push(VaultEvent::ValueUpdated {
            asset: principal,
            usd_value: principal_after,
            at: clock.now,
        });
        self.events.push(VaultEvent::DepositExecuted {
            request: request_id,
            beneficiary: request.requester.clone(),
            amount: request.amount,
            fee,
            shares_minted: minted,
        });
        Ok(DepositExecution {
            request_id,
            receipt_id: request.receipt_id,
            beneficiary: request.requester,
            shares_minted: minted,
            fee,
        })
    }

    /// Executes a pending withdraw.
    ///
    /// Shares are converted to USD at the current ratio, then to principal
    /// at the normalized principal price. The withdraw fee is taken from
    /// that amount and the net must lie in
    /// `[expected_principal, max_principal]`.
    pub fn execute_withdraw(
        &mut self,
        operator: &OperatorCap,
        prices: &PriceCache,
        request_id: RequestId,
        max_principal: u128,
        clock: &Clock,
    ) -> Result<WithdrawExecution, VaultError> {
        self.guard
            .authorize(Access::Operator(operator), self.status, StatusRequirement::Normal)?;
        let request = self.ledger.withdraw(request_id)?.clone();
        let account = self
            .receipts
            .get(&request.receipt_id)
            .ok_or(VaultError::ReceiptNotFound(request.receipt_id))?;
        account.ensure_entitled(&request.requester)?;
        if account.shares < request.shares {
            return Err(VaultError::InsufficientShares {
                needed: request.shares,
                available: account.shares,
            });
        }

        let freshness = self.config.valuation_freshness();
        let price = prices.normalized(&self.principal, clock.now)?;
        let principal_value = usd_value(self.free_principal, price)?;
        let total =
            self.valuations
                .total_value_with(clock.now, freshness, &self.principal, principal_value)?;
        let ratio = share_ratio(total, self.total_shares)?;

        let usd = usd_for_shares(request.shares, ratio)?;
        let gross = principal_for_withdraw(usd, price)?;
        let (net, fee) = split_fee(gross, self.config.withdraw_fee_bps)?;
        if net == 0 {
            return Err(VaultError::ZeroAmount("withdraw payout"));
        }
        if net < request.expected_principal || net > max_principal {
            return Err(VaultError::SlippageExceeded {
                actual: net,
                min: request.expected_principal,
                max: max_principal,
            });
        }
        if gross > self.free_principal {
            return Err(VaultError::InsufficientLiquidity {
                needed: gross,
                available: self.free_principal,
            });
        }
        let free_principal = self.free_principal - gross;
        let principal_after = usd_value(free_principal, price)?;
        let total_shares = self
            .total_shares
            .checked_sub(request.shares)
            .ok_or(VaultError::ArithmeticOverflow("total shares"))?;
        let fees_collected = self
            .fees_collected
            .checked_add(fee)
            .ok_or(VaultError::ArithmeticOverflow("fees collected"))?;

        // Commit.
        self.ledger.remove_withdraw(request_id);
        self.free_principal = free_principal;
        self.total_shares = total_shares;
        self.fees_collected = fees_collected;
        let principal = self.principal.clone();
        self.valuations.update(&principal, principal_after, clock.now)?;
        if let Some(account) = self.receipts.get_mut(&request.receipt_id) {
            account.shares -= request.shares;
            account.pending_withdraw_shares = 0;
            account.status = ReceiptStatus::Idle;
            account.total_withdrawn = account.total_withdrawn.saturating_add(net);
        }

        info!(
            vault = %self.id,
            request = %request_id,
            recipient = %request.requester,
            shares = request.shares,
            amount = net,
            fee,
            "withdraw executed"
        );
        self.events.push(VaultEvent::ValueUpdated {
            asset: principal,
            usd_value: principal_after,
            at: clock.now,
        });
        self.events.push(VaultEvent::WithdrawExecuted {
            request: request_id,
            recipient: request.requester.clone(),
            shares_burned: request.shares,
            amount: net,
            fee,
        });
        Ok(WithdrawExecution {
            request_id,
            receipt_id: request.receipt_id,
            payout: Payout {
                recipient: request.requester,
                amount: net,
            },
            fee,
            shares_burned: request.shares,
        })
    }
}
