//! Side-effect handlers registered on the approval workflow. Each posts
//! through the ledger engine with a deterministic idempotency key derived
//! from the governed entity, so a re-dispatched approval can never produce
//! a second journal.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use caricash_approvals::ApprovalHandler;
use caricash_approvals::ApprovalRequest;
use caricash_approvals::ApprovalsError;
use caricash_approvals::ApprovalsResult;
use caricash_approvals::Decision;
use caricash_ledger::AccountRef;
use caricash_ledger::AccountType;
use caricash_ledger::CommandEntry;
use caricash_ledger::DomainKey;
use caricash_ledger::EntrySide;
use caricash_ledger::OwnerType;
use caricash_ledger::PostCommand;
use caricash_ledger::PostingEngine;
use caricash_ledger::TxnType;
use caricash_lifecycle::JournalState;
use caricash_lifecycle::OverdraftState;
use caricash_money::Amount;
use caricash_money::Currency;

pub const REVERSAL_REQUESTED: &str = "REVERSAL_REQUESTED";
pub const SUSPENSE_FUNDING: &str = "SUSPENSE_FUNDING";
pub const OVERDRAFT_APPROVAL: &str = "OVERDRAFT_APPROVAL";
pub const MERCHANT_WITHDRAWAL: &str = "MERCHANT_WITHDRAWAL";

fn payload_str(request: &ApprovalRequest, field: &str) -> ApprovalsResult<String> {
    request
        .payload
        .get(field)
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| ApprovalsError::Validation(format!("payload is missing {field}")))
}

fn payload_amount(request: &ApprovalRequest, field: &str) -> ApprovalsResult<Amount> {
    let raw = payload_str(request, field)?;
    Amount::from_str(&raw)
        .map_err(|err| ApprovalsError::Validation(format!("invalid {field}: {err}")))
}

fn payload_currency(request: &ApprovalRequest) -> ApprovalsResult<Currency> {
    let raw = payload_str(request, "currency")?;
    Currency::from_str(&raw)
        .map_err(|err| ApprovalsError::Validation(format!("invalid currency: {err}")))
}

fn approver_of(request: &ApprovalRequest) -> String {
    request
        .decisions
        .iter()
        .rev()
        .find(|decision| decision.decision == Decision::Approve)
        .map(|decision| decision.decider_id.clone())
        .unwrap_or_else(|| "system".into())
}

/// Builds the compensating journal for an approved reversal: every line of
/// the original with its side flipped, posted under the original's domain
/// key. The idempotency key is derived from the original's key, making the
/// reversal itself replay-safe.
pub struct ReversalHandler {
    ledger: Arc<PostingEngine>,
}

impl ReversalHandler {
    #[must_use]
    pub fn new(ledger: Arc<PostingEngine>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl ApprovalHandler for ReversalHandler {
    fn label(&self) -> &str {
        "ledger-reversal"
    }

    async fn on_approve(&self, request: &ApprovalRequest) -> ApprovalsResult<serde_json::Value> {
        let journal_id = payload_str(request, "journal_id")?;
        let store = self.ledger.journal_store();
        let journal = store
            .journal(&journal_id)
            .await
            .map_err(|err| ApprovalsError::Handler(err.to_string()))?;
        let lines = store
            .lines(&journal_id)
            .await
            .map_err(|err| ApprovalsError::Handler(err.to_string()))?;

        let entries: Vec<CommandEntry> = lines
            .iter()
            .map(|line| CommandEntry {
                account: AccountRef::id(line.account_id.clone()),
                side: line.side.flipped(),
                amount: line.amount,
                description: format!("reversal of {}", line.id),
            })
            .collect();

        let command = PostCommand {
            idempotency_key: format!("reversal:{}", journal.idempotency_key),
            correlation_id: request.correlation_id.clone(),
            txn_type: TxnType::Reversal,
            currency: journal.currency,
            entries,
            description: format!("reversal of journal {journal_id}"),
            actor_type: "STAFF".into(),
            actor_id: approver_of(request),
        };

        let receipt = self
            .ledger
            .post(&DomainKey::from_raw(journal.domain_key.clone()), command)
            .await
            .map_err(|err| ApprovalsError::Handler(err.to_string()))?;

        if journal.state != JournalState::Reversed {
            self.ledger
                .transition_journal(&journal_id, JournalState::Reversed)
                .await
                .map_err(|err| ApprovalsError::Handler(err.to_string()))?;
        }

        info!(
            original = %journal_id,
            reversal = %receipt.journal_id,
            "reversal journal posted"
        );
        Ok(json!({
            "reversal_journal_id": receipt.journal_id,
            "journal_hash": receipt.journal_hash,
        }))
    }
}

/// Manual suspense funding: treasury money moved into the system suspense
/// account for the requested currency.
pub struct SuspenseFundingHandler {
    ledger: Arc<PostingEngine>,
}

impl SuspenseFundingHandler {
    #[must_use]
    pub fn new(ledger: Arc<PostingEngine>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl ApprovalHandler for SuspenseFundingHandler {
    fn label(&self) -> &str {
        "suspense-funding"
    }

    async fn on_approve(&self, request: &ApprovalRequest) -> ApprovalsResult<serde_json::Value> {
        let currency = payload_currency(request)?;
        let amount = payload_amount(request, "amount")?;

        let command = PostCommand {
            idempotency_key: format!("suspense:{}", request.id),
            correlation_id: request.correlation_id.clone(),
            txn_type: TxnType::SuspenseFunding,
            currency,
            entries: vec![
                CommandEntry {
                    account: AccountRef::owner(OwnerType::Treasury, "treasury", AccountType::Suspense),
                    side: EntrySide::Debit,
                    amount,
                    description: "treasury suspense funding".into(),
                },
                CommandEntry {
                    account: AccountRef::owner(OwnerType::System, "suspense", AccountType::Suspense),
                    side: EntrySide::Credit,
                    amount,
                    description: "system suspense funding".into(),
                },
            ],
            description: "manual suspense funding".into(),
            actor_type: "STAFF".into(),
            actor_id: approver_of(request),
        };

        let receipt = self
            .ledger
            .post(&DomainKey::ops("suspense", currency), command)
            .await
            .map_err(|err| ApprovalsError::Handler(err.to_string()))?;
        Ok(json!({"journal_id": receipt.journal_id}))
    }
}

/// Activates an overdraft facility once the request clears maker-checker.
pub struct OverdraftApprovalHandler {
    ledger: Arc<PostingEngine>,
}

impl OverdraftApprovalHandler {
    #[must_use]
    pub fn new(ledger: Arc<PostingEngine>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl ApprovalHandler for OverdraftApprovalHandler {
    fn label(&self) -> &str {
        "overdraft-activation"
    }

    async fn on_approve(&self, request: &ApprovalRequest) -> ApprovalsResult<serde_json::Value> {
        let facility_id = payload_str(request, "facility_id")?;
        let approver = approver_of(request);

        let facility = self
            .ledger
            .overdraft(&facility_id)
            .await
            .map_err(|err| ApprovalsError::Handler(err.to_string()))?;
        if facility.state == OverdraftState::Active {
            return Ok(json!({"facility_id": facility.id, "state": facility.state}));
        }

        self.ledger
            .transition_overdraft(&facility_id, OverdraftState::Approved, &approver)
            .await
            .map_err(|err| ApprovalsError::Handler(err.to_string()))?;
        let active = self
            .ledger
            .transition_overdraft(&facility_id, OverdraftState::Active, &approver)
            .await
            .map_err(|err| ApprovalsError::Handler(err.to_string()))?;
        Ok(json!({"facility_id": active.id, "state": active.state}))
    }

    async fn on_reject(&self, request: &ApprovalRequest) -> ApprovalsResult<()> {
        let facility_id = payload_str(request, "facility_id")?;
        self.ledger
            .transition_overdraft(&facility_id, OverdraftState::Rejected, &approver_of(request))
            .await
            .map_err(|err| ApprovalsError::Handler(err.to_string()))?;
        Ok(())
    }
}

/// Merchant withdrawal to the outbound clearing account.
pub struct MerchantWithdrawalHandler {
    ledger: Arc<PostingEngine>,
}

impl MerchantWithdrawalHandler {
    #[must_use]
    pub fn new(ledger: Arc<PostingEngine>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl ApprovalHandler for MerchantWithdrawalHandler {
    fn label(&self) -> &str {
        "merchant-withdrawal"
    }

    async fn on_approve(&self, request: &ApprovalRequest) -> ApprovalsResult<serde_json::Value> {
        let merchant_id = payload_str(request, "merchant_id")?;
        let currency = payload_currency(request)?;
        let amount = payload_amount(request, "amount")?;

        let command = PostCommand {
            idempotency_key: format!("merchant-withdrawal:{}", request.id),
            correlation_id: request.correlation_id.clone(),
            txn_type: TxnType::Withdrawal,
            currency,
            entries: vec![
                CommandEntry {
                    account: AccountRef::owner(OwnerType::Merchant, &merchant_id, AccountType::Wallet),
                    side: EntrySide::Debit,
                    amount,
                    description: "merchant withdrawal".into(),
                },
                CommandEntry {
                    account: AccountRef::owner(
                        OwnerType::System,
                        "clearing-outbound",
                        AccountType::Clearing,
                    ),
                    side: EntrySide::Credit,
                    amount,
                    description: "outbound clearing".into(),
                },
            ],
            description: format!("withdrawal for merchant {merchant_id}"),
            actor_type: "MERCHANT".into(),
            actor_id: merchant_id.clone(),
        };

        let receipt = self
            .ledger
            .post(
                &DomainKey::wallet(OwnerType::Merchant, &merchant_id, currency),
                command,
            )
            .await
            .map_err(|err| ApprovalsError::Handler(err.to_string()))?;
        Ok(json!({"journal_id": receipt.journal_id}))
    }
}
