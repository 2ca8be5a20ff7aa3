#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::fmt;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;

use caricash_lifecycle::JournalState;
use caricash_lifecycle::LifecycleError;
use caricash_lifecycle::OverdraftState;
use caricash_money::Amount;
use caricash_money::Currency;
use caricash_money::MoneyError;
use caricash_money::canonical_json;
use caricash_money::sha256_hex;

mod engine;
mod store;
pub mod templates;

pub use engine::PostingEngine;
pub use engine::PostingEngineConfig;
pub use store::InMemoryJournalStore;
pub use store::JournalStore;

pub type AccountId = String;
pub type JournalId = String;
pub type LineId = String;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("journal does not balance: debits {debits} credits {credits}")]
    Unbalanced { debits: Amount, credits: Amount },
    #[error("cross-currency leg: journal is {expected}, account {account_id} is {found}")]
    CrossCurrency {
        expected: Currency,
        found: Currency,
        account_id: AccountId,
    },
    #[error("insufficient funds on {account_id}: requested {requested}, available {available}")]
    InsufficientFunds {
        account_id: AccountId,
        requested: Amount,
        available: Amount,
    },
    #[error("idempotency key was reused with a different payload")]
    DuplicateIdempotencyConflict,
    #[error("request with this idempotency key is already in flight")]
    IdempotencyInProgress,
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    InvalidTransition(#[from] LifecycleError),
    #[error("posting queue for {domain_key} is full, retry later")]
    Backpressure { domain_key: String },
    #[error(transparent)]
    Money(#[from] MoneyError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Transient faults a client may retry with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::Backpressure { .. } | LedgerError::IdempotencyInProgress
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OwnerType {
    Customer,
    Agent,
    Merchant,
    Staff,
    Store,
    System,
    Treasury,
}

impl OwnerType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OwnerType::Customer => "CUSTOMER",
            OwnerType::Agent => "AGENT",
            OwnerType::Merchant => "MERCHANT",
            OwnerType::Staff => "STAFF",
            OwnerType::Store => "STORE",
            OwnerType::System => "SYSTEM",
            OwnerType::Treasury => "TREASURY",
        }
    }
}

impl fmt::Display for OwnerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountType {
    Wallet,
    Fee,
    Suspense,
    CommissionsPayable,
    TaxPayable,
    HoldbackReserve,
    Clearing,
    BankPool,
}

impl AccountType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AccountType::Wallet => "WALLET",
            AccountType::Fee => "FEE",
            AccountType::Suspense => "SUSPENSE",
            AccountType::CommissionsPayable => "COMMISSIONS_PAYABLE",
            AccountType::TaxPayable => "TAX_PAYABLE",
            AccountType::HoldbackReserve => "HOLDBACK_RESERVE",
            AccountType::Clearing => "CLEARING",
            AccountType::BankPool => "BANK_POOL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxnType {
    Deposit,
    Withdrawal,
    P2p,
    Payment,
    B2b,
    Reversal,
    Adjustment,
    SettlementFee,
    CommissionSplit,
    TaxWithholding,
    HoldbackReserve,
    HoldbackRelease,
    RoundingAdjustment,
    SuspenseFunding,
}

impl TxnType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TxnType::Deposit => "DEPOSIT",
            TxnType::Withdrawal => "WITHDRAWAL",
            TxnType::P2p => "P2P",
            TxnType::Payment => "PAYMENT",
            TxnType::B2b => "B2B",
            TxnType::Reversal => "REVERSAL",
            TxnType::Adjustment => "ADJUSTMENT",
            TxnType::SettlementFee => "SETTLEMENT_FEE",
            TxnType::CommissionSplit => "COMMISSION_SPLIT",
            TxnType::TaxWithholding => "TAX_WITHHOLDING",
            TxnType::HoldbackReserve => "HOLDBACK_RESERVE",
            TxnType::HoldbackRelease => "HOLDBACK_RELEASE",
            TxnType::RoundingAdjustment => "ROUNDING_ADJUSTMENT",
            TxnType::SuspenseFunding => "SUSPENSE_FUNDING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntrySide {
    #[serde(rename = "DR")]
    Debit,
    #[serde(rename = "CR")]
    Credit,
}

impl EntrySide {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EntrySide::Debit => "DR",
            EntrySide::Credit => "CR",
        }
    }

    #[must_use]
    pub fn flipped(self) -> Self {
        match self {
            EntrySide::Debit => EntrySide::Credit,
            EntrySide::Credit => EntrySide::Debit,
        }
    }
}

/// Partition key for the posting engine's single-writer serialization.
/// All accounts written by one journal must live under one key; cross-wallet
/// transfers route through a clearing account owned by the shared key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainKey(String);

impl DomainKey {
    #[must_use]
    pub fn wallet(owner_type: OwnerType, owner_id: &str, currency: Currency) -> Self {
        Self(format!("wallet:{owner_type}:{owner_id}:{currency}"))
    }

    #[must_use]
    pub fn ops(purpose: &str, currency: Currency) -> Self {
        Self(format!("ops:{purpose}:{currency}"))
    }

    #[must_use]
    pub fn singleton() -> Self {
        Self("singleton".into())
    }

    /// Rebuilds a key from its stored string form, e.g. when a reversal must
    /// post under the same key as the original journal.
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DomainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a ledger account: either the stored identifier, or the owner
/// tuple for lazy creation on first use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AccountRef {
    Id { account_id: AccountId },
    Owner {
        owner_type: OwnerType,
        owner_id: String,
        account_type: AccountType,
    },
}

impl AccountRef {
    #[must_use]
    pub fn id(account_id: impl Into<AccountId>) -> Self {
        AccountRef::Id {
            account_id: account_id.into(),
        }
    }

    #[must_use]
    pub fn owner(owner_type: OwnerType, owner_id: impl Into<String>, account_type: AccountType) -> Self {
        AccountRef::Owner {
            owner_type,
            owner_id: owner_id.into(),
            account_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub id: AccountId,
    pub owner_type: OwnerType,
    pub owner_id: String,
    pub account_type: AccountType,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
}

impl LedgerAccount {
    /// Deterministic identifier for the unique owner tuple. Accounts are
    /// created lazily on first reference and never deleted.
    #[must_use]
    pub fn derive_id(
        owner_type: OwnerType,
        owner_id: &str,
        account_type: AccountType,
        currency: Currency,
    ) -> AccountId {
        format!(
            "acct:{owner_type}:{owner_id}:{}:{currency}",
            account_type.as_str()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEntry {
    pub account: AccountRef,
    pub side: EntrySide,
    pub amount: Amount,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostCommand {
    pub idempotency_key: String,
    pub correlation_id: String,
    pub txn_type: TxnType,
    pub currency: Currency,
    pub entries: Vec<CommandEntry>,
    pub description: String,
    pub actor_type: String,
    pub actor_id: String,
}

impl PostCommand {
    pub fn validate(&self) -> LedgerResult<()> {
        if self.idempotency_key.trim().is_empty() {
            return Err(LedgerError::Validation(
                "idempotency_key must be provided".into(),
            ));
        }
        if self.entries.is_empty() {
            return Err(LedgerError::Validation(
                "a journal needs at least one debit and one credit".into(),
            ));
        }
        for entry in &self.entries {
            if !entry.amount.is_positive() {
                return Err(LedgerError::Validation(format!(
                    "entry amounts must be positive, got {}",
                    entry.amount
                )));
            }
        }
        Ok(())
    }

    /// Body used for the payload hash: the command with the transport-level
    /// correlation id removed, so a client retry with a fresh correlation id
    /// still replays.
    pub fn payload_value(&self) -> LedgerResult<serde_json::Value> {
        let mut value = serde_json::to_value(self)
            .map_err(|err| LedgerError::Internal(format!("command encoding failed: {err}")))?;
        if let Some(map) = value.as_object_mut() {
            map.remove("correlation_id");
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerJournal {
    pub id: JournalId,
    pub domain_key: String,
    pub txn_type: TxnType,
    pub currency: Currency,
    pub correlation_id: String,
    pub idempotency_key: String,
    pub scope_hash: String,
    pub payload_hash: String,
    pub state: JournalState,
    pub prev_hash: String,
    pub journal_hash: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerLine {
    pub id: LineId,
    pub journal_id: JournalId,
    pub account_id: AccountId,
    pub side: EntrySide,
    pub amount: Amount,
    pub description: String,
}

/// Materialized balance view. Kept current by the posting engine but never
/// treated as authoritative; reconciliation diffs it against the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub account_id: AccountId,
    pub actual_balance: Amount,
    pub hold_amount: Amount,
    pub pending_credits: Amount,
    pub last_journal_id: Option<JournalId>,
    pub currency: Currency,
    pub updated_at: DateTime<Utc>,
}

impl AccountBalance {
    #[must_use]
    pub fn available_balance(&self) -> Amount {
        self.actual_balance
            .checked_sub(self.hold_amount)
            .unwrap_or(self.actual_balance)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverdraftFacility {
    pub id: String,
    pub account_id: AccountId,
    pub limit_amount: Amount,
    pub state: OverdraftState,
    pub requested_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostedBalance {
    pub account_id: AccountId,
    pub actual_balance: Amount,
    pub available_balance: Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostReceipt {
    pub journal_id: JournalId,
    pub journal_hash: String,
    pub created_at: DateTime<Utc>,
    pub balances: Vec<PostedBalance>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainErrorKind {
    ContentMismatch,
    PrevHashMismatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainError {
    pub journal_id: JournalId,
    pub kind: ChainErrorKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub ok: bool,
    pub errors: Vec<ChainError>,
}

/// Hash input for one journal: id, currency, txn type, and the lines sorted
/// by `(account_id, side)` so the digest is independent of input ordering.
#[must_use]
pub fn compute_journal_hash(
    prev_hash: &str,
    journal_id: &str,
    currency: Currency,
    txn_type: TxnType,
    lines: &[LedgerLine],
) -> String {
    let mut sorted: Vec<&LedgerLine> = lines.iter().collect();
    sorted.sort_by(|a, b| {
        a.account_id
            .cmp(&b.account_id)
            .then_with(|| a.side.as_str().cmp(b.side.as_str()))
    });
    let content = json!({
        "id": journal_id,
        "currency": currency,
        "txn_type": txn_type,
        "lines": sorted
            .iter()
            .map(|line| {
                json!({
                    "account_id": line.account_id,
                    "side": line.side.as_str(),
                    "amount": line.amount,
                    "description": line.description,
                })
            })
            .collect::<Vec<_>>(),
    });
    sha256_hex(format!("{prev_hash}{}", canonical_json(&content)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn amount(minor: i64) -> Amount {
        Amount::from_minor(minor).expect("amount")
    }

    fn line(id: &str, account: &str, side: EntrySide, minor: i64) -> LedgerLine {
        LedgerLine {
            id: id.into(),
            journal_id: "j-1".into(),
            account_id: account.into(),
            side,
            amount: amount(minor),
            description: "test".into(),
        }
    }

    #[test]
    fn journal_hash_ignores_line_input_order() {
        let forward = vec![
            line("1", "acct:a", EntrySide::Debit, 1_000),
            line("2", "acct:b", EntrySide::Credit, 1_000),
        ];
        let reversed = vec![
            line("2", "acct:b", EntrySide::Credit, 1_000),
            line("1", "acct:a", EntrySide::Debit, 1_000),
        ];

        let a = compute_journal_hash("", "j-1", Currency::Bbd, TxnType::Deposit, &forward);
        let b = compute_journal_hash("", "j-1", Currency::Bbd, TxnType::Deposit, &reversed);
        assert_eq!(a, b);
    }

    #[test]
    fn journal_hash_covers_amounts_and_linkage() {
        let lines = vec![
            line("1", "acct:a", EntrySide::Debit, 1_000),
            line("2", "acct:b", EntrySide::Credit, 1_000),
        ];
        let base = compute_journal_hash("", "j-1", Currency::Bbd, TxnType::Deposit, &lines);

        let mut tampered = lines.clone();
        tampered[0].amount = amount(1_001);
        let changed = compute_journal_hash("", "j-1", Currency::Bbd, TxnType::Deposit, &tampered);
        assert_ne!(base, changed);

        let linked = compute_journal_hash(&base, "j-1", Currency::Bbd, TxnType::Deposit, &lines);
        assert_ne!(base, linked);
    }

    #[test]
    fn payload_value_drops_correlation_id() {
        let command = PostCommand {
            idempotency_key: "key-1".into(),
            correlation_id: "corr-1".into(),
            txn_type: TxnType::Deposit,
            currency: Currency::Bbd,
            entries: vec![CommandEntry {
                account: AccountRef::owner(OwnerType::Customer, "c-1", AccountType::Wallet),
                side: EntrySide::Credit,
                amount: amount(100),
                description: "credit".into(),
            }],
            description: "deposit".into(),
            actor_type: "CUSTOMER".into(),
            actor_id: "c-1".into(),
        };

        let value = command.payload_value().expect("payload");
        assert!(value.get("correlation_id").is_none());
        assert_eq!(value.get("idempotency_key"), Some(&json!("key-1")));

        let mut retried = command;
        retried.correlation_id = "corr-2".into();
        assert_eq!(
            caricash_money::payload_hash(&value),
            caricash_money::payload_hash(&retried.payload_value().expect("payload"))
        );
    }

    #[test]
    fn command_validation_rejects_empty_and_non_positive() {
        let mut command = PostCommand {
            idempotency_key: "key-1".into(),
            correlation_id: "corr-1".into(),
            txn_type: TxnType::Deposit,
            currency: Currency::Bbd,
            entries: Vec::new(),
            description: "deposit".into(),
            actor_type: "CUSTOMER".into(),
            actor_id: "c-1".into(),
        };
        assert!(matches!(
            command.validate(),
            Err(LedgerError::Validation(_))
        ));

        command.entries.push(CommandEntry {
            account: AccountRef::id("acct:x"),
            side: EntrySide::Debit,
            amount: Amount::ZERO,
            description: "zero".into(),
        });
        assert!(matches!(
            command.validate(),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn domain_keys_have_canonical_shapes() {
        assert_eq!(
            DomainKey::wallet(OwnerType::Customer, "c-9", Currency::Bbd).as_str(),
            "wallet:CUSTOMER:c-9:BBD"
        );
        assert_eq!(
            DomainKey::ops("suspense", Currency::Usd).as_str(),
            "ops:suspense:USD"
        );
        assert_eq!(DomainKey::singleton().as_str(), "singleton");
    }

    #[test]
    fn account_ids_are_deterministic() {
        let id = LedgerAccount::derive_id(
            OwnerType::Merchant,
            "m-1",
            AccountType::HoldbackReserve,
            Currency::Usd,
        );
        assert_eq!(id, "acct:MERCHANT:m-1:HOLDBACK_RESERVE:USD");
    }
}
