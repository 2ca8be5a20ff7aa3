#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use caricash_ledger::AccountBalance;
use caricash_ledger::AccountId;
use caricash_ledger::AccountType;
use caricash_ledger::EntrySide;
use caricash_ledger::JournalId;
use caricash_ledger::LedgerError;
use caricash_ledger::PostingEngine;
use caricash_lifecycle::LifecycleError;
use caricash_lifecycle::ReconciliationCaseState;
use caricash_lifecycle::StatementEntryState;
use caricash_lifecycle::validate as validate_transition;
use caricash_money::Amount;
use caricash_statements::ExternalTransfer;
use caricash_statements::StatementEntry;

pub type RunId = String;
pub type FindingId = String;
pub type ReconCaseId = String;

pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    InvalidTransition(#[from] LifecycleError),
    #[error(transparent)]
    Money(#[from] caricash_money::MoneyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Severity by absolute discrepancy in minor units.
#[must_use]
pub fn severity_for(discrepancy: Amount) -> Severity {
    let magnitude = discrepancy.minor().abs();
    if magnitude >= 100_000 {
        Severity::Critical
    } else if magnitude >= 10_000 {
        Severity::High
    } else if magnitude >= 100 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FindingKind {
    BalanceMismatch,
    Suspense,
    Integrity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationFinding {
    pub id: FindingId,
    pub run_id: RunId,
    pub kind: FindingKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal_id: Option<JournalId>,
    pub computed_balance: Amount,
    pub materialized_balance: Amount,
    pub discrepancy: Amount,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRun {
    pub id: RunId,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub status: RunStatus,
    pub findings_count: usize,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationCase {
    pub id: ReconCaseId,
    pub kind: FindingKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
    pub status: ReconciliationCaseState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_method: Option<MatchMethod>,
    pub finding_ids: Vec<FindingId>,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchMethod {
    ProviderId,
    ClientRef,
    AmountTime,
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchConfidence {
    Medium,
    MediumHigh,
    High,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineMatchOutcome {
    Matched {
        method: MatchMethod,
        confidence: MatchConfidence,
        transfer_id: String,
    },
    /// A reference-level hit whose currency disagrees; the transfer must be
    /// parked as a currency anomaly, never matched.
    CurrencyAnomaly { transfer_id: String },
    Unmatched,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchMatchOutcome {
    Matched {
        confidence: MatchConfidence,
        transfer_ids: Vec<String>,
    },
    PartialMatched { shortfall: Amount },
    Disputed { excess: Amount },
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileConfig {
    /// Suspense balances at or beyond this magnitude raise a CRITICAL
    /// finding even though any non-zero balance is already suspect.
    pub suspense_threshold: Amount,
    pub stale_entry_age: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            suspense_threshold: Amount::ZERO,
            stale_entry_age: Duration::hours(24),
        }
    }
}

/// Read-side view of the materialized balances. The posting engine is the
/// production source; tests substitute drifted views to prove findings are
/// raised without any correction happening.
#[async_trait]
pub trait BalanceViewSource: Send + Sync {
    async fn balances(&self) -> Vec<AccountBalance>;
}

pub struct LedgerBalanceView {
    engine: Arc<PostingEngine>,
}

impl LedgerBalanceView {
    #[must_use]
    pub fn new(engine: Arc<PostingEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl BalanceViewSource for LedgerBalanceView {
    async fn balances(&self) -> Vec<AccountBalance> {
        self.engine.balances_snapshot().await
    }
}

/// Periodic ledger-vs-view diffing. The engine only ever reads: findings
/// open cases for an operator, nothing is auto-corrected.
pub struct ReconciliationEngine {
    ledger: Arc<PostingEngine>,
    view: Arc<dyn BalanceViewSource>,
    config: ReconcileConfig,
    runs: RwLock<Vec<ReconciliationRun>>,
    findings: RwLock<Vec<ReconciliationFinding>>,
    cases: RwLock<HashMap<(FindingKind, Option<AccountId>), ReconciliationCase>>,
}

impl ReconciliationEngine {
    pub fn new(ledger: Arc<PostingEngine>) -> Self {
        let view = Arc::new(LedgerBalanceView::new(ledger.clone()));
        Self::with_view(ledger, view, ReconcileConfig::default())
    }

    pub fn with_view(
        ledger: Arc<PostingEngine>,
        view: Arc<dyn BalanceViewSource>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            ledger,
            view,
            config,
            runs: RwLock::new(Vec::new()),
            findings: RwLock::new(Vec::new()),
            cases: RwLock::new(HashMap::new()),
        }
    }

    pub async fn runs(&self) -> Vec<ReconciliationRun> {
        self.runs.read().await.clone()
    }

    pub async fn findings(&self, run_id: &RunId) -> Vec<ReconciliationFinding> {
        self.findings
            .read()
            .await
            .iter()
            .filter(|finding| &finding.run_id == run_id)
            .cloned()
            .collect()
    }

    pub async fn cases(&self) -> Vec<ReconciliationCase> {
        let mut cases: Vec<ReconciliationCase> = self.cases.read().await.values().cloned().collect();
        cases.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then_with(|| a.id.cmp(&b.id)));
        cases
    }

    pub async fn case_transition(
        &self,
        case_id: &ReconCaseId,
        to: ReconciliationCaseState,
    ) -> ReconcileResult<ReconciliationCase> {
        let mut cases = self.cases.write().await;
        let case = cases
            .values_mut()
            .find(|case| &case.id == case_id)
            .ok_or_else(|| ReconcileError::NotFound(format!("case {case_id}")))?;
        validate_transition(case.status, to)?;
        case.status = to;
        case.updated_at = Utc::now();
        Ok(case.clone())
    }

    /// One reconciliation pass over the window: authoritative balances from
    /// the journal lines, the materialized view as the suspect, suspense
    /// sweep, and hash-chain verification. Each finding opens or refreshes
    /// a case keyed by kind and account.
    pub async fn run(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ReconcileResult<ReconciliationRun> {
        if from > to {
            return Err(ReconcileError::Validation("window is inverted".into()));
        }
        let run_id: RunId = Uuid::new_v4().to_string();
        let store = self.ledger.journal_store();
        let mut new_findings: Vec<ReconciliationFinding> = Vec::new();

        // Accounts touched inside the window; balances computed over the
        // account's full history.
        let mut touched: BTreeMap<AccountId, ()> = BTreeMap::new();
        for journal in store.journals_between(from, to).await? {
            for line in store.lines(&journal.id).await? {
                touched.insert(line.account_id, ());
            }
        }

        let materialized: HashMap<AccountId, Amount> = self
            .view
            .balances()
            .await
            .into_iter()
            .map(|balance| (balance.account_id.clone(), balance.actual_balance))
            .collect();

        for account_id in touched.keys() {
            let computed = self.authoritative_balance(account_id).await?;
            let stored = materialized.get(account_id).copied().unwrap_or(Amount::ZERO);
            let discrepancy = computed.checked_sub(stored)?;
            if !discrepancy.is_zero() {
                new_findings.push(ReconciliationFinding {
                    id: Uuid::new_v4().to_string(),
                    run_id: run_id.clone(),
                    kind: FindingKind::BalanceMismatch,
                    account_id: Some(account_id.clone()),
                    journal_id: None,
                    computed_balance: computed,
                    materialized_balance: stored,
                    discrepancy,
                    severity: severity_for(discrepancy),
                    created_at: Utc::now(),
                });
            }
        }

        for account in self.ledger.accounts_snapshot().await {
            if account.account_type != AccountType::Suspense {
                continue;
            }
            let balance = self.authoritative_balance(&account.id).await?;
            if balance.is_zero() || balance.abs() < self.config.suspense_threshold.abs() {
                continue;
            }
            new_findings.push(ReconciliationFinding {
                id: Uuid::new_v4().to_string(),
                run_id: run_id.clone(),
                kind: FindingKind::Suspense,
                account_id: Some(account.id.clone()),
                journal_id: None,
                computed_balance: balance,
                materialized_balance: Amount::ZERO,
                discrepancy: balance,
                severity: Severity::Critical,
                created_at: Utc::now(),
            });
        }

        let verification = store.verify_chain(from, to).await?;
        for error in &verification.errors {
            warn!(journal_id = %error.journal_id, kind = ?error.kind, "hash chain mismatch");
            new_findings.push(ReconciliationFinding {
                id: Uuid::new_v4().to_string(),
                run_id: run_id.clone(),
                kind: FindingKind::Integrity,
                account_id: None,
                journal_id: Some(error.journal_id.clone()),
                computed_balance: Amount::ZERO,
                materialized_balance: Amount::ZERO,
                discrepancy: Amount::ZERO,
                severity: Severity::Critical,
                created_at: Utc::now(),
            });
        }

        self.open_or_update_cases(&new_findings).await;

        let run = ReconciliationRun {
            id: run_id,
            from,
            to,
            status: RunStatus::Completed,
            findings_count: new_findings.len(),
            finished_at: Utc::now(),
        };
        info!(
            run_id = %run.id,
            findings = run.findings_count,
            "reconciliation run finished"
        );
        self.findings.write().await.extend(new_findings);
        self.runs.write().await.push(run.clone());
        Ok(run)
    }

    /// Applies the configured staleness window to a batch of statement
    /// entries, escalating anything still unmatched.
    pub fn escalate_stale_entries(
        &self,
        entries: &mut [StatementEntry],
        now: DateTime<Utc>,
    ) -> ReconcileResult<Vec<String>> {
        StatementMatcher::escalate_stale(entries, now, self.config.stale_entry_age)
    }

    async fn authoritative_balance(&self, account_id: &AccountId) -> ReconcileResult<Amount> {
        let store = self.ledger.journal_store();
        let mut balance = Amount::ZERO;
        for line in store.account_activity(account_id).await? {
            balance = match line.side {
                EntrySide::Credit => balance.checked_add(line.amount)?,
                EntrySide::Debit => balance.checked_sub(line.amount)?,
            };
        }
        Ok(balance)
    }

    async fn open_or_update_cases(&self, findings: &[ReconciliationFinding]) {
        let mut cases = self.cases.write().await;
        let now = Utc::now();
        for finding in findings {
            let key = (finding.kind, finding.account_id.clone());
            match cases.get_mut(&key) {
                Some(case) if case.status != ReconciliationCaseState::Resolved => {
                    case.finding_ids.push(finding.id.clone());
                    case.updated_at = now;
                }
                _ => {
                    cases.insert(
                        key,
                        ReconciliationCase {
                            id: Uuid::new_v4().to_string(),
                            kind: finding.kind,
                            account_id: finding.account_id.clone(),
                            status: ReconciliationCaseState::Open,
                            match_method: None,
                            finding_ids: vec![finding.id.clone()],
                            opened_at: now,
                            updated_at: now,
                        },
                    );
                }
            }
        }
    }
}

/// Statement-to-transfer matching. Pure functions: callers apply the
/// resulting lifecycle transitions.
pub struct StatementMatcher;

impl StatementMatcher {
    /// Single-line match in strict priority order: provider reference,
    /// client reference in the description, then exact amount within a
    /// fifteen-minute window. Cross-currency pairs never match; a
    /// reference hit in the wrong currency is surfaced as an anomaly.
    #[must_use]
    pub fn match_entry(entry: &StatementEntry, candidates: &[ExternalTransfer]) -> LineMatchOutcome {
        if let Some(reference) = &entry.entry_reference {
            for transfer in candidates {
                if transfer.provider_transfer_id.as_deref() == Some(reference.as_str()) {
                    if transfer.currency != entry.currency {
                        return LineMatchOutcome::CurrencyAnomaly {
                            transfer_id: transfer.id.clone(),
                        };
                    }
                    return LineMatchOutcome::Matched {
                        method: MatchMethod::ProviderId,
                        confidence: MatchConfidence::High,
                        transfer_id: transfer.id.clone(),
                    };
                }
            }
        }

        for transfer in candidates {
            if transfer.currency == entry.currency
                && !transfer.client_reference.is_empty()
                && entry.description.contains(&transfer.client_reference)
            {
                return LineMatchOutcome::Matched {
                    method: MatchMethod::ClientRef,
                    confidence: MatchConfidence::MediumHigh,
                    transfer_id: transfer.id.clone(),
                };
            }
        }

        for transfer in candidates {
            if transfer.currency == entry.currency
                && transfer.amount == entry.amount
                && (entry.booked_at - transfer.initiated_at).abs() <= Duration::minutes(15)
            {
                return LineMatchOutcome::Matched {
                    method: MatchMethod::AmountTime,
                    confidence: MatchConfidence::Medium,
                    transfer_id: transfer.id.clone(),
                };
            }
        }

        LineMatchOutcome::Unmatched
    }

    /// Matches one statement entry against a batch of transfers settled
    /// together: an exact sum is a high-confidence batch match, a shortfall
    /// is partial, an excess is disputed.
    pub fn match_batch(
        entry: &StatementEntry,
        batch: &[ExternalTransfer],
    ) -> ReconcileResult<BatchMatchOutcome> {
        if batch.is_empty() {
            return Err(ReconcileError::Validation("batch cannot be empty".into()));
        }
        if batch.iter().any(|transfer| transfer.currency != entry.currency) {
            return Err(ReconcileError::Validation(
                "cross-currency batches are rejected".into(),
            ));
        }
        let mut sum = Amount::ZERO;
        for transfer in batch {
            sum = sum.checked_add(transfer.amount)?;
        }
        Ok(if sum == entry.amount {
            BatchMatchOutcome::Matched {
                confidence: MatchConfidence::High,
                transfer_ids: batch.iter().map(|transfer| transfer.id.clone()).collect(),
            }
        } else if sum < entry.amount {
            BatchMatchOutcome::PartialMatched {
                shortfall: entry.amount.checked_sub(sum)?,
            }
        } else {
            BatchMatchOutcome::Disputed {
                excess: sum.checked_sub(entry.amount)?,
            }
        })
    }

    /// Entries without a match past the configured age escalate for manual
    /// review. Returns the ids that were escalated.
    pub fn escalate_stale(
        entries: &mut [StatementEntry],
        now: DateTime<Utc>,
        age: Duration,
    ) -> ReconcileResult<Vec<String>> {
        let mut escalated = Vec::new();
        for entry in entries.iter_mut() {
            let stale = now - entry.booked_at >= age;
            let eligible = matches!(
                entry.state,
                StatementEntryState::New | StatementEntryState::Unmatched
            );
            if stale && eligible {
                entry.transition(StatementEntryState::Escalated).map_err(|err| {
                    ReconcileError::Validation(format!("escalation failed: {err}"))
                })?;
                escalated.push(entry.id.clone());
            }
        }
        Ok(escalated)
    }
}
