use std::collections::HashMap;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use tokio::sync::RwLock;

use caricash_lifecycle::JournalState;
use caricash_lifecycle::validate as validate_transition;

use crate::AccountId;
use crate::ChainError;
use crate::ChainErrorKind;
use crate::ChainVerification;
use crate::JournalId;
use crate::LedgerError;
use crate::LedgerJournal;
use crate::LedgerLine;
use crate::LedgerResult;
use crate::compute_journal_hash;

/// Append-only journal store. Rows are inserted exactly once; the only
/// mutable field is the lifecycle state, and that moves only through the
/// declared transitions. There is deliberately no update or delete surface.
#[async_trait]
pub trait JournalStore: Send + Sync {
    /// Appends a journal with its lines. Called only by the posting engine
    /// inside the domain key's serialized section.
    async fn append(&self, journal: LedgerJournal, lines: Vec<LedgerLine>) -> LedgerResult<()>;

    /// Hash of the most recent journal for the domain key, or the empty
    /// string for a fresh chain.
    async fn last_hash(&self, domain_key: &str) -> LedgerResult<String>;

    async fn journal(&self, journal_id: &JournalId) -> LedgerResult<LedgerJournal>;

    async fn lines(&self, journal_id: &JournalId) -> LedgerResult<Vec<LedgerLine>>;

    /// Journals created inside the window, in append order.
    async fn journals_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> LedgerResult<Vec<LedgerJournal>>;

    /// Every line ever posted to the account, in append order. This is the
    /// authoritative input for balance reconciliation.
    async fn account_activity(&self, account_id: &AccountId) -> LedgerResult<Vec<LedgerLine>>;

    /// Lifecycle-guarded state change; the journal content itself is
    /// immutable and the hash does not cover the state column.
    async fn set_state(&self, journal_id: &JournalId, to: JournalState)
    -> LedgerResult<LedgerJournal>;

    /// Recomputes every journal hash in the window and checks prev-hash
    /// linkage per domain key.
    async fn verify_chain(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> LedgerResult<ChainVerification>;
}

#[derive(Default)]
struct StoreState {
    journals: Vec<LedgerJournal>,
    index: HashMap<JournalId, usize>,
    lines: HashMap<JournalId, Vec<LedgerLine>>,
    last_hash_by_key: HashMap<String, String>,
}

#[derive(Default)]
pub struct InMemoryJournalStore {
    state: RwLock<StoreState>,
}

impl InMemoryJournalStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Test-only tamper hook used to prove that verification catches an
    /// in-place mutation. Not part of the service surface.
    #[cfg(test)]
    async fn corrupt_line_amount(&self, journal_id: &JournalId, line_index: usize, minor: i64) {
        let mut state = self.state.write().await;
        if let Some(lines) = state.lines.get_mut(journal_id)
            && let Some(line) = lines.get_mut(line_index)
        {
            line.amount = caricash_money::Amount::from_minor(minor).expect("tamper amount");
        }
    }
}

#[async_trait]
impl JournalStore for InMemoryJournalStore {
    async fn append(&self, journal: LedgerJournal, lines: Vec<LedgerLine>) -> LedgerResult<()> {
        let mut state = self.state.write().await;
        if state.index.contains_key(&journal.id) {
            return Err(LedgerError::Internal(format!(
                "journal {} already appended",
                journal.id
            )));
        }
        let expected_prev = state
            .last_hash_by_key
            .get(&journal.domain_key)
            .cloned()
            .unwrap_or_default();
        if journal.prev_hash != expected_prev {
            return Err(LedgerError::Internal(format!(
                "journal {} breaks the chain for {}",
                journal.id, journal.domain_key
            )));
        }

        state
            .last_hash_by_key
            .insert(journal.domain_key.clone(), journal.journal_hash.clone());
        let journal_index = state.journals.len();
        state.index.insert(journal.id.clone(), journal_index);
        state.lines.insert(journal.id.clone(), lines);
        state.journals.push(journal);
        Ok(())
    }

    async fn last_hash(&self, domain_key: &str) -> LedgerResult<String> {
        let state = self.state.read().await;
        Ok(state
            .last_hash_by_key
            .get(domain_key)
            .cloned()
            .unwrap_or_default())
    }

    async fn journal(&self, journal_id: &JournalId) -> LedgerResult<LedgerJournal> {
        let state = self.state.read().await;
        state
            .index
            .get(journal_id)
            .and_then(|position| state.journals.get(*position))
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("journal {journal_id}")))
    }

    async fn lines(&self, journal_id: &JournalId) -> LedgerResult<Vec<LedgerLine>> {
        let state = self.state.read().await;
        state
            .lines
            .get(journal_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("journal {journal_id}")))
    }

    async fn journals_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> LedgerResult<Vec<LedgerJournal>> {
        let state = self.state.read().await;
        Ok(state
            .journals
            .iter()
            .filter(|journal| journal.created_at >= from && journal.created_at <= to)
            .cloned()
            .collect())
    }

    async fn account_activity(&self, account_id: &AccountId) -> LedgerResult<Vec<LedgerLine>> {
        let state = self.state.read().await;
        let mut activity = Vec::new();
        for journal in &state.journals {
            if let Some(lines) = state.lines.get(&journal.id) {
                activity.extend(
                    lines
                        .iter()
                        .filter(|line| &line.account_id == account_id)
                        .cloned(),
                );
            }
        }
        Ok(activity)
    }

    async fn set_state(
        &self,
        journal_id: &JournalId,
        to: JournalState,
    ) -> LedgerResult<LedgerJournal> {
        let mut state = self.state.write().await;
        let position = *state
            .index
            .get(journal_id)
            .ok_or_else(|| LedgerError::NotFound(format!("journal {journal_id}")))?;
        let journal = state
            .journals
            .get_mut(position)
            .ok_or_else(|| LedgerError::Internal(format!("journal index broken at {position}")))?;
        validate_transition(journal.state, to)?;
        journal.state = to;
        Ok(journal.clone())
    }

    async fn verify_chain(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> LedgerResult<ChainVerification> {
        let state = self.state.read().await;
        let mut errors = Vec::new();
        let mut expected_prev: HashMap<&str, &str> = HashMap::new();

        for journal in &state.journals {
            let in_window = journal.created_at >= from && journal.created_at <= to;
            if in_window {
                // The sweep walks the full history, so the first journal seen
                // for a key must be its genesis with an empty prev hash.
                let expected = expected_prev
                    .get(journal.domain_key.as_str())
                    .copied()
                    .unwrap_or("");
                if journal.prev_hash != expected {
                    errors.push(ChainError {
                        journal_id: journal.id.clone(),
                        kind: ChainErrorKind::PrevHashMismatch,
                    });
                }
                let lines = state.lines.get(&journal.id).cloned().unwrap_or_default();
                let recomputed = compute_journal_hash(
                    &journal.prev_hash,
                    &journal.id,
                    journal.currency,
                    journal.txn_type,
                    &lines,
                );
                if recomputed != journal.journal_hash {
                    errors.push(ChainError {
                        journal_id: journal.id.clone(),
                        kind: ChainErrorKind::ContentMismatch,
                    });
                }
            }
            expected_prev.insert(journal.domain_key.as_str(), journal.journal_hash.as_str());
        }

        Ok(ChainVerification {
            ok: errors.is_empty(),
            errors,
        })
    }
}
