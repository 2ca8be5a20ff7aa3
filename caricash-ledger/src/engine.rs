use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use chrono::Utc;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tracing::debug;
use tracing::warn;
use ulid::Ulid;

use caricash_events::EventDraft;
use caricash_events::EventSink;
use caricash_idempotency::IdempotencyStore;
use caricash_idempotency::Lookup;
use caricash_idempotency::TtlCategory;
use caricash_lifecycle::JournalState;
use caricash_lifecycle::OverdraftState;
use caricash_lifecycle::validate as validate_transition;
use caricash_money::Amount;
use caricash_money::payload_hash;
use caricash_money::scope_hash;

use crate::AccountBalance;
use crate::AccountId;
use crate::AccountRef;
use crate::DomainKey;
use crate::EntrySide;
use crate::JournalId;
use crate::JournalStore;
use crate::LedgerAccount;
use crate::LedgerError;
use crate::LedgerJournal;
use crate::LedgerLine;
use crate::LedgerResult;
use crate::OverdraftFacility;
use crate::PostCommand;
use crate::PostReceipt;
use crate::PostedBalance;
use crate::compute_journal_hash;

#[derive(Debug, Clone, Copy)]
pub struct PostingEngineConfig {
    /// Upper bound on requests queued behind one domain key. Arrivals past
    /// the bound fail fast with a retryable error.
    pub max_queue_depth: usize,
}

impl Default for PostingEngineConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: 64,
        }
    }
}

#[derive(Default)]
struct KeySlot {
    lock: Mutex<()>,
    pending: AtomicUsize,
}

/// Serialized transaction-posting unit. Each domain key maps to one logical
/// writer: for a given key, posts execute one at a time in arrival order,
/// and a post initiated strictly before another observes its effects.
pub struct PostingEngine {
    store: Arc<dyn JournalStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    events: Arc<dyn EventSink>,
    accounts: RwLock<HashMap<AccountId, LedgerAccount>>,
    balances: RwLock<HashMap<AccountId, AccountBalance>>,
    overdrafts: RwLock<HashMap<String, OverdraftFacility>>,
    slots: Mutex<HashMap<String, Arc<KeySlot>>>,
    config: PostingEngineConfig,
}

/// Clears the in-flight idempotency marker if the posting future is dropped
/// between the marker write and the committed record.
struct MarkerGuard {
    store: Arc<dyn IdempotencyStore>,
    scope: String,
    key: String,
    armed: bool,
}

impl MarkerGuard {
    fn new(store: Arc<dyn IdempotencyStore>, scope: &str, key: &str) -> Self {
        Self {
            store,
            scope: scope.to_owned(),
            key: key.to_owned(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for MarkerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = Arc::clone(&self.store);
        let scope = std::mem::take(&mut self.scope);
        let key = std::mem::take(&mut self.key);
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move {
                let _ = store.clear_in_progress(&scope, &key).await;
            });
        }
    }
}

impl PostingEngine {
    pub fn new(
        store: Arc<dyn JournalStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self::with_config(store, idempotency, events, PostingEngineConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn JournalStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        events: Arc<dyn EventSink>,
        config: PostingEngineConfig,
    ) -> Self {
        Self {
            store,
            idempotency,
            events,
            accounts: RwLock::new(HashMap::new()),
            balances: RwLock::new(HashMap::new()),
            overdrafts: RwLock::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            config,
        }
    }

    #[must_use]
    pub fn journal_store(&self) -> Arc<dyn JournalStore> {
        Arc::clone(&self.store)
    }

    async fn key_slot(&self, domain_key: &DomainKey) -> Arc<KeySlot> {
        let mut slots = self.slots.lock().await;
        Arc::clone(
            slots
                .entry(domain_key.as_str().to_owned())
                .or_insert_with(|| Arc::new(KeySlot::default())),
        )
    }

    pub async fn post(
        &self,
        domain_key: &DomainKey,
        command: PostCommand,
    ) -> LedgerResult<PostReceipt> {
        command.validate()?;
        let scope = scope_hash(
            &command.actor_type,
            &command.actor_id,
            command.txn_type.as_str(),
            &command.idempotency_key,
        );
        let payload = payload_hash(&command.payload_value()?);

        // Replay fast-path outside the serialized section.
        if let Some(receipt) = self.replay_or_reject(&scope, &command, &payload).await? {
            return Ok(receipt);
        }

        let slot = self.key_slot(domain_key).await;
        if slot.pending.fetch_add(1, Ordering::SeqCst) >= self.config.max_queue_depth {
            slot.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(LedgerError::Backpressure {
                domain_key: domain_key.as_str().to_owned(),
            });
        }
        let _serialized = slot.lock.lock().await;
        slot.pending.fetch_sub(1, Ordering::SeqCst);

        if let Err(err) = self
            .idempotency
            .put_in_progress(&scope, &command.idempotency_key, &payload)
            .await
        {
            return match err {
                caricash_idempotency::IdempotencyError::AlreadyExists { .. } => {
                    match self.replay_or_reject(&scope, &command, &payload).await? {
                        Some(receipt) => Ok(receipt),
                        None => Err(LedgerError::IdempotencyInProgress),
                    }
                }
                other => Err(LedgerError::Internal(other.to_string())),
            };
        }
        let mut marker = MarkerGuard::new(Arc::clone(&self.idempotency), &scope, &command.idempotency_key);

        match self.execute(domain_key, &command, &scope, &payload).await {
            Ok(receipt) => {
                let result = serde_json::to_value(&receipt).map_err(|err| {
                    LedgerError::Internal(format!("receipt encoding failed: {err}"))
                })?;
                self.idempotency
                    .put_committed(
                        &scope,
                        &command.idempotency_key,
                        &payload,
                        result,
                        TtlCategory::MoneyTx,
                    )
                    .await
                    .map_err(|err| LedgerError::Internal(err.to_string()))?;
                marker.disarm();
                self.emit_posted(&command, &receipt).await;
                Ok(receipt)
            }
            Err(err) => {
                if let Err(clear_err) = self
                    .idempotency
                    .clear_in_progress(&scope, &command.idempotency_key)
                    .await
                {
                    warn!(error = %clear_err, "failed to clear in-flight idempotency marker");
                }
                marker.disarm();
                Err(err)
            }
        }
    }

    /// Returns the stored receipt for a committed replay, an error for a
    /// conflicting reuse or an in-flight duplicate, and `None` on a miss.
    async fn replay_or_reject(
        &self,
        scope: &str,
        command: &PostCommand,
        payload: &str,
    ) -> LedgerResult<Option<PostReceipt>> {
        match self
            .idempotency
            .lookup(scope, &command.idempotency_key)
            .await
            .map_err(|err| LedgerError::Internal(err.to_string()))?
        {
            Lookup::Miss => Ok(None),
            Lookup::InProgress { .. } => Err(LedgerError::IdempotencyInProgress),
            Lookup::Committed {
                payload_hash: stored,
                result,
            } => {
                if stored != payload {
                    return Err(LedgerError::DuplicateIdempotencyConflict);
                }
                debug!(idempotency_key = %command.idempotency_key, "idempotent replay");
                let receipt: PostReceipt = serde_json::from_value(result).map_err(|err| {
                    LedgerError::Internal(format!("stored receipt decoding failed: {err}"))
                })?;
                Ok(Some(receipt))
            }
        }
    }

    async fn execute(
        &self,
        domain_key: &DomainKey,
        command: &PostCommand,
        scope: &str,
        payload: &str,
    ) -> LedgerResult<PostReceipt> {
        let resolved = self.resolve_entries(command).await?;
        self.check_balanced(&resolved)?;
        self.check_funds(&resolved).await?;

        let prev_hash = self.store.last_hash(domain_key.as_str()).await?;
        let journal_id: JournalId = Ulid::new().to_string();
        let created_at = Utc::now();

        let lines: Vec<LedgerLine> = resolved
            .iter()
            .enumerate()
            .map(|(index, entry)| LedgerLine {
                id: format!("{journal_id}-{}", index + 1),
                journal_id: journal_id.clone(),
                account_id: entry.account_id.clone(),
                side: entry.side,
                amount: entry.amount,
                description: entry.description.clone(),
            })
            .collect();

        let journal_hash = compute_journal_hash(
            &prev_hash,
            &journal_id,
            command.currency,
            command.txn_type,
            &lines,
        );
        let journal = LedgerJournal {
            id: journal_id.clone(),
            domain_key: domain_key.as_str().to_owned(),
            txn_type: command.txn_type,
            currency: command.currency,
            correlation_id: command.correlation_id.clone(),
            idempotency_key: command.idempotency_key.clone(),
            scope_hash: scope.to_owned(),
            payload_hash: payload.to_owned(),
            state: JournalState::Posted,
            prev_hash,
            journal_hash: journal_hash.clone(),
            description: command.description.clone(),
            created_at,
        };

        self.store.append(journal, lines).await?;
        let balances = self.apply_to_balances(&resolved, &journal_id, command).await?;

        debug!(
            journal_id = %journal_id,
            domain_key = %domain_key,
            txn_type = command.txn_type.as_str(),
            "journal posted"
        );

        Ok(PostReceipt {
            journal_id,
            journal_hash,
            created_at,
            balances,
        })
    }

    async fn emit_posted(&self, command: &PostCommand, receipt: &PostReceipt) {
        let draft = EventDraft {
            name: "TRANSACTION_POSTED".into(),
            entity_type: "ledger_journal".into(),
            entity_id: receipt.journal_id.clone(),
            correlation_id: command.correlation_id.clone(),
            causation_id: None,
            actor_type: command.actor_type.clone(),
            actor_id: command.actor_id.clone(),
            payload: json!({
                "txn_type": command.txn_type,
                "currency": command.currency,
                "journal_hash": receipt.journal_hash,
            }),
        };
        // The journal is already committed; delivery problems are retried
        // out-of-band and never surface to the caller.
        if let Err(err) = self.events.publish(draft).await {
            warn!(journal_id = %receipt.journal_id, error = %err, "event publish failed");
        }
    }

    async fn resolve_entries(&self, command: &PostCommand) -> LedgerResult<Vec<ResolvedEntry>> {
        let mut accounts = self.accounts.write().await;
        let mut resolved = Vec::with_capacity(command.entries.len());
        for entry in &command.entries {
            let account = match &entry.account {
                AccountRef::Id { account_id } => accounts
                    .get(account_id)
                    .cloned()
                    .ok_or_else(|| LedgerError::NotFound(format!("account {account_id}")))?,
                AccountRef::Owner {
                    owner_type,
                    owner_id,
                    account_type,
                } => {
                    let id = LedgerAccount::derive_id(
                        *owner_type,
                        owner_id,
                        *account_type,
                        command.currency,
                    );
                    accounts
                        .entry(id.clone())
                        .or_insert_with(|| LedgerAccount {
                            id,
                            owner_type: *owner_type,
                            owner_id: owner_id.clone(),
                            account_type: *account_type,
                            currency: command.currency,
                            created_at: Utc::now(),
                        })
                        .clone()
                }
            };
            if account.currency != command.currency {
                return Err(LedgerError::CrossCurrency {
                    expected: command.currency,
                    found: account.currency,
                    account_id: account.id,
                });
            }
            resolved.push(ResolvedEntry {
                account_id: account.id,
                account_type: account.account_type,
                side: entry.side,
                amount: entry.amount,
                description: entry.description.clone(),
            });
        }
        Ok(resolved)
    }

    fn check_balanced(&self, entries: &[ResolvedEntry]) -> LedgerResult<()> {
        let mut debits = Amount::ZERO;
        let mut credits = Amount::ZERO;
        for entry in entries {
            match entry.side {
                EntrySide::Debit => debits = debits.checked_add(entry.amount)?,
                EntrySide::Credit => credits = credits.checked_add(entry.amount)?,
            }
        }
        if debits != credits {
            return Err(LedgerError::Unbalanced { debits, credits });
        }
        Ok(())
    }

    async fn check_funds(&self, entries: &[ResolvedEntry]) -> LedgerResult<()> {
        let mut net_debits: BTreeMap<&str, (crate::AccountType, Amount)> = BTreeMap::new();
        for entry in entries {
            let slot = net_debits
                .entry(entry.account_id.as_str())
                .or_insert((entry.account_type, Amount::ZERO));
            slot.1 = match entry.side {
                EntrySide::Debit => slot.1.checked_add(entry.amount)?,
                EntrySide::Credit => slot.1.checked_sub(entry.amount)?,
            };
        }

        let balances = self.balances.read().await;
        for (account_id, (account_type, net_debit)) in net_debits {
            if account_type != crate::AccountType::Wallet || !net_debit.is_positive() {
                continue;
            }
            let available = balances
                .get(account_id)
                .map(AccountBalance::available_balance)
                .unwrap_or(Amount::ZERO);
            let limit = self.active_overdraft_limit(account_id).await;
            let floor = Amount::ZERO.checked_sub(limit)?;
            if available.checked_sub(net_debit)? < floor {
                return Err(LedgerError::InsufficientFunds {
                    account_id: account_id.to_owned(),
                    requested: net_debit,
                    available,
                });
            }
        }
        Ok(())
    }

    async fn apply_to_balances(
        &self,
        entries: &[ResolvedEntry],
        journal_id: &JournalId,
        command: &PostCommand,
    ) -> LedgerResult<Vec<PostedBalance>> {
        let mut balances = self.balances.write().await;
        let now = Utc::now();
        let mut touched: BTreeMap<AccountId, ()> = BTreeMap::new();
        for entry in entries {
            let balance = balances
                .entry(entry.account_id.clone())
                .or_insert_with(|| AccountBalance {
                    account_id: entry.account_id.clone(),
                    actual_balance: Amount::ZERO,
                    hold_amount: Amount::ZERO,
                    pending_credits: Amount::ZERO,
                    last_journal_id: None,
                    currency: command.currency,
                    updated_at: now,
                });
            balance.actual_balance = match entry.side {
                EntrySide::Credit => balance.actual_balance.checked_add(entry.amount)?,
                EntrySide::Debit => balance.actual_balance.checked_sub(entry.amount)?,
            };
            balance.last_journal_id = Some(journal_id.clone());
            balance.updated_at = now;
            touched.insert(entry.account_id.clone(), ());
        }

        let mut posted = Vec::with_capacity(touched.len());
        for account_id in touched.into_keys() {
            if let Some(balance) = balances.get(&account_id) {
                posted.push(PostedBalance {
                    account_id,
                    actual_balance: balance.actual_balance,
                    available_balance: balance.available_balance(),
                });
            }
        }
        Ok(posted)
    }

    pub async fn account(&self, reference: &AccountRef, currency: caricash_money::Currency) -> LedgerResult<LedgerAccount> {
        let accounts = self.accounts.read().await;
        let id = match reference {
            AccountRef::Id { account_id } => account_id.clone(),
            AccountRef::Owner {
                owner_type,
                owner_id,
                account_type,
            } => LedgerAccount::derive_id(*owner_type, owner_id, *account_type, currency),
        };
        accounts
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("account {id}")))
    }

    pub async fn balance(&self, account_id: &AccountId) -> LedgerResult<AccountBalance> {
        let accounts = self.accounts.read().await;
        let account = accounts
            .get(account_id)
            .ok_or_else(|| LedgerError::NotFound(format!("account {account_id}")))?;
        let balances = self.balances.read().await;
        Ok(balances.get(account_id).cloned().unwrap_or(AccountBalance {
            account_id: account_id.clone(),
            actual_balance: Amount::ZERO,
            hold_amount: Amount::ZERO,
            pending_credits: Amount::ZERO,
            last_journal_id: None,
            currency: account.currency,
            updated_at: account.created_at,
        }))
    }

    pub async fn statement(
        &self,
        account_id: &AccountId,
        offset: usize,
        limit: usize,
    ) -> LedgerResult<Vec<LedgerLine>> {
        let activity = self.store.account_activity(account_id).await?;
        Ok(activity.into_iter().skip(offset).take(limit).collect())
    }

    pub async fn accounts_snapshot(&self) -> Vec<LedgerAccount> {
        let accounts = self.accounts.read().await;
        let mut snapshot: Vec<LedgerAccount> = accounts.values().cloned().collect();
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));
        snapshot
    }

    pub async fn balances_snapshot(&self) -> Vec<AccountBalance> {
        let balances = self.balances.read().await;
        let mut snapshot: Vec<AccountBalance> = balances.values().cloned().collect();
        snapshot.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        snapshot
    }

    pub async fn transition_journal(
        &self,
        journal_id: &JournalId,
        to: JournalState,
    ) -> LedgerResult<LedgerJournal> {
        self.store.set_state(journal_id, to).await
    }

    pub async fn apply_hold(&self, account_id: &AccountId, amount: Amount) -> LedgerResult<AccountBalance> {
        let mut balances = self.balances.write().await;
        let balance = balances
            .get_mut(account_id)
            .ok_or_else(|| LedgerError::NotFound(format!("account {account_id}")))?;
        balance.hold_amount = balance.hold_amount.checked_add(amount)?;
        balance.updated_at = Utc::now();
        Ok(balance.clone())
    }

    pub async fn release_hold(&self, account_id: &AccountId, amount: Amount) -> LedgerResult<AccountBalance> {
        let mut balances = self.balances.write().await;
        let balance = balances
            .get_mut(account_id)
            .ok_or_else(|| LedgerError::NotFound(format!("account {account_id}")))?;
        if amount > balance.hold_amount {
            return Err(LedgerError::Validation(format!(
                "cannot release {amount}: only {} held",
                balance.hold_amount
            )));
        }
        balance.hold_amount = balance.hold_amount.checked_sub(amount)?;
        balance.updated_at = Utc::now();
        Ok(balance.clone())
    }

    pub async fn request_overdraft(
        &self,
        account_id: &AccountId,
        limit_amount: Amount,
        requested_by: &str,
    ) -> LedgerResult<OverdraftFacility> {
        if !limit_amount.is_positive() {
            return Err(LedgerError::Validation(
                "overdraft limit must be positive".into(),
            ));
        }
        {
            let accounts = self.accounts.read().await;
            if !accounts.contains_key(account_id) {
                return Err(LedgerError::NotFound(format!("account {account_id}")));
            }
        }
        let mut overdrafts = self.overdrafts.write().await;
        let facility = OverdraftFacility {
            id: Ulid::new().to_string(),
            account_id: account_id.clone(),
            limit_amount,
            state: OverdraftState::Pending,
            requested_by: requested_by.to_owned(),
            approver_id: None,
            approved_at: None,
        };
        overdrafts.insert(facility.id.clone(), facility.clone());
        Ok(facility)
    }

    pub async fn overdraft(&self, facility_id: &str) -> LedgerResult<OverdraftFacility> {
        let overdrafts = self.overdrafts.read().await;
        overdrafts
            .get(facility_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("overdraft facility {facility_id}")))
    }

    pub async fn transition_overdraft(
        &self,
        facility_id: &str,
        to: OverdraftState,
        actor_id: &str,
    ) -> LedgerResult<OverdraftFacility> {
        let mut overdrafts = self.overdrafts.write().await;
        let facility = overdrafts
            .get_mut(facility_id)
            .ok_or_else(|| LedgerError::NotFound(format!("overdraft facility {facility_id}")))?;
        validate_transition(facility.state, to)?;
        facility.state = to;
        if to == OverdraftState::Approved {
            facility.approver_id = Some(actor_id.to_owned());
            facility.approved_at = Some(Utc::now());
        }
        Ok(facility.clone())
    }

    pub async fn active_overdraft_limit(&self, account_id: &str) -> Amount {
        let overdrafts = self.overdrafts.read().await;
        overdrafts
            .values()
            .find(|facility| {
                facility.account_id == account_id && facility.state == OverdraftState::Active
            })
            .map(|facility| facility.limit_amount)
            .unwrap_or(Amount::ZERO)
    }
}

struct ResolvedEntry {
    account_id: AccountId,
    account_type: crate::AccountType,
    side: EntrySide,
    amount: Amount,
    description: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AccountType;
    use crate::OwnerType;
    use crate::TxnType;
    use caricash_events::InMemoryEventStore;
    use caricash_idempotency::InMemoryIdempotencyStore;
    use caricash_money::Currency;
    use crate::InMemoryJournalStore;
    use pretty_assertions::assert_eq;

    fn engine() -> PostingEngine {
        PostingEngine::new(
            Arc::new(InMemoryJournalStore::new()),
            Arc::new(InMemoryIdempotencyStore::new()),
            Arc::new(InMemoryEventStore::new()),
        )
    }

    fn amount(literal: &str) -> Amount {
        literal.parse().expect("amount literal")
    }

    fn deposit(key: &str, owner_id: &str, value: &str) -> PostCommand {
        PostCommand {
            idempotency_key: key.into(),
            correlation_id: format!("corr-{key}"),
            txn_type: TxnType::Deposit,
            currency: Currency::Bbd,
            entries: vec![
                crate::CommandEntry {
                    account: AccountRef::owner(OwnerType::System, "bank", AccountType::BankPool),
                    side: EntrySide::Debit,
                    amount: amount(value),
                    description: "bank pool".into(),
                },
                crate::CommandEntry {
                    account: AccountRef::owner(OwnerType::Customer, owner_id, AccountType::Wallet),
                    side: EntrySide::Credit,
                    amount: amount(value),
                    description: "wallet credit".into(),
                },
            ],
            description: "cash deposit".into(),
            actor_type: "CUSTOMER".into(),
            actor_id: owner_id.into(),
        }
    }

    fn withdrawal(key: &str, owner_id: &str, value: &str) -> PostCommand {
        PostCommand {
            idempotency_key: key.into(),
            correlation_id: format!("corr-{key}"),
            txn_type: TxnType::Withdrawal,
            currency: Currency::Bbd,
            entries: vec![
                crate::CommandEntry {
                    account: AccountRef::owner(OwnerType::Customer, owner_id, AccountType::Wallet),
                    side: EntrySide::Debit,
                    amount: amount(value),
                    description: "wallet debit".into(),
                },
                crate::CommandEntry {
                    account: AccountRef::owner(OwnerType::System, "bank", AccountType::BankPool),
                    side: EntrySide::Credit,
                    amount: amount(value),
                    description: "bank pool".into(),
                },
            ],
            description: "cash withdrawal".into(),
            actor_type: "CUSTOMER".into(),
            actor_id: owner_id.into(),
        }
    }

    fn wallet_key(owner_id: &str) -> DomainKey {
        DomainKey::wallet(OwnerType::Customer, owner_id, Currency::Bbd)
    }

    fn wallet_account(owner_id: &str) -> AccountId {
        LedgerAccount::derive_id(OwnerType::Customer, owner_id, AccountType::Wallet, Currency::Bbd)
    }

    #[tokio::test]
    async fn posting_creates_accounts_lazily_and_updates_balances() {
        let engine = engine();
        let receipt = engine
            .post(&wallet_key("c-1"), deposit("dep-1", "c-1", "100.00"))
            .await
            .expect("deposit posts");

        assert!(!receipt.journal_hash.is_empty());
        let balance = engine
            .balance(&wallet_account("c-1"))
            .await
            .expect("balance exists");
        assert_eq!(balance.actual_balance, amount("100.00"));
        assert_eq!(balance.available_balance(), amount("100.00"));
        assert_eq!(balance.last_journal_id, Some(receipt.journal_id));
    }

    #[tokio::test]
    async fn unbalanced_journal_is_rejected_without_side_effects() {
        let engine = engine();
        let mut command = deposit("dep-bad", "c-1", "100.00");
        command.entries[1].amount = amount("90.00");

        let err = engine
            .post(&wallet_key("c-1"), command)
            .await
            .expect_err("unbalanced journal must fail");
        assert!(matches!(err, LedgerError::Unbalanced { .. }));
        assert!(engine.balance(&wallet_account("c-1")).await.is_err());
    }

    #[tokio::test]
    async fn insufficient_funds_is_enforced_on_wallet_debits() {
        let engine = engine();
        engine
            .post(&wallet_key("c-1"), deposit("dep-1", "c-1", "50.00"))
            .await
            .expect("seed deposit");

        let err = engine
            .post(&wallet_key("c-1"), withdrawal("wd-1", "c-1", "80.00"))
            .await
            .expect_err("overdraw must fail");
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));

        let balance = engine
            .balance(&wallet_account("c-1"))
            .await
            .expect("balance");
        assert_eq!(balance.actual_balance, amount("50.00"));
    }

    #[tokio::test]
    async fn active_overdraft_extends_the_spending_floor() {
        let engine = engine();
        engine
            .post(&wallet_key("c-1"), deposit("dep-1", "c-1", "50.00"))
            .await
            .expect("seed deposit");

        let facility = engine
            .request_overdraft(&wallet_account("c-1"), amount("40.00"), "c-1")
            .await
            .expect("request facility");
        engine
            .transition_overdraft(&facility.id, OverdraftState::Approved, "staff-1")
            .await
            .expect("approve");
        engine
            .transition_overdraft(&facility.id, OverdraftState::Active, "staff-1")
            .await
            .expect("activate");

        engine
            .post(&wallet_key("c-1"), withdrawal("wd-1", "c-1", "80.00"))
            .await
            .expect("overdraft covers the debit");

        let balance = engine
            .balance(&wallet_account("c-1"))
            .await
            .expect("balance");
        assert_eq!(balance.actual_balance, amount("-30.00"));

        let err = engine
            .post(&wallet_key("c-1"), withdrawal("wd-2", "c-1", "20.00"))
            .await
            .expect_err("beyond the facility limit");
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
    }

    #[tokio::test]
    async fn holds_reduce_available_but_not_actual_balance() {
        let engine = engine();
        engine
            .post(&wallet_key("c-1"), deposit("dep-1", "c-1", "100.00"))
            .await
            .expect("seed deposit");

        let account = wallet_account("c-1");
        let held = engine
            .apply_hold(&account, amount("70.00"))
            .await
            .expect("hold applied");
        assert_eq!(held.actual_balance, amount("100.00"));
        assert_eq!(held.available_balance(), amount("30.00"));

        let err = engine
            .post(&wallet_key("c-1"), withdrawal("wd-1", "c-1", "50.00"))
            .await
            .expect_err("held funds cannot be spent");
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));

        engine
            .release_hold(&account, amount("70.00"))
            .await
            .expect("hold released");
        engine
            .post(&wallet_key("c-1"), withdrawal("wd-2", "c-1", "50.00"))
            .await
            .expect("released funds spend normally");

        let err = engine
            .release_hold(&account, amount("0.01"))
            .await
            .expect_err("nothing left to release");
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[tokio::test]
    async fn replay_returns_stored_receipt() {
        let engine = engine();
        let first = engine
            .post(&wallet_key("c-1"), deposit("dep-1", "c-1", "25.00"))
            .await
            .expect("first post");
        let replay = engine
            .post(&wallet_key("c-1"), deposit("dep-1", "c-1", "25.00"))
            .await
            .expect("replay");
        assert_eq!(first, replay);

        let balance = engine
            .balance(&wallet_account("c-1"))
            .await
            .expect("balance");
        assert_eq!(balance.actual_balance, amount("25.00"));
    }

    #[tokio::test]
    async fn altered_payload_with_same_key_conflicts() {
        let engine = engine();
        engine
            .post(&wallet_key("c-1"), deposit("dep-1", "c-1", "25.00"))
            .await
            .expect("first post");

        let err = engine
            .post(&wallet_key("c-1"), deposit("dep-1", "c-1", "26.00"))
            .await
            .expect_err("altered payload must conflict");
        assert!(matches!(err, LedgerError::DuplicateIdempotencyConflict));
    }

    #[tokio::test]
    async fn cross_currency_account_is_rejected() {
        let engine = engine();
        engine
            .post(&wallet_key("c-1"), deposit("dep-1", "c-1", "25.00"))
            .await
            .expect("seed BBD wallet");

        let mut command = deposit("dep-usd", "c-1", "10.00");
        command.currency = Currency::Usd;
        command.entries[1].account = AccountRef::id(wallet_account("c-1"));

        let err = engine
            .post(
                &DomainKey::wallet(OwnerType::Customer, "c-1", Currency::Usd),
                command,
            )
            .await
            .expect_err("BBD account cannot take a USD leg");
        assert!(matches!(err, LedgerError::CrossCurrency { .. }));
    }

    #[tokio::test]
    async fn statement_pages_through_account_lines() {
        let engine = engine();
        for index in 0..3 {
            engine
                .post(
                    &wallet_key("c-1"),
                    deposit(&format!("dep-{index}"), "c-1", "10.00"),
                )
                .await
                .expect("deposit");
        }

        let page = engine
            .statement(&wallet_account("c-1"), 1, 1)
            .await
            .expect("statement page");
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].side, EntrySide::Credit);
    }

    #[tokio::test]
    async fn backpressure_rejects_when_queue_is_full() {
        let engine = PostingEngine::with_config(
            Arc::new(InMemoryJournalStore::new()),
            Arc::new(InMemoryIdempotencyStore::new()),
            Arc::new(InMemoryEventStore::new()),
            PostingEngineConfig { max_queue_depth: 0 },
        );
        let key = wallet_key("c-1");
        let slot = engine.key_slot(&key).await;
        slot.pending.fetch_add(1, Ordering::SeqCst);

        let err = engine
            .post(&key, deposit("dep-1", "c-1", "10.00"))
            .await
            .expect_err("queue is full");
        assert!(matches!(err, LedgerError::Backpressure { .. }));
        assert!(err.is_retryable());
    }
}
