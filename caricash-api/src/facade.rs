use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use serde_json::json;
use tracing::info;

use caricash_approvals::ApprovalRequest;
use caricash_approvals::ApprovalWorkflow;
use caricash_approvals::DecisionInput;
use caricash_approvals::RequestId;
use caricash_fraud::ContextKind;
use caricash_fraud::FraudContext;
use caricash_fraud::FraudEvaluator;
use caricash_fraud::RuleAction;
use caricash_idempotency::IdempotencyStore;
use caricash_ledger::AccountRef;
use caricash_ledger::AccountType;
use caricash_ledger::ChainVerification;
use caricash_ledger::CommandEntry;
use caricash_ledger::DomainKey;
use caricash_ledger::EntrySide;
use caricash_ledger::JournalId;
use caricash_ledger::LedgerAccount;
use caricash_ledger::LedgerJournal;
use caricash_ledger::LedgerLine;
use caricash_ledger::OwnerType;
use caricash_ledger::PostCommand;
use caricash_ledger::PostReceipt;
use caricash_ledger::PostingEngine;
use caricash_ledger::TxnType;
use caricash_ledger::templates;
use caricash_lifecycle::JournalState;
use caricash_money::Amount;
use caricash_money::Currency;
use caricash_policy::RequestContext;
use caricash_reconcile::ReconciliationEngine;
use caricash_reconcile::ReconciliationRun;

use crate::ErrorCode;
use crate::ErrorEnvelope;
use crate::WalletTelemetry;
use crate::handlers;

pub type ApiResult<T> = Result<T, ErrorEnvelope>;

#[derive(Debug, Clone)]
pub struct ActorContext {
    pub actor_type: String,
    pub actor_id: String,
    pub staff_role: Option<String>,
}

impl ActorContext {
    #[must_use]
    pub fn staff(actor_id: &str, role: &str) -> Self {
        Self {
            actor_type: "STAFF".into(),
            actor_id: actor_id.into(),
            staff_role: Some(role.into()),
        }
    }

    #[must_use]
    pub fn customer(actor_id: &str) -> Self {
        Self {
            actor_type: "CUSTOMER".into(),
            actor_id: actor_id.into(),
            staff_role: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DepositParams {
    pub owner_type: OwnerType,
    pub owner_id: String,
    pub currency: Currency,
    pub gross: Amount,
    pub fee: Amount,
    pub tax: Amount,
    pub idempotency_key: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone)]
pub struct WithdrawalParams {
    pub owner_type: OwnerType,
    pub owner_id: String,
    pub currency: Currency,
    pub amount: Amount,
    pub idempotency_key: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone)]
pub struct TransferParams {
    pub txn_type: TxnType,
    pub from_owner_type: OwnerType,
    pub from_owner_id: String,
    pub to_owner_type: OwnerType,
    pub to_owner_id: String,
    pub currency: Currency,
    pub amount: Amount,
    pub idempotency_key: String,
    pub correlation_id: String,
}

/// Composition root for the wallet core: fraud screening, posting,
/// governance, reconciliation and the governed maintenance surface.
pub struct WalletFacade {
    ledger: Arc<PostingEngine>,
    workflow: Arc<ApprovalWorkflow>,
    fraud: Arc<FraudEvaluator>,
    reconciliation: Arc<ReconciliationEngine>,
    idempotency: Arc<dyn IdempotencyStore>,
    telemetry: WalletTelemetry,
}

impl WalletFacade {
    pub fn new(
        ledger: Arc<PostingEngine>,
        workflow: Arc<ApprovalWorkflow>,
        fraud: Arc<FraudEvaluator>,
        reconciliation: Arc<ReconciliationEngine>,
        idempotency: Arc<dyn IdempotencyStore>,
        telemetry: WalletTelemetry,
    ) -> Self {
        Self {
            ledger,
            workflow,
            fraud,
            reconciliation,
            idempotency,
            telemetry,
        }
    }

    /// Wires the built-in side-effect handlers onto the workflow.
    pub async fn register_default_handlers(&self) {
        self.workflow
            .register_handler(
                handlers::REVERSAL_REQUESTED,
                Arc::new(handlers::ReversalHandler::new(self.ledger.clone())),
            )
            .await;
        self.workflow
            .register_handler(
                handlers::SUSPENSE_FUNDING,
                Arc::new(handlers::SuspenseFundingHandler::new(self.ledger.clone())),
            )
            .await;
        self.workflow
            .register_handler(
                handlers::OVERDRAFT_APPROVAL,
                Arc::new(handlers::OverdraftApprovalHandler::new(self.ledger.clone())),
            )
            .await;
        self.workflow
            .register_handler(
                handlers::MERCHANT_WITHDRAWAL,
                Arc::new(handlers::MerchantWithdrawalHandler::new(self.ledger.clone())),
            )
            .await;
    }

    #[must_use]
    pub fn workflow(&self) -> Arc<ApprovalWorkflow> {
        self.workflow.clone()
    }

    #[must_use]
    pub fn ledger(&self) -> Arc<PostingEngine> {
        self.ledger.clone()
    }

    async fn screen(
        &self,
        actor: &ActorContext,
        amount: Amount,
        currency: Currency,
        correlation_id: &str,
    ) -> ApiResult<()> {
        let context = FraudContext {
            context_type: ContextKind::Txn,
            actor_type: actor.actor_type.clone(),
            actor_id: actor.actor_id.clone(),
            amount,
            currency,
            signals: json!({}),
        };
        let evaluation = self
            .fraud
            .evaluate(&context)
            .await
            .map_err(|err| ErrorEnvelope::from_fraud(&err, correlation_id))?;
        match evaluation.decision {
            RuleAction::Block => {
                self.telemetry.record_fraud_block();
                let codes: Vec<String> = evaluation
                    .matched
                    .iter()
                    .map(|rule| rule.reason_code.clone())
                    .collect();
                Err(
                    ErrorEnvelope::new(ErrorCode::Forbidden, "transaction blocked", correlation_id)
                        .with_details(json!({"reason_codes": codes})),
                )
            }
            RuleAction::Review => {
                // The transaction proceeds; matched rules already opened
                // review cases for the fraud desk.
                self.telemetry.record_fraud_review();
                Ok(())
            }
            RuleAction::Allow => Ok(()),
        }
    }

    async fn post(
        &self,
        domain_key: &DomainKey,
        command: PostCommand,
    ) -> ApiResult<PostReceipt> {
        let correlation_id = command.correlation_id.clone();
        match self.ledger.post(domain_key, command).await {
            Ok(receipt) => {
                self.telemetry.record_posted();
                Ok(receipt)
            }
            Err(err) => {
                if matches!(err, caricash_ledger::LedgerError::DuplicateIdempotencyConflict) {
                    self.telemetry.record_conflict();
                }
                Err(ErrorEnvelope::from_ledger(&err, &correlation_id))
            }
        }
    }

    pub async fn deposit(&self, actor: ActorContext, params: DepositParams) -> ApiResult<PostReceipt> {
        self.screen(&actor, params.gross, params.currency, &params.correlation_id)
            .await?;
        let output = templates::deposit_with_fee(
            params.owner_type,
            &params.owner_id,
            params.currency,
            params.gross,
            params.fee,
            params.tax,
        )
        .map_err(|err| ErrorEnvelope::from_ledger(&err, &params.correlation_id))?;

        let command = PostCommand {
            idempotency_key: params.idempotency_key,
            correlation_id: params.correlation_id,
            txn_type: output.txn_type,
            currency: output.currency,
            entries: output.entries,
            description: format!("deposit for {}", params.owner_id),
            actor_type: actor.actor_type,
            actor_id: actor.actor_id,
        };
        self.post(
            &DomainKey::wallet(params.owner_type, &params.owner_id, params.currency),
            command,
        )
        .await
    }

    pub async fn withdraw(
        &self,
        actor: ActorContext,
        params: WithdrawalParams,
    ) -> ApiResult<PostReceipt> {
        self.screen(&actor, params.amount, params.currency, &params.correlation_id)
            .await?;
        let command = PostCommand {
            idempotency_key: params.idempotency_key,
            correlation_id: params.correlation_id,
            txn_type: TxnType::Withdrawal,
            currency: params.currency,
            entries: vec![
                CommandEntry {
                    account: AccountRef::owner(params.owner_type, &params.owner_id, AccountType::Wallet),
                    side: EntrySide::Debit,
                    amount: params.amount,
                    description: "wallet debit".into(),
                },
                CommandEntry {
                    account: AccountRef::owner(OwnerType::System, "bank", AccountType::BankPool),
                    side: EntrySide::Credit,
                    amount: params.amount,
                    description: "bank pool credit".into(),
                },
            ],
            description: format!("withdrawal for {}", params.owner_id),
            actor_type: actor.actor_type,
            actor_id: actor.actor_id,
        };
        self.post(
            &DomainKey::wallet(params.owner_type, &params.owner_id, params.currency),
            command,
        )
        .await
    }

    /// Cross-wallet movement. Both wallets are written by one journal, so
    /// the transfer routes through the clearing account's domain key and
    /// carries explicit clearing legs that net to zero.
    pub async fn transfer(
        &self,
        actor: ActorContext,
        params: TransferParams,
    ) -> ApiResult<PostReceipt> {
        if !matches!(params.txn_type, TxnType::P2p | TxnType::Payment | TxnType::B2b) {
            return Err(ErrorEnvelope::new(
                ErrorCode::ValidationError,
                "transfer supports P2P, PAYMENT and B2B only",
                &params.correlation_id,
            ));
        }
        self.screen(&actor, params.amount, params.currency, &params.correlation_id)
            .await?;

        let clearing = AccountRef::owner(OwnerType::System, "clearing", AccountType::Clearing);
        let command = PostCommand {
            idempotency_key: params.idempotency_key,
            correlation_id: params.correlation_id,
            txn_type: params.txn_type,
            currency: params.currency,
            entries: vec![
                CommandEntry {
                    account: AccountRef::owner(
                        params.from_owner_type,
                        &params.from_owner_id,
                        AccountType::Wallet,
                    ),
                    side: EntrySide::Debit,
                    amount: params.amount,
                    description: "sender debit".into(),
                },
                CommandEntry {
                    account: clearing.clone(),
                    side: EntrySide::Credit,
                    amount: params.amount,
                    description: "clearing in".into(),
                },
                CommandEntry {
                    account: clearing,
                    side: EntrySide::Debit,
                    amount: params.amount,
                    description: "clearing out".into(),
                },
                CommandEntry {
                    account: AccountRef::owner(
                        params.to_owner_type,
                        &params.to_owner_id,
                        AccountType::Wallet,
                    ),
                    side: EntrySide::Credit,
                    amount: params.amount,
                    description: "receiver credit".into(),
                },
            ],
            description: format!(
                "{} from {} to {}",
                params.txn_type.as_str(),
                params.from_owner_id,
                params.to_owner_id
            ),
            actor_type: actor.actor_type,
            actor_id: actor.actor_id,
        };
        self.post(&DomainKey::ops("clearing", params.currency), command)
            .await
    }

    pub async fn balance(
        &self,
        owner_type: OwnerType,
        owner_id: &str,
        currency: Currency,
        correlation_id: &str,
    ) -> ApiResult<caricash_ledger::AccountBalance> {
        let account_id =
            LedgerAccount::derive_id(owner_type, owner_id, AccountType::Wallet, currency);
        self.ledger
            .balance(&account_id)
            .await
            .map_err(|err| ErrorEnvelope::from_ledger(&err, correlation_id))
    }

    pub async fn statement(
        &self,
        owner_type: OwnerType,
        owner_id: &str,
        currency: Currency,
        offset: usize,
        limit: usize,
        correlation_id: &str,
    ) -> ApiResult<Vec<LedgerLine>> {
        let account_id =
            LedgerAccount::derive_id(owner_type, owner_id, AccountType::Wallet, currency);
        self.ledger
            .statement(&account_id, offset, limit)
            .await
            .map_err(|err| ErrorEnvelope::from_ledger(&err, correlation_id))
    }

    /// Opens a governed reversal: the original journal moves to
    /// VOID_REQUESTED and an approval request is created; the compensating
    /// journal posts only on final approval.
    pub async fn request_reversal(
        &self,
        actor: ActorContext,
        journal_id: &JournalId,
        reason: &str,
        correlation_id: String,
    ) -> ApiResult<ApprovalRequest> {
        if reason.trim().is_empty() {
            return Err(ErrorEnvelope::new(
                ErrorCode::ValidationError,
                "a reversal reason is required",
                &correlation_id,
            ));
        }
        self.ledger
            .transition_journal(journal_id, JournalState::VoidRequested)
            .await
            .map_err(|err| ErrorEnvelope::from_ledger(&err, &correlation_id))?;

        let context = RequestContext {
            approval_type: handlers::REVERSAL_REQUESTED.into(),
            actor_type: actor.actor_type,
            actor_id: actor.actor_id,
            staff_role: actor.staff_role,
            payload: json!({"journal_id": journal_id, "reason": reason}),
        };
        let request = self
            .workflow
            .create(context, correlation_id.clone())
            .await
            .map_err(|err| ErrorEnvelope::from_approvals(&err, &correlation_id))?;
        self.telemetry.record_approval_opened();
        info!(journal_id = %journal_id, request_id = %request.id, "reversal requested");
        Ok(request)
    }

    /// Opens a governed overdraft facility: the facility row is created
    /// PENDING and activates only when the approval clears maker-checker.
    pub async fn request_overdraft(
        &self,
        actor: ActorContext,
        owner_type: OwnerType,
        owner_id: &str,
        currency: Currency,
        limit_amount: Amount,
        correlation_id: String,
    ) -> ApiResult<ApprovalRequest> {
        let account_id =
            LedgerAccount::derive_id(owner_type, owner_id, AccountType::Wallet, currency);
        let facility = self
            .ledger
            .request_overdraft(&account_id, limit_amount, &actor.actor_id)
            .await
            .map_err(|err| ErrorEnvelope::from_ledger(&err, &correlation_id))?;

        let context = RequestContext {
            approval_type: handlers::OVERDRAFT_APPROVAL.into(),
            actor_type: actor.actor_type,
            actor_id: actor.actor_id,
            staff_role: actor.staff_role,
            payload: json!({
                "facility_id": facility.id,
                "account_id": account_id,
                "limit_amount": facility.limit_amount,
            }),
        };
        let request = self
            .workflow
            .create(context, correlation_id.clone())
            .await
            .map_err(|err| ErrorEnvelope::from_approvals(&err, &correlation_id))?;
        self.telemetry.record_approval_opened();
        Ok(request)
    }

    pub async fn approve(
        &self,
        request_id: &RequestId,
        decider: ActorContext,
        reason: Option<String>,
        correlation_id: &str,
    ) -> ApiResult<ApprovalRequest> {
        let request = self
            .workflow
            .approve(
                request_id,
                DecisionInput {
                    decider_id: decider.actor_id,
                    decider_role: decider.staff_role,
                    reason,
                },
            )
            .await
            .map_err(|err| ErrorEnvelope::from_approvals(&err, correlation_id))?;
        if request.is_finalized() {
            self.telemetry.record_approval_approved();
        }
        Ok(request)
    }

    pub async fn reject(
        &self,
        request_id: &RequestId,
        decider: ActorContext,
        reason: Option<String>,
        correlation_id: &str,
    ) -> ApiResult<ApprovalRequest> {
        let request = self
            .workflow
            .reject(
                request_id,
                DecisionInput {
                    decider_id: decider.actor_id,
                    decider_role: decider.staff_role,
                    reason,
                },
            )
            .await
            .map_err(|err| ErrorEnvelope::from_approvals(&err, correlation_id))?;
        self.telemetry.record_approval_rejected();
        Ok(request)
    }

    pub async fn journal(
        &self,
        journal_id: &JournalId,
        correlation_id: &str,
    ) -> ApiResult<(LedgerJournal, Vec<LedgerLine>)> {
        let store = self.ledger.journal_store();
        let journal = store
            .journal(journal_id)
            .await
            .map_err(|err| ErrorEnvelope::from_ledger(&err, correlation_id))?;
        let lines = store
            .lines(journal_id)
            .await
            .map_err(|err| ErrorEnvelope::from_ledger(&err, correlation_id))?;
        Ok((journal, lines))
    }

    pub async fn verify_chain(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        correlation_id: &str,
    ) -> ApiResult<ChainVerification> {
        self.ledger
            .journal_store()
            .verify_chain(from, to)
            .await
            .map_err(|err| ErrorEnvelope::from_ledger(&err, correlation_id))
    }

    pub async fn run_reconciliation(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        correlation_id: &str,
    ) -> ApiResult<ReconciliationRun> {
        let run = self
            .reconciliation
            .run(from, to)
            .await
            .map_err(|err| ErrorEnvelope::from_reconcile(&err, correlation_id))?;
        self.telemetry.record_reconciliation(run.findings_count);
        Ok(run)
    }

    /// Clears a stuck in-flight idempotency marker. Maintenance only: the
    /// ledger itself is never touched through this path.
    pub async fn repair_idempotency(
        &self,
        scope: &str,
        key: &str,
        correlation_id: &str,
    ) -> ApiResult<()> {
        self.idempotency
            .clear_in_progress(scope, key)
            .await
            .map_err(|err| {
                ErrorEnvelope::new(ErrorCode::ValidationError, err.to_string(), correlation_id)
            })
    }

    /// Lifecycle-guarded journal state repair; content stays immutable.
    pub async fn repair_journal_state(
        &self,
        journal_id: &JournalId,
        to: JournalState,
        correlation_id: &str,
    ) -> ApiResult<LedgerJournal> {
        self.ledger
            .transition_journal(journal_id, to)
            .await
            .map_err(|err| ErrorEnvelope::from_ledger(&err, correlation_id))
    }

    #[must_use]
    pub fn telemetry(&self) -> &WalletTelemetry {
        &self.telemetry
    }
}
