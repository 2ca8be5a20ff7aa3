#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
}

/// One entity lifecycle expressed as a declarative transition table.
///
/// A state with no outgoing transitions is terminal; the kernel rejects any
/// attempt to leave it. The kernel never transitions on its own: callers
/// submit each step explicitly and persist only validated transitions.
pub trait LifecycleState: Copy + Eq + fmt::Debug + 'static {
    const ENTITY: &'static str;

    fn transitions(self) -> &'static [Self];

    fn is_terminal(self) -> bool {
        self.transitions().is_empty()
    }
}

pub fn validate<S: LifecycleState>(from: S, to: S) -> LifecycleResult<()> {
    if from.transitions().contains(&to) {
        Ok(())
    } else {
        Err(LifecycleError::InvalidTransition {
            entity: S::ENTITY,
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JournalState {
    Posted,
    VoidRequested,
    Reversed,
}

impl LifecycleState for JournalState {
    const ENTITY: &'static str = "journal";

    fn transitions(self) -> &'static [Self] {
        match self {
            JournalState::Posted => &[JournalState::VoidRequested, JournalState::Reversed],
            JournalState::VoidRequested => &[JournalState::Reversed],
            JournalState::Reversed => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverdraftState {
    Pending,
    Approved,
    Active,
    Rejected,
    Closed,
}

impl LifecycleState for OverdraftState {
    const ENTITY: &'static str = "overdraft_facility";

    fn transitions(self) -> &'static [Self] {
        match self {
            OverdraftState::Pending => &[OverdraftState::Approved, OverdraftState::Rejected],
            OverdraftState::Approved => &[OverdraftState::Active],
            OverdraftState::Active => &[OverdraftState::Closed],
            OverdraftState::Rejected | OverdraftState::Closed => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatementEntryState {
    New,
    CandidateMatched,
    Matched,
    PartialMatched,
    Unmatched,
    Disputed,
    Escalated,
    Settled,
    Resolved,
}

impl LifecycleState for StatementEntryState {
    const ENTITY: &'static str = "statement_entry";

    fn transitions(self) -> &'static [Self] {
        match self {
            StatementEntryState::New => &[
                StatementEntryState::CandidateMatched,
                StatementEntryState::Unmatched,
                StatementEntryState::Escalated,
            ],
            StatementEntryState::CandidateMatched => &[
                StatementEntryState::Matched,
                StatementEntryState::PartialMatched,
                StatementEntryState::Unmatched,
            ],
            StatementEntryState::Unmatched => {
                &[StatementEntryState::Disputed, StatementEntryState::Escalated]
            }
            StatementEntryState::Disputed => &[StatementEntryState::Resolved],
            StatementEntryState::Matched => &[StatementEntryState::Settled],
            StatementEntryState::PartialMatched
            | StatementEntryState::Escalated
            | StatementEntryState::Settled
            | StatementEntryState::Resolved => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExternalTransferState {
    Created,
    Pending,
    Settled,
    Failed,
    AnomalyCurrency,
}

impl LifecycleState for ExternalTransferState {
    const ENTITY: &'static str = "external_transfer";

    fn transitions(self) -> &'static [Self] {
        match self {
            ExternalTransferState::Created => &[ExternalTransferState::Pending],
            ExternalTransferState::Pending => &[
                ExternalTransferState::Settled,
                ExternalTransferState::Failed,
                ExternalTransferState::AnomalyCurrency,
            ],
            // A failed transfer may be retried from scratch.
            ExternalTransferState::Failed => &[ExternalTransferState::Created],
            ExternalTransferState::Settled | ExternalTransferState::AnomalyCurrency => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementBatchState {
    Created,
    Ready,
    Requested,
    Processing,
    Completed,
    Failed,
}

impl LifecycleState for SettlementBatchState {
    const ENTITY: &'static str = "settlement_batch";

    fn transitions(self) -> &'static [Self] {
        match self {
            SettlementBatchState::Created => {
                &[SettlementBatchState::Ready, SettlementBatchState::Failed]
            }
            SettlementBatchState::Ready => {
                &[SettlementBatchState::Requested, SettlementBatchState::Failed]
            }
            SettlementBatchState::Requested => &[
                SettlementBatchState::Processing,
                SettlementBatchState::Failed,
            ],
            SettlementBatchState::Processing => &[
                SettlementBatchState::Completed,
                SettlementBatchState::Failed,
            ],
            SettlementBatchState::Completed | SettlementBatchState::Failed => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutState {
    Requested,
    Approved,
    Pending,
    Settled,
    Rejected,
    Failed,
}

impl LifecycleState for PayoutState {
    const ENTITY: &'static str = "payout";

    fn transitions(self) -> &'static [Self] {
        match self {
            PayoutState::Requested => &[
                PayoutState::Approved,
                PayoutState::Rejected,
                PayoutState::Failed,
            ],
            PayoutState::Approved => &[
                PayoutState::Pending,
                PayoutState::Rejected,
                PayoutState::Failed,
            ],
            PayoutState::Pending => &[
                PayoutState::Settled,
                PayoutState::Rejected,
                PayoutState::Failed,
            ],
            PayoutState::Settled | PayoutState::Rejected | PayoutState::Failed => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BeneficiaryState {
    Draft,
    PendingVerification,
    PendingApproval,
    Active,
    UpdatePendingVerification,
    UpdatePendingApproval,
    Rejected,
}

impl LifecycleState for BeneficiaryState {
    const ENTITY: &'static str = "beneficiary";

    fn transitions(self) -> &'static [Self] {
        match self {
            BeneficiaryState::Draft => &[
                BeneficiaryState::PendingVerification,
                BeneficiaryState::Rejected,
            ],
            BeneficiaryState::PendingVerification => &[
                BeneficiaryState::PendingApproval,
                BeneficiaryState::Rejected,
            ],
            BeneficiaryState::PendingApproval => {
                &[BeneficiaryState::Active, BeneficiaryState::Rejected]
            }
            BeneficiaryState::Active => &[BeneficiaryState::UpdatePendingVerification],
            BeneficiaryState::UpdatePendingVerification => &[
                BeneficiaryState::UpdatePendingApproval,
                BeneficiaryState::Rejected,
            ],
            BeneficiaryState::UpdatePendingApproval => {
                &[BeneficiaryState::Active, BeneficiaryState::Rejected]
            }
            BeneficiaryState::Rejected => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationCaseState {
    Open,
    Investigating,
    Resolved,
}

impl LifecycleState for ReconciliationCaseState {
    const ENTITY: &'static str = "reconciliation_case";

    fn transitions(self) -> &'static [Self] {
        match self {
            ReconciliationCaseState::Open => &[ReconciliationCaseState::Investigating],
            ReconciliationCaseState::Investigating => &[ReconciliationCaseState::Resolved],
            ReconciliationCaseState::Resolved => &[],
        }
    }
}
