use serde::Deserialize;
use serde::Serialize;

use caricash_approvals::ApprovalsError;
use caricash_fraud::FraudError;
use caricash_ledger::LedgerError;
use caricash_policy::PolicyError;
use caricash_reconcile::ReconcileError;

/// Canonical error codes exposed on every failing response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    ValidationError,
    NotFound,
    InsufficientFunds,
    CrossCurrencyNotAllowed,
    DuplicateIdempotencyConflict,
    IdempotencyInProgress,
    MakerCheckerRequired,
    InvalidTransition,
    InternalError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
    pub code: ErrorCode,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorEnvelope {
    #[must_use]
    pub fn new(code: ErrorCode, error: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code,
            correlation_id: correlation_id.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    #[must_use]
    pub fn from_ledger(err: &LedgerError, correlation_id: &str) -> Self {
        let code = match err {
            LedgerError::Validation(_) | LedgerError::Unbalanced { .. } | LedgerError::Money(_) => {
                ErrorCode::ValidationError
            }
            LedgerError::CrossCurrency { .. } => ErrorCode::CrossCurrencyNotAllowed,
            LedgerError::InsufficientFunds { .. } => ErrorCode::InsufficientFunds,
            LedgerError::DuplicateIdempotencyConflict => ErrorCode::DuplicateIdempotencyConflict,
            LedgerError::IdempotencyInProgress | LedgerError::Backpressure { .. } => {
                ErrorCode::IdempotencyInProgress
            }
            LedgerError::NotFound(_) => ErrorCode::NotFound,
            LedgerError::InvalidTransition(_) => ErrorCode::InvalidTransition,
            LedgerError::Internal(_) => ErrorCode::InternalError,
        };
        Self::new(code, err.to_string(), correlation_id)
    }

    #[must_use]
    pub fn from_approvals(err: &ApprovalsError, correlation_id: &str) -> Self {
        let code = match err {
            ApprovalsError::NotFound(_) => ErrorCode::NotFound,
            ApprovalsError::MakerCheckerRequired => ErrorCode::MakerCheckerRequired,
            ApprovalsError::Forbidden => ErrorCode::Forbidden,
            ApprovalsError::Finalized => ErrorCode::InvalidTransition,
            ApprovalsError::Validation(_) | ApprovalsError::Policy(PolicyError::Validation(_)) => {
                ErrorCode::ValidationError
            }
            ApprovalsError::Policy(PolicyError::NotFound(_)) => ErrorCode::NotFound,
            ApprovalsError::Policy(_) | ApprovalsError::Handler(_) => ErrorCode::InternalError,
        };
        Self::new(code, err.to_string(), correlation_id)
    }

    #[must_use]
    pub fn from_fraud(err: &FraudError, correlation_id: &str) -> Self {
        let code = match err {
            FraudError::Validation(_) | FraudError::Condition(_) => ErrorCode::ValidationError,
            FraudError::NotFound(_) => ErrorCode::NotFound,
            FraudError::Governance(_) => ErrorCode::MakerCheckerRequired,
            FraudError::Scoring(_) => ErrorCode::InternalError,
        };
        Self::new(code, err.to_string(), correlation_id)
    }

    #[must_use]
    pub fn from_reconcile(err: &ReconcileError, correlation_id: &str) -> Self {
        let code = match err {
            ReconcileError::Validation(_) | ReconcileError::Money(_) => ErrorCode::ValidationError,
            ReconcileError::NotFound(_) => ErrorCode::NotFound,
            ReconcileError::InvalidTransition(_) => ErrorCode::InvalidTransition,
            ReconcileError::Ledger(inner) => return Self::from_ledger(inner, correlation_id),
        };
        Self::new(code, err.to_string(), correlation_id)
    }
}
