#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

pub type IdempotencyResult<T> = Result<T, IdempotencyError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdempotencyError {
    #[error("a record already exists for scope {scope} key {key}")]
    AlreadyExists { scope: String, key: String },
    #[error("no in-flight record for scope {scope} key {key}")]
    NotInProgress { scope: String, key: String },
    #[error("request is already being processed")]
    InProgress,
    #[error("idempotency key was reused with a different payload")]
    DuplicateConflict,
    #[error("storage error: {0}")]
    Storage(String),
}

/// Retention bucket for committed records. Replays inside the window return
/// the stored result; after expiry the key behaves like a fresh request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TtlCategory {
    MoneyTx,
    BankTransfer,
    WebhookDedupe,
    OpsConfig,
}

impl TtlCategory {
    #[must_use]
    pub fn retention(self) -> Duration {
        match self {
            TtlCategory::MoneyTx => Duration::days(30),
            TtlCategory::BankTransfer => Duration::days(90),
            TtlCategory::WebhookDedupe => Duration::days(180),
            TtlCategory::OpsConfig => Duration::days(365),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub scope: String,
    pub key: String,
    pub payload_hash: String,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Miss,
    InProgress { payload_hash: String },
    Committed {
        payload_hash: String,
        result: serde_json::Value,
    },
}

/// Distinguishes a pure replay from a key reuse with a different body.
pub fn conflict_check(existing_payload_hash: &str, new_payload_hash: &str) -> IdempotencyResult<()> {
    if existing_payload_hash == new_payload_hash {
        Ok(())
    } else {
        Err(IdempotencyError::DuplicateConflict)
    }
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn lookup(&self, scope: &str, key: &str) -> IdempotencyResult<Lookup>;

    /// Writes the in-flight marker. Fails if any record, in-flight or
    /// committed, already occupies the slot.
    async fn put_in_progress(
        &self,
        scope: &str,
        key: &str,
        payload_hash: &str,
    ) -> IdempotencyResult<()>;

    /// Upgrades the in-flight marker to a committed record carrying the
    /// result and the category's retention window.
    async fn put_committed(
        &self,
        scope: &str,
        key: &str,
        payload_hash: &str,
        result: serde_json::Value,
        category: TtlCategory,
    ) -> IdempotencyResult<IdempotencyRecord>;

    /// Removes an in-flight marker after a failed or cancelled attempt.
    /// Committed records are never cleared through this path.
    async fn clear_in_progress(&self, scope: &str, key: &str) -> IdempotencyResult<()>;

    /// Drops committed records whose retention window has passed. Returns the
    /// number of purged records.
    async fn purge_expired(&self, now: DateTime<Utc>) -> IdempotencyResult<usize>;
}

#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    records: RwLock<HashMap<(String, String), IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(scope: &str, key: &str) -> (String, String) {
        (scope.to_owned(), key.to_owned())
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn lookup(&self, scope: &str, key: &str) -> IdempotencyResult<Lookup> {
        let guard = self.records.read().await;
        let Some(record) = guard.get(&Self::slot(scope, key)) else {
            return Ok(Lookup::Miss);
        };
        match &record.result {
            Some(result) => {
                if record
                    .expires_at
                    .is_some_and(|expires_at| expires_at <= Utc::now())
                {
                    return Ok(Lookup::Miss);
                }
                Ok(Lookup::Committed {
                    payload_hash: record.payload_hash.clone(),
                    result: result.clone(),
                })
            }
            None => Ok(Lookup::InProgress {
                payload_hash: record.payload_hash.clone(),
            }),
        }
    }

    async fn put_in_progress(
        &self,
        scope: &str,
        key: &str,
        payload_hash: &str,
    ) -> IdempotencyResult<()> {
        let mut guard = self.records.write().await;
        let slot = Self::slot(scope, key);
        if let Some(existing) = guard.get(&slot) {
            // Expired committed slots are reclaimable; anything else blocks.
            let reusable = existing.result.is_some()
                && existing
                    .expires_at
                    .is_some_and(|expires_at| expires_at <= Utc::now());
            if !reusable {
                return Err(IdempotencyError::AlreadyExists {
                    scope: scope.into(),
                    key: key.into(),
                });
            }
        }
        guard.insert(
            slot,
            IdempotencyRecord {
                scope: scope.into(),
                key: key.into(),
                payload_hash: payload_hash.into(),
                result: None,
                created_at: Utc::now(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn put_committed(
        &self,
        scope: &str,
        key: &str,
        payload_hash: &str,
        result: serde_json::Value,
        category: TtlCategory,
    ) -> IdempotencyResult<IdempotencyRecord> {
        let mut guard = self.records.write().await;
        let slot = Self::slot(scope, key);
        let record = guard
            .get_mut(&slot)
            .ok_or_else(|| IdempotencyError::NotInProgress {
                scope: scope.into(),
                key: key.into(),
            })?;
        if record.result.is_some() {
            return Err(IdempotencyError::AlreadyExists {
                scope: scope.into(),
                key: key.into(),
            });
        }
        record.payload_hash = payload_hash.into();
        record.result = Some(result);
        record.expires_at = Some(Utc::now() + category.retention());
        Ok(record.clone())
    }

    async fn clear_in_progress(&self, scope: &str, key: &str) -> IdempotencyResult<()> {
        let mut guard = self.records.write().await;
        let slot = Self::slot(scope, key);
        match guard.get(&slot) {
            Some(record) if record.result.is_none() => {
                guard.remove(&slot);
                Ok(())
            }
            Some(_) => Err(IdempotencyError::AlreadyExists {
                scope: scope.into(),
                key: key.into(),
            }),
            None => Err(IdempotencyError::NotInProgress {
                scope: scope.into(),
                key: key.into(),
            }),
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> IdempotencyResult<usize> {
        let mut guard = self.records.write().await;
        let before = guard.len();
        guard.retain(|_, record| {
            record.result.is_none() || record.expires_at.is_none_or(|expires_at| expires_at > now)
        });
        Ok(before - guard.len())
    }
}
