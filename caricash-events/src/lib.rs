#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;
use ulid::Ulid;

pub type EventsResult<T> = Result<T, EventsError>;

#[derive(Debug, Error)]
pub enum EventsError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("corrupted audit chain: {0}")]
    Corrupted(String),
    #[error("outbound queue unavailable: {0}")]
    QueueUnavailable(String),
}

/// Domain event as recorded in the append-only event log and forwarded to
/// the outbound queue. Correlation links a request's events together;
/// causation points at the event that triggered this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    pub entity_id: String,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    pub actor_type: String,
    pub actor_id: String,
    pub schema_version: u32,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub name: String,
    pub entity_type: String,
    pub entity_id: String,
    pub correlation_id: String,
    pub causation_id: Option<String>,
    pub actor_type: String,
    pub actor_id: String,
    pub payload: serde_json::Value,
}

impl EventDraft {
    fn validate(&self) -> EventsResult<()> {
        if self.name.trim().is_empty() {
            return Err(EventsError::Validation("event name must be provided".into()));
        }
        if self.entity_id.trim().is_empty() {
            return Err(EventsError::Validation(
                "event entity_id must be provided".into(),
            ));
        }
        if self.correlation_id.trim().is_empty() {
            return Err(EventsError::Validation(
                "event correlation_id must be provided".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub correlation_id: Option<String>,
    pub name: Option<String>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, draft: EventDraft) -> EventsResult<Event>;
}

/// Best-effort handoff to an external consumer. Delivery is at-least-once;
/// a failure after the event row is written must not fail the caller.
#[async_trait]
pub trait OutboundQueue: Send + Sync {
    async fn enqueue(&self, event: &Event) -> EventsResult<()>;
}

#[derive(Default)]
pub struct InMemoryOutboundQueue {
    delivered: RwLock<Vec<Event>>,
}

impl InMemoryOutboundQueue {
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn delivered(&self) -> Vec<Event> {
        self.delivered.read().await.clone()
    }
}

#[async_trait]
impl OutboundQueue for InMemoryOutboundQueue {
    async fn enqueue(&self, event: &Event) -> EventsResult<()> {
        self.delivered.write().await.push(event.clone());
        Ok(())
    }
}

/// Append-only event log. Rows are never updated or deleted; queue failures
/// are logged and retried out-of-band by the operator.
pub struct InMemoryEventStore {
    events: RwLock<Vec<Event>>,
    queue: Option<Arc<dyn OutboundQueue>>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            queue: None,
        }
    }
}

impl InMemoryEventStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_queue(queue: Arc<dyn OutboundQueue>) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            queue: Some(queue),
        }
    }

    pub async fn events(&self, filter: EventFilter) -> Vec<Event> {
        let guard = self.events.read().await;
        let mut matched: Vec<Event> = guard
            .iter()
            .filter(|event| {
                filter
                    .correlation_id
                    .as_ref()
                    .is_none_or(|correlation| &event.correlation_id == correlation)
                    && filter.name.as_ref().is_none_or(|name| &event.name == name)
            })
            .cloned()
            .collect();
        if let Some(limit) = filter.limit
            && matched.len() > limit
        {
            matched.truncate(limit);
        }
        matched
    }
}

#[async_trait]
impl EventSink for InMemoryEventStore {
    async fn publish(&self, draft: EventDraft) -> EventsResult<Event> {
        draft.validate()?;
        let event = Event {
            id: Ulid::new().to_string(),
            name: draft.name,
            entity_type: draft.entity_type,
            entity_id: draft.entity_id,
            correlation_id: draft.correlation_id,
            causation_id: draft.causation_id,
            actor_type: draft.actor_type,
            actor_id: draft.actor_id,
            schema_version: 1,
            payload: draft.payload,
            created_at: Utc::now(),
        };
        self.events.write().await.push(event.clone());

        if let Some(queue) = &self.queue
            && let Err(err) = queue.enqueue(&event).await
        {
            // The event row is already durable; delivery retries out-of-band.
            warn!(event_id = %event.id, error = %err, "outbound enqueue failed");
        }
        Ok(event)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditDraft {
    pub action: String,
    pub actor: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Value>,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub action: String,
    pub actor: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Value>,
    pub correlation_id: String,
    pub occurred_at: DateTime<Utc>,
    pub previous_hash: String,
    pub hash: String,
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub target: Option<String>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, draft: AuditDraft) -> EventsResult<AuditRecord>;

    async fn records(&self, filter: AuditFilter) -> EventsResult<Vec<AuditRecord>>;
}

#[derive(Default)]
pub struct InMemoryAuditLog {
    records: RwLock<Vec<AuditRecord>>,
}

impl InMemoryAuditLog {
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn compute_hash(
        previous: &str,
        action: &str,
        target: &str,
        occurred_at: DateTime<Utc>,
        before: Option<&serde_json::Value>,
        after: Option<&serde_json::Value>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(previous.as_bytes());
        hasher.update(action.as_bytes());
        hasher.update(target.as_bytes());
        let nanos = occurred_at
            .timestamp_nanos_opt()
            .unwrap_or_else(|| occurred_at.timestamp_micros() * 1_000);
        hasher.update(nanos.to_be_bytes());
        if let Some(before) = before {
            hasher.update(before.to_string().as_bytes());
        }
        if let Some(after) = after {
            hasher.update(after.to_string().as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    fn validate_draft(draft: &AuditDraft) -> EventsResult<()> {
        if draft.action.trim().is_empty() {
            return Err(EventsError::Validation("action must be provided".into()));
        }
        if draft.actor.trim().is_empty() {
            return Err(EventsError::Validation("actor must be provided".into()));
        }
        if draft.target.trim().is_empty() {
            return Err(EventsError::Validation("target must be provided".into()));
        }
        Ok(())
    }

    fn verify_chain(records: &[AuditRecord]) -> EventsResult<()> {
        let mut previous = String::from("genesis");
        for record in records {
            if record.previous_hash != previous {
                return Err(EventsError::Corrupted(format!(
                    "unexpected previous hash for {}",
                    record.id
                )));
            }
            let expected = Self::compute_hash(
                &record.previous_hash,
                &record.action,
                &record.target,
                record.occurred_at,
                record.before.as_ref(),
                record.after.as_ref(),
            );
            if expected != record.hash {
                return Err(EventsError::Corrupted(format!(
                    "hash mismatch for {}",
                    record.id
                )));
            }
            previous = record.hash.clone();
        }
        Ok(())
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(&self, draft: AuditDraft) -> EventsResult<AuditRecord> {
        Self::validate_draft(&draft)?;

        let mut guard = self.records.write().await;
        let previous_hash = guard
            .last()
            .map(|record| record.hash.clone())
            .unwrap_or_else(|| "genesis".into());

        let occurred_at = Utc::now();
        let hash = Self::compute_hash(
            &previous_hash,
            &draft.action,
            &draft.target,
            occurred_at,
            draft.before.as_ref(),
            draft.after.as_ref(),
        );

        let record = AuditRecord {
            id: Ulid::new().to_string(),
            action: draft.action,
            actor: draft.actor,
            target: draft.target,
            before: draft.before,
            after: draft.after,
            correlation_id: draft.correlation_id,
            occurred_at,
            previous_hash,
            hash,
        };

        guard.push(record.clone());
        Ok(record)
    }

    async fn records(&self, filter: AuditFilter) -> EventsResult<Vec<AuditRecord>> {
        let guard = self.records.read().await;
        Self::verify_chain(&guard)?;
        let mut filtered = guard.clone();

        if let Some(target) = filter.target {
            filtered.retain(|record| record.target == target);
        }

        if let Some(limit) = filter.limit
            && filtered.len() > limit
        {
            filtered.truncate(limit);
        }

        Ok(filtered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn draft(name: &str, correlation: &str) -> EventDraft {
        EventDraft {
            name: name.into(),
            entity_type: "journal".into(),
            entity_id: "j-1".into(),
            correlation_id: correlation.into(),
            causation_id: None,
            actor_type: "CUSTOMER".into(),
            actor_id: "c-1".into(),
            payload: json!({"amount": "10.00"}),
        }
    }

    #[tokio::test]
    async fn publishes_events_and_forwards_to_queue() {
        let queue = InMemoryOutboundQueue::shared();
        let store = InMemoryEventStore::with_queue(queue.clone());

        let event = store
            .publish(draft("TRANSACTION_POSTED", "corr-1"))
            .await
            .expect("publish");
        assert_eq!(event.name, "TRANSACTION_POSTED");
        assert_eq!(event.schema_version, 1);

        let delivered = queue.delivered().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].id, event.id);
    }

    #[tokio::test]
    async fn filters_events_by_correlation_and_name() {
        let store = InMemoryEventStore::new();
        store
            .publish(draft("TRANSACTION_POSTED", "corr-1"))
            .await
            .expect("publish");
        store
            .publish(draft("TRANSACTION_POSTED", "corr-2"))
            .await
            .expect("publish");
        store
            .publish(draft("APPROVAL_DECIDED", "corr-1"))
            .await
            .expect("publish");

        let matched = store
            .events(EventFilter {
                correlation_id: Some("corr-1".into()),
                name: Some("TRANSACTION_POSTED".into()),
                limit: None,
            })
            .await;
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].correlation_id, "corr-1");
    }

    #[tokio::test]
    async fn rejects_events_without_required_fields() {
        let store = InMemoryEventStore::new();
        let mut invalid = draft("", "corr-1");
        invalid.name = String::new();
        let err = store.publish(invalid).await.expect_err("must fail");
        assert!(matches!(err, EventsError::Validation(_)));
    }

    #[tokio::test]
    async fn audit_records_chain_hashes() {
        let log = InMemoryAuditLog::shared();

        let first = log
            .append(AuditDraft {
                action: "POLICY_ACTIVATED".into(),
                actor: "staff-1".into(),
                target: "policy-1".into(),
                before: Some(json!({"state": "DRAFT"})),
                after: Some(json!({"state": "ACTIVE"})),
                correlation_id: "corr-1".into(),
            })
            .await
            .expect("append");
        assert_eq!(first.previous_hash, "genesis");

        let second = log
            .append(AuditDraft {
                action: "APPROVAL_DECIDED".into(),
                actor: "staff-2".into(),
                target: "req-1".into(),
                before: None,
                after: None,
                correlation_id: "corr-2".into(),
            })
            .await
            .expect("append");
        assert_eq!(second.previous_hash, first.hash);

        let records = log.records(AuditFilter::default()).await.expect("records");
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn audit_chain_detects_tampering() {
        let log = InMemoryAuditLog::shared();
        for target in ["t-1", "t-2"] {
            log.append(AuditDraft {
                action: "REVERSAL_POSTED".into(),
                actor: "staff-1".into(),
                target: target.into(),
                before: None,
                after: None,
                correlation_id: "corr".into(),
            })
            .await
            .expect("append");
        }

        {
            let mut guard = log.records.write().await;
            guard[1].target = "tampered".into();
        }

        let err = log.records(AuditFilter::default()).await.unwrap_err();
        assert!(matches!(err, EventsError::Corrupted(_)));
    }

    #[tokio::test]
    async fn audit_filter_narrows_by_target() {
        let log = InMemoryAuditLog::shared();
        for target in ["req-1", "req-2", "req-1"] {
            log.append(AuditDraft {
                action: "STAGE_DECISION".into(),
                actor: "staff".into(),
                target: target.into(),
                before: None,
                after: None,
                correlation_id: "corr".into(),
            })
            .await
            .expect("append");
        }

        let records = log
            .records(AuditFilter {
                target: Some("req-1".into()),
                limit: Some(1),
            })
            .await
            .expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target, "req-1");
    }
}
