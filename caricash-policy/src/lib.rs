#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Datelike;
use chrono::NaiveDate;
use chrono::NaiveTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

mod conditions;

pub use conditions::Condition;
pub use conditions::ConditionOperator;

pub type PolicyId = String;
pub type ActorId = String;
pub type DelegationId = String;

pub type PolicyResult<T> = Result<T, PolicyError>;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("policy not found: {0}")]
    NotFound(String),
    #[error("invalid policy state change: {from:?} -> {to:?}")]
    InvalidStateChange { from: PolicyState, to: PolicyState },
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyState {
    Draft,
    Active,
    Inactive,
    Archived,
}

impl PolicyState {
    fn can_become(self, to: PolicyState) -> bool {
        matches!(
            (self, to),
            (PolicyState::Draft, PolicyState::Active)
                | (PolicyState::Active, PolicyState::Inactive)
                | (PolicyState::Inactive, PolicyState::Active)
                | (PolicyState::Draft, PolicyState::Archived)
                | (PolicyState::Active, PolicyState::Archived)
                | (PolicyState::Inactive, PolicyState::Archived)
        )
    }
}

/// Calendar gate on policy applicability. Parsed strictly: unknown fields,
/// out-of-range weekdays and malformed times are rejected when the policy
/// is saved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeConstraints {
    /// ISO weekdays, Monday = 1 through Sunday = 7. Empty means every day.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub weekdays: Vec<u8>,
    /// "HH:MM" in UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_from_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_to_time: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blackout_dates: Vec<NaiveDate>,
}

impl TimeConstraints {
    pub fn validate(&self) -> PolicyResult<()> {
        if self.weekdays.iter().any(|day| !(1..=7).contains(day)) {
            return Err(PolicyError::Validation(
                "weekdays must use ISO numbering 1-7".into(),
            ));
        }
        for raw in [&self.active_from_time, &self.active_to_time].into_iter().flatten() {
            parse_hhmm(raw)?;
        }
        Ok(())
    }

    fn satisfied_at(&self, now: DateTime<Utc>) -> PolicyResult<bool> {
        if !self.weekdays.is_empty() {
            let weekday = now.weekday().number_from_monday() as u8;
            if !self.weekdays.contains(&weekday) {
                return Ok(false);
            }
        }
        if self.blackout_dates.contains(&now.date_naive()) {
            return Ok(false);
        }
        let time = now.time();
        match (&self.active_from_time, &self.active_to_time) {
            (Some(from), Some(to)) => {
                let from = parse_hhmm(from)?;
                let to = parse_hhmm(to)?;
                // An inverted window spans midnight.
                Ok(if from <= to {
                    time >= from && time <= to
                } else {
                    time >= from || time <= to
                })
            }
            (Some(from), None) => Ok(time >= parse_hhmm(from)?),
            (None, Some(to)) => Ok(time <= parse_hhmm(to)?),
            (None, None) => Ok(true),
        }
    }
}

fn parse_hhmm(raw: &str) -> PolicyResult<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .map_err(|_| PolicyError::Validation(format!("invalid HH:MM time: {raw}")))
}

/// Predicate selecting which requests a policy applies to. Bindings are
/// OR-ed: one match is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Binding {
    All,
    Actor { actor_id: ActorId },
    ActorType { actor_type: String },
    Role { role: String },
    Currency { currency: String },
    Hierarchy { parent_id: String },
    BusinessUnit { business_unit: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyStage {
    pub stage_no: u32,
    pub min_approvals: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_actor_ids: Vec<ActorId>,
    #[serde(default)]
    pub exclude_maker: bool,
    #[serde(default)]
    pub exclude_previous_approvers: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub escalation_roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub escalation_actor_ids: Vec<ActorId>,
}

/// The stage every request without a matching policy falls back to: one
/// checker, and the maker can never clear their own request.
#[must_use]
pub fn implicit_stage() -> PolicyStage {
    PolicyStage {
        stage_no: 1,
        min_approvals: 1,
        allowed_roles: Vec::new(),
        allowed_actor_ids: Vec::new(),
        exclude_maker: true,
        exclude_previous_approvers: false,
        timeout_minutes: None,
        escalation_roles: Vec::new(),
        escalation_actor_ids: Vec::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    pub id: PolicyId,
    pub name: String,
    /// `None` applies to every approval type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_type: Option<String>,
    /// Lower value wins; ties break on `created_at` ascending.
    pub priority: i32,
    pub state: PolicyState,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_constraints: Option<TimeConstraints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    pub stages: Vec<PolicyStage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<Binding>,
    pub created_at: DateTime<Utc>,
}

impl ApprovalPolicy {
    #[must_use]
    pub fn draft(name: impl Into<String>, approval_type: Option<String>, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            approval_type,
            priority,
            state: PolicyState::Draft,
            version: 1,
            valid_from: None,
            valid_to: None,
            time_constraints: None,
            expiry_minutes: None,
            escalation_minutes: None,
            conditions: Vec::new(),
            stages: vec![implicit_stage()],
            bindings: vec![Binding::All],
            created_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> PolicyResult<()> {
        if self.name.trim().is_empty() {
            return Err(PolicyError::Validation("policy name must be provided".into()));
        }
        if self.stages.is_empty() {
            return Err(PolicyError::Validation(
                "a policy needs at least one stage".into(),
            ));
        }
        for (index, stage) in self.stages.iter().enumerate() {
            if stage.stage_no != (index as u32) + 1 {
                return Err(PolicyError::Validation(
                    "stage numbers must be contiguous starting at 1".into(),
                ));
            }
            if stage.min_approvals == 0 {
                return Err(PolicyError::Validation(
                    "min_approvals must be at least 1".into(),
                ));
            }
        }
        for condition in &self.conditions {
            condition.validate()?;
        }
        if let Some(constraints) = &self.time_constraints {
            constraints.validate()?;
        }
        if let (Some(from), Some(to)) = (self.valid_from, self.valid_to)
            && from > to
        {
            return Err(PolicyError::Validation(
                "valid_from must not be after valid_to".into(),
            ));
        }
        Ok(())
    }
}

/// The request context a policy is matched against. `staff_role` is the
/// maker's role as injected by the auth layer; `payload` is the request
/// body for `payload.<path>` condition fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub approval_type: String,
    pub actor_type: String,
    pub actor_id: ActorId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staff_role: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RequestContext {
    #[must_use]
    pub fn resolve_field(&self, field: &str) -> Option<serde_json::Value> {
        match field {
            "approval_type" => Some(serde_json::Value::String(self.approval_type.clone())),
            "actor_type" => Some(serde_json::Value::String(self.actor_type.clone())),
            "actor_id" => Some(serde_json::Value::String(self.actor_id.clone())),
            "staff_role" => self
                .staff_role
                .clone()
                .map(serde_json::Value::String),
            _ => field.strip_prefix("payload.").and_then(|path| {
                let mut cursor = &self.payload;
                for segment in path.split('.') {
                    cursor = cursor.get(segment)?;
                }
                Some(cursor.clone())
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchFailure {
    TypeMismatch,
    OutsideValidityWindow,
    TimeConstraintNotMet,
    NoBindingMatched,
    ConditionFailed { field: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyTrace {
    pub policy_id: PolicyId,
    pub policy_name: String,
    pub matched: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<MatchFailure>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    /// First matching policy, or `None` when the implicit single-stage
    /// maker-checker fallback applies.
    pub policy: Option<ApprovalPolicy>,
    pub stages: Vec<PolicyStage>,
    pub trace: Vec<PolicyTrace>,
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn put(&self, policy: ApprovalPolicy) -> PolicyResult<ApprovalPolicy>;
    async fn get(&self, policy_id: &PolicyId) -> PolicyResult<ApprovalPolicy>;
    async fn list(&self) -> PolicyResult<Vec<ApprovalPolicy>>;
    async fn set_state(&self, policy_id: &PolicyId, to: PolicyState) -> PolicyResult<ApprovalPolicy>;
}

#[derive(Default)]
pub struct InMemoryPolicyStore {
    policies: RwLock<HashMap<PolicyId, ApprovalPolicy>>,
}

impl InMemoryPolicyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn put(&self, policy: ApprovalPolicy) -> PolicyResult<ApprovalPolicy> {
        policy.validate()?;
        let mut guard = self.policies.write().await;
        let stored = match guard.get(&policy.id) {
            Some(existing) => {
                let mut updated = policy;
                updated.version = existing.version + 1;
                updated
            }
            None => policy,
        };
        guard.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get(&self, policy_id: &PolicyId) -> PolicyResult<ApprovalPolicy> {
        let guard = self.policies.read().await;
        guard
            .get(policy_id)
            .cloned()
            .ok_or_else(|| PolicyError::NotFound(policy_id.clone()))
    }

    async fn list(&self) -> PolicyResult<Vec<ApprovalPolicy>> {
        let guard = self.policies.read().await;
        let mut policies: Vec<ApprovalPolicy> = guard.values().cloned().collect();
        policies.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(policies)
    }

    async fn set_state(
        &self,
        policy_id: &PolicyId,
        to: PolicyState,
    ) -> PolicyResult<ApprovalPolicy> {
        let mut guard = self.policies.write().await;
        let policy = guard
            .get_mut(policy_id)
            .ok_or_else(|| PolicyError::NotFound(policy_id.clone()))?;
        if !policy.state.can_become(to) {
            return Err(PolicyError::InvalidStateChange {
                from: policy.state,
                to,
            });
        }
        policy.state = to;
        Ok(policy.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DelegationState {
    Active,
    Revoked,
    Expired,
}

/// Time-boxed grant of a delegator's approval authority to a delegate.
/// The delegator's role is captured at creation so role-restricted stages
/// can be satisfied without a directory lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDelegation {
    pub id: DelegationId,
    pub delegator_id: ActorId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegator_role: Option<String>,
    pub delegate_id: ActorId,
    /// `None` covers every approval type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_type: Option<String>,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    pub state: DelegationState,
}

impl ApprovalDelegation {
    fn covers(&self, delegate_id: &str, approval_type: &str, now: DateTime<Utc>) -> bool {
        self.state == DelegationState::Active
            && self.delegate_id == delegate_id
            && self
                .approval_type
                .as_deref()
                .is_none_or(|granted| granted == approval_type)
            && self.valid_from <= now
            && now <= self.valid_to
    }
}

#[async_trait]
pub trait DelegationStore: Send + Sync {
    async fn create(&self, delegation: ApprovalDelegation) -> PolicyResult<ApprovalDelegation>;
    async fn revoke(&self, delegation_id: &DelegationId) -> PolicyResult<ApprovalDelegation>;
    async fn list(&self) -> PolicyResult<Vec<ApprovalDelegation>>;
    /// Marks delegations past their window as expired; returns the count.
    async fn expire_overdue(&self, now: DateTime<Utc>) -> PolicyResult<usize>;
}

#[derive(Default)]
pub struct InMemoryDelegationStore {
    delegations: RwLock<HashMap<DelegationId, ApprovalDelegation>>,
}

impl InMemoryDelegationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DelegationStore for InMemoryDelegationStore {
    async fn create(&self, delegation: ApprovalDelegation) -> PolicyResult<ApprovalDelegation> {
        if delegation.delegator_id == delegation.delegate_id {
            return Err(PolicyError::Validation(
                "delegator and delegate must differ".into(),
            ));
        }
        if delegation.valid_from > delegation.valid_to {
            return Err(PolicyError::Validation(
                "delegation window is inverted".into(),
            ));
        }
        let mut guard = self.delegations.write().await;
        guard.insert(delegation.id.clone(), delegation.clone());
        Ok(delegation)
    }

    async fn revoke(&self, delegation_id: &DelegationId) -> PolicyResult<ApprovalDelegation> {
        let mut guard = self.delegations.write().await;
        let delegation = guard
            .get_mut(delegation_id)
            .ok_or_else(|| PolicyError::NotFound(delegation_id.clone()))?;
        delegation.state = DelegationState::Revoked;
        Ok(delegation.clone())
    }

    async fn list(&self) -> PolicyResult<Vec<ApprovalDelegation>> {
        let guard = self.delegations.read().await;
        let mut delegations: Vec<ApprovalDelegation> = guard.values().cloned().collect();
        delegations.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(delegations)
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> PolicyResult<usize> {
        let mut guard = self.delegations.write().await;
        let mut expired = 0;
        for delegation in guard.values_mut() {
            if delegation.state == DelegationState::Active && delegation.valid_to < now {
                delegation.state = DelegationState::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageAuthorization {
    Allowed {
        /// Set when the decider acts through a delegation rather than their
        /// own role or listing.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        via_delegation: Option<DelegationId>,
    },
    DeniedMakerChecker,
    DeniedPreviousApprover,
    DeniedNotEligible,
}

impl StageAuthorization {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, StageAuthorization::Allowed { .. })
    }
}

#[derive(Clone)]
pub struct PolicyEngine {
    store: Arc<dyn PolicyStore>,
    delegations: Arc<dyn DelegationStore>,
}

impl PolicyEngine {
    pub fn new(store: Arc<dyn PolicyStore>, delegations: Arc<dyn DelegationStore>) -> Self {
        Self { store, delegations }
    }

    /// Finds the first ACTIVE policy matching the request, recording a
    /// per-policy trace for the explain surface. The evaluation order per
    /// policy is fixed: type, validity window, time constraints, bindings
    /// (OR), conditions (AND); the first failing step short-circuits.
    pub async fn evaluate(
        &self,
        context: &RequestContext,
        now: DateTime<Utc>,
    ) -> PolicyResult<MatchOutcome> {
        let mut candidates: Vec<ApprovalPolicy> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|policy| policy.state == PolicyState::Active)
            .collect();
        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        let mut trace = Vec::with_capacity(candidates.len());
        let mut matched: Option<ApprovalPolicy> = None;
        for policy in candidates {
            let failure = Self::match_policy(&policy, context, now)?;
            let hit = failure.is_none();
            trace.push(PolicyTrace {
                policy_id: policy.id.clone(),
                policy_name: policy.name.clone(),
                matched: hit,
                failure,
            });
            if hit && matched.is_none() {
                matched = Some(policy);
            }
        }

        let stages = matched
            .as_ref()
            .map(|policy| policy.stages.clone())
            .unwrap_or_else(|| vec![implicit_stage()]);
        Ok(MatchOutcome {
            policy: matched,
            stages,
            trace,
        })
    }

    /// Dry-run evaluation for the simulation endpoint; identical to
    /// `evaluate` and side-effect free by construction.
    pub async fn simulate(
        &self,
        context: &RequestContext,
        now: DateTime<Utc>,
    ) -> PolicyResult<MatchOutcome> {
        self.evaluate(context, now).await
    }

    fn match_policy(
        policy: &ApprovalPolicy,
        context: &RequestContext,
        now: DateTime<Utc>,
    ) -> PolicyResult<Option<MatchFailure>> {
        if policy
            .approval_type
            .as_deref()
            .is_some_and(|bound| bound != context.approval_type)
        {
            return Ok(Some(MatchFailure::TypeMismatch));
        }

        if policy.valid_from.is_some_and(|from| now < from)
            || policy.valid_to.is_some_and(|to| now > to)
        {
            return Ok(Some(MatchFailure::OutsideValidityWindow));
        }
        if let Some(constraints) = &policy.time_constraints
            && !constraints.satisfied_at(now)?
        {
            return Ok(Some(MatchFailure::TimeConstraintNotMet));
        }

        if !policy.bindings.is_empty()
            && !policy
                .bindings
                .iter()
                .any(|binding| Self::binding_matches(binding, context))
        {
            return Ok(Some(MatchFailure::NoBindingMatched));
        }

        for condition in &policy.conditions {
            let resolved = context.resolve_field(&condition.field);
            if !condition.matches(resolved.as_ref()) {
                return Ok(Some(MatchFailure::ConditionFailed {
                    field: condition.field.clone(),
                }));
            }
        }

        Ok(None)
    }

    fn binding_matches(binding: &Binding, context: &RequestContext) -> bool {
        match binding {
            Binding::All => true,
            Binding::Actor { actor_id } => actor_id == &context.actor_id,
            Binding::ActorType { actor_type } => actor_type == &context.actor_type,
            Binding::Role { role } => context.staff_role.as_deref() == Some(role.as_str()),
            Binding::Currency { currency } => context
                .payload
                .get("currency")
                .and_then(serde_json::Value::as_str)
                == Some(currency.as_str()),
            Binding::Hierarchy { parent_id } => {
                let payload = &context.payload;
                payload.get("parent_id").and_then(serde_json::Value::as_str)
                    == Some(parent_id.as_str())
                    || payload.get("merchant_id").and_then(serde_json::Value::as_str)
                        == Some(parent_id.as_str())
            }
            Binding::BusinessUnit { business_unit } => context
                .payload
                .get("business_unit")
                .and_then(serde_json::Value::as_str)
                == Some(business_unit.as_str()),
        }
    }

    /// Decides whether `decider` may act on the given stage. Checks run in
    /// order: maker exclusion, previous-approver exclusion, direct role or
    /// actor listing, then an active delegation granting the delegator's
    /// authority. The decider of record is always the acting actor.
    pub async fn authorize_stage(
        &self,
        stage: &PolicyStage,
        approval_type: &str,
        decider_id: &str,
        decider_role: Option<&str>,
        maker_id: &str,
        previous_deciders: &[ActorId],
        now: DateTime<Utc>,
    ) -> PolicyResult<StageAuthorization> {
        if stage.exclude_maker && decider_id == maker_id {
            return Ok(StageAuthorization::DeniedMakerChecker);
        }
        if stage.exclude_previous_approvers
            && previous_deciders.iter().any(|previous| previous == decider_id)
        {
            return Ok(StageAuthorization::DeniedPreviousApprover);
        }

        if Self::listing_allows(stage, decider_id, decider_role) {
            return Ok(StageAuthorization::Allowed {
                via_delegation: None,
            });
        }

        for delegation in self.delegations.list().await? {
            if delegation.covers(decider_id, approval_type, now)
                && Self::listing_allows(
                    stage,
                    &delegation.delegator_id,
                    delegation.delegator_role.as_deref(),
                )
            {
                return Ok(StageAuthorization::Allowed {
                    via_delegation: Some(delegation.id),
                });
            }
        }

        Ok(StageAuthorization::DeniedNotEligible)
    }

    fn listing_allows(stage: &PolicyStage, actor_id: &str, role: Option<&str>) -> bool {
        let role_ok = stage.allowed_roles.is_empty()
            || role.is_some_and(|role| stage.allowed_roles.iter().any(|allowed| allowed == role));
        let actor_ok = stage.allowed_actor_ids.is_empty()
            || stage.allowed_actor_ids.iter().any(|allowed| allowed == actor_id);
        role_ok && actor_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn bare_engine() -> (PolicyEngine, Arc<InMemoryDelegationStore>) {
        let delegations = Arc::new(InMemoryDelegationStore::new());
        let engine = PolicyEngine::new(Arc::new(InMemoryPolicyStore::new()), delegations.clone());
        (engine, delegations)
    }

    async fn seed(engine_store: &Arc<InMemoryPolicyStore>, mut policy: ApprovalPolicy) -> ApprovalPolicy {
        policy.state = PolicyState::Active;
        engine_store.put(policy).await.expect("policy saved")
    }

    fn context(approval_type: &str, actor_id: &str) -> RequestContext {
        RequestContext {
            approval_type: approval_type.into(),
            actor_type: "STAFF".into(),
            actor_id: actor_id.into(),
            staff_role: Some("ops".into()),
            payload: json!({"amount": "250.00", "currency": "BBD"}),
        }
    }

    fn reversal_policy(name: &str, priority: i32) -> ApprovalPolicy {
        let mut policy = ApprovalPolicy::draft(name, Some("REVERSAL_REQUESTED".into()), priority);
        policy.bindings = vec![Binding::All];
        policy
    }

    #[tokio::test]
    async fn first_match_wins_by_priority_then_created_at() {
        let store = Arc::new(InMemoryPolicyStore::new());
        let delegations = Arc::new(InMemoryDelegationStore::new());
        let engine = PolicyEngine::new(store.clone(), delegations);

        let mut low = reversal_policy("low-priority", 10);
        low.created_at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().expect("ts");
        let mut older = reversal_policy("older", 1);
        older.created_at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().expect("ts");
        let mut newer = reversal_policy("newer", 1);
        newer.created_at = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).single().expect("ts");

        for policy in [low, newer, older] {
            seed(&store, policy).await;
        }

        let outcome = engine
            .evaluate(&context("REVERSAL_REQUESTED", "staff-1"), Utc::now())
            .await
            .expect("evaluation");
        let matched = outcome.policy.expect("a policy matches");
        assert_eq!(matched.name, "older");
        assert_eq!(outcome.trace.len(), 3);
        assert!(outcome.trace.iter().all(|trace| trace.matched));
    }

    #[tokio::test]
    async fn evaluation_short_circuits_with_reasons() {
        let store = Arc::new(InMemoryPolicyStore::new());
        let delegations = Arc::new(InMemoryDelegationStore::new());
        let engine = PolicyEngine::new(store.clone(), delegations);

        let mut wrong_type = reversal_policy("wrong-type", 1);
        wrong_type.approval_type = Some("OVERDRAFT_APPROVAL".into());

        let mut stale = reversal_policy("stale", 2);
        stale.valid_to = Some(Utc::now() - Duration::days(1));

        let mut unbound = reversal_policy("unbound", 3);
        unbound.bindings = vec![Binding::Actor {
            actor_id: "someone-else".into(),
        }];

        let mut conditional = reversal_policy("conditional", 4);
        conditional.conditions = vec![Condition {
            field: "payload.amount".into(),
            operator: ConditionOperator::Gt,
            value: json!("1000.00"),
        }];

        for policy in [wrong_type, stale, unbound, conditional] {
            seed(&store, policy).await;
        }

        let outcome = engine
            .evaluate(&context("REVERSAL_REQUESTED", "staff-1"), Utc::now())
            .await
            .expect("evaluation");
        assert!(outcome.policy.is_none());
        assert_eq!(outcome.stages, vec![implicit_stage()]);

        let failures: Vec<Option<MatchFailure>> = outcome
            .trace
            .iter()
            .map(|trace| trace.failure.clone())
            .collect();
        assert_eq!(
            failures,
            vec![
                Some(MatchFailure::TypeMismatch),
                Some(MatchFailure::OutsideValidityWindow),
                Some(MatchFailure::NoBindingMatched),
                Some(MatchFailure::ConditionFailed {
                    field: "payload.amount".into()
                }),
            ]
        );
    }

    #[tokio::test]
    async fn typeless_policies_apply_to_every_type() {
        let store = Arc::new(InMemoryPolicyStore::new());
        let delegations = Arc::new(InMemoryDelegationStore::new());
        let engine = PolicyEngine::new(store.clone(), delegations);

        let mut catch_all = ApprovalPolicy::draft("catch-all", None, 100);
        catch_all.bindings = vec![Binding::All];
        seed(&store, catch_all).await;

        let outcome = engine
            .evaluate(&context("ANY_TYPE", "staff-1"), Utc::now())
            .await
            .expect("evaluation");
        assert_eq!(outcome.policy.expect("match").name, "catch-all");
    }

    #[tokio::test]
    async fn time_constraints_gate_matching() {
        let store = Arc::new(InMemoryPolicyStore::new());
        let delegations = Arc::new(InMemoryDelegationStore::new());
        let engine = PolicyEngine::new(store.clone(), delegations);

        let mut office_hours = reversal_policy("office-hours", 1);
        office_hours.time_constraints = Some(TimeConstraints {
            weekdays: vec![1, 2, 3, 4, 5],
            active_from_time: Some("09:00".into()),
            active_to_time: Some("17:00".into()),
            blackout_dates: vec![NaiveDate::from_ymd_opt(2025, 12, 25).expect("date")],
        });
        seed(&store, office_hours).await;

        // Wednesday inside the window.
        let wednesday_noon = Utc.with_ymd_and_hms(2025, 7, 2, 12, 0, 0).single().expect("ts");
        let outcome = engine
            .evaluate(&context("REVERSAL_REQUESTED", "staff-1"), wednesday_noon)
            .await
            .expect("evaluation");
        assert!(outcome.policy.is_some());

        // Saturday.
        let saturday = Utc.with_ymd_and_hms(2025, 7, 5, 12, 0, 0).single().expect("ts");
        let outcome = engine
            .evaluate(&context("REVERSAL_REQUESTED", "staff-1"), saturday)
            .await
            .expect("evaluation");
        assert_eq!(outcome.trace[0].failure, Some(MatchFailure::TimeConstraintNotMet));

        // Blackout date on a Thursday.
        let blackout = Utc.with_ymd_and_hms(2025, 12, 25, 12, 0, 0).single().expect("ts");
        let outcome = engine
            .evaluate(&context("REVERSAL_REQUESTED", "staff-1"), blackout)
            .await
            .expect("evaluation");
        assert_eq!(outcome.trace[0].failure, Some(MatchFailure::TimeConstraintNotMet));
    }

    #[tokio::test]
    async fn bindings_are_or_combined() {
        let store = Arc::new(InMemoryPolicyStore::new());
        let delegations = Arc::new(InMemoryDelegationStore::new());
        let engine = PolicyEngine::new(store.clone(), delegations);

        let mut bound = reversal_policy("bound", 1);
        bound.bindings = vec![
            Binding::Actor {
                actor_id: "nobody".into(),
            },
            Binding::Currency {
                currency: "BBD".into(),
            },
        ];
        seed(&store, bound).await;

        let outcome = engine
            .evaluate(&context("REVERSAL_REQUESTED", "staff-1"), Utc::now())
            .await
            .expect("evaluation");
        assert!(outcome.policy.is_some(), "currency binding should match");
    }

    #[tokio::test]
    async fn stage_authorization_enforces_maker_checker() {
        let (engine, _delegations) = bare_engine();
        let mut stage = implicit_stage();
        stage.exclude_maker = true;

        let denied = engine
            .authorize_stage(
                &stage,
                "REVERSAL_REQUESTED",
                "staff-1",
                Some("ops"),
                "staff-1",
                &[],
                Utc::now(),
            )
            .await
            .expect("authorization");
        assert_eq!(denied, StageAuthorization::DeniedMakerChecker);

        let allowed = engine
            .authorize_stage(
                &stage,
                "REVERSAL_REQUESTED",
                "staff-2",
                Some("ops"),
                "staff-1",
                &[],
                Utc::now(),
            )
            .await
            .expect("authorization");
        assert!(allowed.is_allowed());
    }

    #[tokio::test]
    async fn stage_authorization_excludes_previous_approvers() {
        let (engine, _delegations) = bare_engine();
        let mut stage = implicit_stage();
        stage.exclude_previous_approvers = true;

        let denied = engine
            .authorize_stage(
                &stage,
                "REVERSAL_REQUESTED",
                "staff-2",
                Some("ops"),
                "staff-1",
                &["staff-2".into()],
                Utc::now(),
            )
            .await
            .expect("authorization");
        assert_eq!(denied, StageAuthorization::DeniedPreviousApprover);
    }

    #[tokio::test]
    async fn role_and_actor_listings_are_conjunctive() {
        let (engine, _delegations) = bare_engine();
        let mut stage = implicit_stage();
        stage.allowed_roles = vec!["supervisor".into()];
        stage.allowed_actor_ids = vec!["staff-9".into()];

        let wrong_role = engine
            .authorize_stage(
                &stage,
                "REVERSAL_REQUESTED",
                "staff-9",
                Some("ops"),
                "maker",
                &[],
                Utc::now(),
            )
            .await
            .expect("authorization");
        assert_eq!(wrong_role, StageAuthorization::DeniedNotEligible);

        let allowed = engine
            .authorize_stage(
                &stage,
                "REVERSAL_REQUESTED",
                "staff-9",
                Some("supervisor"),
                "maker",
                &[],
                Utc::now(),
            )
            .await
            .expect("authorization");
        assert!(allowed.is_allowed());
    }

    #[tokio::test]
    async fn delegation_grants_the_delegators_listing() {
        let (engine, delegations) = bare_engine();
        let mut stage = implicit_stage();
        stage.allowed_actor_ids = vec!["supervisor-1".into()];

        let direct_denied = engine
            .authorize_stage(
                &stage,
                "REVERSAL_REQUESTED",
                "deputy-1",
                Some("ops"),
                "maker",
                &[],
                Utc::now(),
            )
            .await
            .expect("authorization");
        assert_eq!(direct_denied, StageAuthorization::DeniedNotEligible);

        let delegation = delegations
            .create(ApprovalDelegation {
                id: "del-1".into(),
                delegator_id: "supervisor-1".into(),
                delegator_role: Some("supervisor".into()),
                delegate_id: "deputy-1".into(),
                approval_type: Some("REVERSAL_REQUESTED".into()),
                valid_from: Utc::now() - Duration::hours(1),
                valid_to: Utc::now() + Duration::hours(1),
                state: DelegationState::Active,
            })
            .await
            .expect("delegation saved");

        let allowed = engine
            .authorize_stage(
                &stage,
                "REVERSAL_REQUESTED",
                "deputy-1",
                Some("ops"),
                "maker",
                &[],
                Utc::now(),
            )
            .await
            .expect("authorization");
        assert_eq!(
            allowed,
            StageAuthorization::Allowed {
                via_delegation: Some(delegation.id.clone()),
            }
        );

        // Revocation and expiry both cut the grant off.
        delegations.revoke(&delegation.id).await.expect("revoked");
        let denied = engine
            .authorize_stage(
                &stage,
                "REVERSAL_REQUESTED",
                "deputy-1",
                Some("ops"),
                "maker",
                &[],
                Utc::now(),
            )
            .await
            .expect("authorization");
        assert_eq!(denied, StageAuthorization::DeniedNotEligible);
    }

    #[tokio::test]
    async fn delegation_expiry_sweep_marks_overdue() {
        let store = Arc::new(InMemoryDelegationStore::new());
        store
            .create(ApprovalDelegation {
                id: "del-1".into(),
                delegator_id: "a".into(),
                delegator_role: None,
                delegate_id: "b".into(),
                approval_type: None,
                valid_from: Utc::now() - Duration::days(2),
                valid_to: Utc::now() - Duration::days(1),
                state: DelegationState::Active,
            })
            .await
            .expect("delegation saved");

        let expired = store.expire_overdue(Utc::now()).await.expect("sweep");
        assert_eq!(expired, 1);
        let listed = store.list().await.expect("list");
        assert_eq!(listed[0].state, DelegationState::Expired);
    }

    #[tokio::test]
    async fn policy_state_changes_are_guarded() {
        let store = InMemoryPolicyStore::new();
        let policy = store
            .put(ApprovalPolicy::draft("draft", None, 1))
            .await
            .expect("saved");

        store
            .set_state(&policy.id, PolicyState::Active)
            .await
            .expect("activation");
        store
            .set_state(&policy.id, PolicyState::Inactive)
            .await
            .expect("deactivation");
        store
            .set_state(&policy.id, PolicyState::Archived)
            .await
            .expect("archive");

        let err = store
            .set_state(&policy.id, PolicyState::Active)
            .await
            .expect_err("archived is terminal");
        assert!(matches!(err, PolicyError::InvalidStateChange { .. }));
    }

    #[tokio::test]
    async fn persistence_rejects_malformed_policies() {
        let store = InMemoryPolicyStore::new();

        let mut no_stages = ApprovalPolicy::draft("broken", None, 1);
        no_stages.stages.clear();
        assert!(store.put(no_stages).await.is_err());

        let mut bad_weekday = ApprovalPolicy::draft("broken", None, 1);
        bad_weekday.time_constraints = Some(TimeConstraints {
            weekdays: vec![0],
            ..TimeConstraints::default()
        });
        assert!(store.put(bad_weekday).await.is_err());

        let mut bad_condition = ApprovalPolicy::draft("broken", None, 1);
        bad_condition.conditions = vec![Condition {
            field: "amount".into(),
            operator: ConditionOperator::Between,
            value: json!([1]),
        }];
        assert!(store.put(bad_condition).await.is_err());
    }

    #[tokio::test]
    async fn updates_bump_the_version() {
        let store = InMemoryPolicyStore::new();
        let policy = store
            .put(ApprovalPolicy::draft("versioned", None, 1))
            .await
            .expect("saved");
        assert_eq!(policy.version, 1);

        let updated = store.put(policy).await.expect("updated");
        assert_eq!(updated.version, 2);
    }

    #[test]
    fn time_constraints_reject_unknown_fields() {
        let raw = r#"{"weekdays": [1], "surprise": true}"#;
        assert!(serde_json::from_str::<TimeConstraints>(raw).is_err());
    }

    #[test]
    fn overnight_windows_wrap_midnight() {
        let constraints = TimeConstraints {
            weekdays: Vec::new(),
            active_from_time: Some("22:00".into()),
            active_to_time: Some("02:00".into()),
            blackout_dates: Vec::new(),
        };
        let late = Utc.with_ymd_and_hms(2025, 7, 2, 23, 0, 0).single().expect("ts");
        let early = Utc.with_ymd_and_hms(2025, 7, 2, 1, 0, 0).single().expect("ts");
        let midday = Utc.with_ymd_and_hms(2025, 7, 2, 12, 0, 0).single().expect("ts");
        assert!(constraints.satisfied_at(late).expect("check"));
        assert!(constraints.satisfied_at(early).expect("check"));
        assert!(!constraints.satisfied_at(midday).expect("check"));
    }

    #[test]
    fn payload_paths_resolve_nested_fields() {
        let context = RequestContext {
            approval_type: "X".into(),
            actor_type: "STAFF".into(),
            actor_id: "s-1".into(),
            staff_role: None,
            payload: json!({"transfer": {"amount": "10.00"}}),
        };
        assert_eq!(
            context.resolve_field("payload.transfer.amount"),
            Some(json!("10.00"))
        );
        assert_eq!(context.resolve_field("payload.transfer.missing"), None);
        assert_eq!(context.resolve_field("staff_role"), None);
        assert_eq!(context.resolve_field("actor_id"), Some(json!("s-1")));
    }
}
