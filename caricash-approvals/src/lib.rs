#![deny(clippy::print_stdout, clippy::print_stderr)]

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
use tracing::warn;
use uuid::Uuid;

use caricash_events::AuditDraft;
use caricash_events::AuditLog;
use caricash_events::EventDraft;
use caricash_events::EventSink;
use caricash_policy::ActorId;
use caricash_policy::PolicyEngine;
use caricash_policy::PolicyError;
use caricash_policy::PolicyId;
use caricash_policy::PolicyStage;
use caricash_policy::RequestContext;
use caricash_policy::StageAuthorization;

pub type RequestId = String;

pub type ApprovalsResult<T> = Result<T, ApprovalsError>;

#[derive(Debug, Error)]
pub enum ApprovalsError {
    #[error("approval request not found: {0}")]
    NotFound(String),
    #[error("approval request is finalized and cannot transition")]
    Finalized,
    #[error("maker and checker must differ")]
    MakerCheckerRequired,
    #[error("actor is not eligible to decide this stage")]
    Forbidden,
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("handler failure: {0}")]
    Handler(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Pending,
    Approved,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    StagePending,
    StageEscalated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Approve,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDecision {
    pub stage_no: u32,
    pub decision: Decision,
    pub decider_id: ActorId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decider_role: Option<String>,
    /// Set when the decider acted through a delegation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via_delegation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: RequestId,
    pub approval_type: String,
    pub payload: serde_json::Value,
    pub maker_id: ActorId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maker_role: Option<String>,
    pub state: RequestState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<PolicyId>,
    /// 1-based index of the stage currently collecting decisions.
    pub current_stage: u32,
    pub total_stages: u32,
    pub workflow_state: WorkflowState,
    pub correlation_id: String,
    pub stages: Vec<PolicyStage>,
    pub decisions: Vec<StageDecision>,
    pub created_at: DateTime<Utc>,
    pub stage_started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    /// Populated when the final-approval handler raised instead of
    /// completing; the approval itself stands and the side effect is
    /// retried out-of-band.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_error: Option<String>,
}

impl ApprovalRequest {
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        !matches!(self.state, RequestState::Pending)
    }

    fn current_stage_spec(&self) -> ApprovalsResult<&PolicyStage> {
        self.stages
            .get((self.current_stage as usize).saturating_sub(1))
            .ok_or_else(|| ApprovalsError::Validation("missing stage specification".into()))
    }

    fn approvals_at_current_stage(&self) -> u32 {
        self.decisions
            .iter()
            .filter(|decision| {
                decision.stage_no == self.current_stage && decision.decision == Decision::Approve
            })
            .count() as u32
    }

    fn approve_deciders(&self) -> Vec<ActorId> {
        self.decisions
            .iter()
            .filter(|decision| decision.decision == Decision::Approve)
            .map(|decision| decision.decider_id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionInput {
    pub decider_id: ActorId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decider_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFilter {
    pub approval_type: Option<String>,
    pub state: Option<RequestState>,
    pub maker_id: Option<ActorId>,
}

impl RequestFilter {
    fn matches(&self, request: &ApprovalRequest) -> bool {
        self.approval_type
            .as_deref()
            .is_none_or(|approval_type| request.approval_type == approval_type)
            && self.state.is_none_or(|state| request.state == state)
            && self
                .maker_id
                .as_deref()
                .is_none_or(|maker| request.maker_id == maker)
    }
}

/// Side effect executed when a request reaches its terminal decision.
/// A handler without an `on_approve` body is a pure approval gate.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    fn label(&self) -> &str;

    async fn on_approve(&self, _request: &ApprovalRequest) -> ApprovalsResult<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    async fn on_reject(&self, _request: &ApprovalRequest) -> ApprovalsResult<()> {
        Ok(())
    }
}

/// Fallback for approval types registered without a handler.
pub struct GateOnlyHandler {
    label: String,
}

impl GateOnlyHandler {
    #[must_use]
    pub fn new(approval_type: &str) -> Self {
        Self {
            label: format!("gate:{approval_type}"),
        }
    }
}

#[async_trait]
impl ApprovalHandler for GateOnlyHandler {
    fn label(&self) -> &str {
        &self.label
    }
}

pub struct ApprovalWorkflow {
    policy: PolicyEngine,
    requests: RwLock<HashMap<RequestId, ApprovalRequest>>,
    handlers: RwLock<HashMap<String, Arc<dyn ApprovalHandler>>>,
    events: Arc<dyn EventSink>,
    audit: Arc<dyn AuditLog>,
}

impl ApprovalWorkflow {
    pub fn new(policy: PolicyEngine, events: Arc<dyn EventSink>, audit: Arc<dyn AuditLog>) -> Self {
        Self {
            policy,
            requests: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            events,
            audit,
        }
    }

    pub async fn register_handler(&self, approval_type: &str, handler: Arc<dyn ApprovalHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.insert(approval_type.to_owned(), handler);
    }

    async fn handler_for(&self, approval_type: &str) -> Arc<dyn ApprovalHandler> {
        let handlers = self.handlers.read().await;
        handlers
            .get(approval_type)
            .cloned()
            .unwrap_or_else(|| Arc::new(GateOnlyHandler::new(approval_type)))
    }

    /// Opens a request: the policy engine picks the stage plan, or the
    /// implicit single-checker stage when nothing matches.
    pub async fn create(
        &self,
        context: RequestContext,
        correlation_id: String,
    ) -> ApprovalsResult<ApprovalRequest> {
        if context.approval_type.trim().is_empty() {
            return Err(ApprovalsError::Validation(
                "approval_type must be provided".into(),
            ));
        }
        let now = Utc::now();
        let outcome = self.policy.evaluate(&context, now).await?;
        let expires_at = outcome
            .policy
            .as_ref()
            .and_then(|policy| policy.expiry_minutes)
            .map(|minutes| now + Duration::minutes(minutes));

        let request = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            approval_type: context.approval_type.clone(),
            payload: context.payload.clone(),
            maker_id: context.actor_id.clone(),
            maker_role: context.staff_role.clone(),
            state: RequestState::Pending,
            policy_id: outcome.policy.as_ref().map(|policy| policy.id.clone()),
            current_stage: 1,
            total_stages: outcome.stages.len() as u32,
            workflow_state: WorkflowState::StagePending,
            correlation_id: correlation_id.clone(),
            stages: outcome.stages,
            decisions: Vec::new(),
            created_at: now,
            stage_started_at: now,
            expires_at,
            decided_at: None,
            handler_error: None,
        };

        {
            let mut requests = self.requests.write().await;
            requests.insert(request.id.clone(), request.clone());
        }

        self.emit(
            "APPROVAL_REQUESTED",
            &request,
            serde_json::json!({"total_stages": request.total_stages}),
        )
        .await;
        self.record_audit("APPROVAL_REQUESTED", &request.maker_id, &request, None)
            .await;
        Ok(request)
    }

    pub async fn get(&self, request_id: &RequestId) -> ApprovalsResult<ApprovalRequest> {
        let requests = self.requests.read().await;
        requests
            .get(request_id)
            .cloned()
            .ok_or_else(|| ApprovalsError::NotFound(request_id.clone()))
    }

    pub async fn list(&self, filter: RequestFilter) -> Vec<ApprovalRequest> {
        let requests = self.requests.read().await;
        let mut matched: Vec<ApprovalRequest> = requests
            .values()
            .filter(|request| filter.matches(request))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        matched
    }

    async fn authorize(
        &self,
        request: &ApprovalRequest,
        input: &DecisionInput,
        now: DateTime<Utc>,
    ) -> ApprovalsResult<Option<String>> {
        let stage = request.current_stage_spec()?;
        let previous = request.approve_deciders();
        let authorization = self
            .policy
            .authorize_stage(
                stage,
                &request.approval_type,
                &input.decider_id,
                input.decider_role.as_deref(),
                &request.maker_id,
                &previous,
                now,
            )
            .await?;
        match authorization {
            StageAuthorization::Allowed { via_delegation } => Ok(via_delegation),
            StageAuthorization::DeniedMakerChecker => Err(ApprovalsError::MakerCheckerRequired),
            StageAuthorization::DeniedPreviousApprover | StageAuthorization::DeniedNotEligible => {
                Err(ApprovalsError::Forbidden)
            }
        }
    }

    /// Records one APPROVE decision. When the stage reaches its
    /// `min_approvals` the request advances; approval of the final stage
    /// finalizes it and dispatches the registered handler.
    pub async fn approve(
        &self,
        request_id: &RequestId,
        input: DecisionInput,
    ) -> ApprovalsResult<ApprovalRequest> {
        let now = Utc::now();
        let (request, finalized) = {
            let mut requests = self.requests.write().await;
            let request = requests
                .get_mut(request_id)
                .ok_or_else(|| ApprovalsError::NotFound(request_id.clone()))?;
            if request.is_finalized() {
                return Err(ApprovalsError::Finalized);
            }
            let via_delegation = self.authorize(request, &input, now).await?;

            request.decisions.push(StageDecision {
                stage_no: request.current_stage,
                decision: Decision::Approve,
                decider_id: input.decider_id.clone(),
                decider_role: input.decider_role.clone(),
                via_delegation,
                reason: input.reason.clone(),
                decided_at: now,
            });

            let stage = request.current_stage_spec()?.clone();
            let mut finalized = false;
            if request.approvals_at_current_stage() >= stage.min_approvals {
                if request.current_stage < request.total_stages {
                    request.current_stage += 1;
                    request.workflow_state = WorkflowState::StagePending;
                    request.stage_started_at = now;
                } else {
                    request.state = RequestState::Approved;
                    request.decided_at = Some(now);
                    finalized = true;
                }
            }
            (request.clone(), finalized)
        };

        self.emit(
            "APPROVAL_STAGE_DECISION",
            &request,
            serde_json::json!({"stage": request.current_stage, "decision": "APPROVE"}),
        )
        .await;
        self.record_audit(
            "APPROVAL_STAGE_DECISION",
            &input.decider_id,
            &request,
            input.reason.as_deref(),
        )
        .await;

        if finalized {
            let handler = self.handler_for(&request.approval_type).await;
            let handler_error = match handler.on_approve(&request).await {
                Ok(_) => None,
                Err(err) => {
                    warn!(
                        request_id = %request.id,
                        handler = handler.label(),
                        error = %err,
                        "approval handler failed after finalization"
                    );
                    Some(err.to_string())
                }
            };
            let request = {
                let mut requests = self.requests.write().await;
                if let Some(stored) = requests.get_mut(&request.id) {
                    stored.handler_error = handler_error;
                    stored.clone()
                } else {
                    request
                }
            };
            self.emit("APPROVAL_APPROVED", &request, serde_json::Value::Null)
                .await;
            self.record_audit("APPROVAL_APPROVED", &input.decider_id, &request, None)
                .await;
            return Ok(request);
        }

        Ok(request)
    }

    /// A single rejection terminates the request regardless of stage
    /// progress.
    pub async fn reject(
        &self,
        request_id: &RequestId,
        input: DecisionInput,
    ) -> ApprovalsResult<ApprovalRequest> {
        let now = Utc::now();
        let request = {
            let mut requests = self.requests.write().await;
            let request = requests
                .get_mut(request_id)
                .ok_or_else(|| ApprovalsError::NotFound(request_id.clone()))?;
            if request.is_finalized() {
                return Err(ApprovalsError::Finalized);
            }
            let via_delegation = self.authorize(request, &input, now).await?;

            request.decisions.push(StageDecision {
                stage_no: request.current_stage,
                decision: Decision::Reject,
                decider_id: input.decider_id.clone(),
                decider_role: input.decider_role.clone(),
                via_delegation,
                reason: input.reason.clone(),
                decided_at: now,
            });
            request.state = RequestState::Rejected;
            request.decided_at = Some(now);
            request.clone()
        };

        let handler = self.handler_for(&request.approval_type).await;
        if let Err(err) = handler.on_reject(&request).await {
            warn!(request_id = %request.id, error = %err, "reject handler failed");
        }

        self.emit("APPROVAL_REJECTED", &request, serde_json::Value::Null)
            .await;
        self.record_audit(
            "APPROVAL_REJECTED",
            &input.decider_id,
            &request,
            input.reason.as_deref(),
        )
        .await;
        Ok(request)
    }

    /// Sweeps pending requests: stage timeouts move the workflow into
    /// escalation (notifying the stage's escalation listing); a request
    /// past its own expiry becomes EXPIRED.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> ApprovalsResult<Vec<ApprovalRequest>> {
        let mut touched = Vec::new();
        let snapshots: Vec<ApprovalRequest> = {
            let mut requests = self.requests.write().await;
            let mut changed = Vec::new();
            for request in requests.values_mut() {
                if request.is_finalized() {
                    continue;
                }
                if request.expires_at.is_some_and(|deadline| deadline <= now) {
                    request.state = RequestState::Expired;
                    request.decided_at = Some(now);
                    changed.push(request.clone());
                    continue;
                }
                if request.workflow_state == WorkflowState::StagePending
                    && let Ok(stage) = request.current_stage_spec()
                    && let Some(timeout) = stage.timeout_minutes
                    && request.stage_started_at + Duration::minutes(timeout) <= now
                {
                    request.workflow_state = WorkflowState::StageEscalated;
                    changed.push(request.clone());
                }
            }
            changed
        };

        for request in snapshots {
            match request.state {
                RequestState::Expired => {
                    self.emit("APPROVAL_EXPIRED", &request, serde_json::Value::Null)
                        .await;
                    self.record_audit("APPROVAL_EXPIRED", "system", &request, None)
                        .await;
                }
                _ => {
                    let stage = request.current_stage_spec()?;
                    self.emit(
                        "APPROVAL_STAGE_ESCALATED",
                        &request,
                        serde_json::json!({
                            "stage": request.current_stage,
                            "escalation_roles": stage.escalation_roles,
                            "escalation_actor_ids": stage.escalation_actor_ids,
                        }),
                    )
                    .await;
                    self.record_audit("APPROVAL_STAGE_ESCALATED", "system", &request, None)
                        .await;
                }
            }
            touched.push(request);
        }
        Ok(touched)
    }

    async fn emit(&self, name: &str, request: &ApprovalRequest, payload: serde_json::Value) {
        let draft = EventDraft {
            name: name.into(),
            entity_type: "approval_request".into(),
            entity_id: request.id.clone(),
            correlation_id: request.correlation_id.clone(),
            causation_id: None,
            actor_type: "STAFF".into(),
            actor_id: request.maker_id.clone(),
            payload,
        };
        if let Err(err) = self.events.publish(draft).await {
            warn!(request_id = %request.id, error = %err, "approval event publish failed");
        }
    }

    async fn record_audit(
        &self,
        action: &str,
        actor: &str,
        request: &ApprovalRequest,
        reason: Option<&str>,
    ) {
        let draft = AuditDraft {
            action: action.into(),
            actor: actor.into(),
            target: request.id.clone(),
            before: None,
            after: Some(serde_json::json!({
                "state": request.state,
                "current_stage": request.current_stage,
                "reason": reason,
            })),
            correlation_id: request.correlation_id.clone(),
        };
        if let Err(err) = self.audit.append(draft).await {
            warn!(request_id = %request.id, error = %err, "approval audit append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caricash_events::InMemoryAuditLog;
    use caricash_events::InMemoryEventStore;
    use caricash_policy::ApprovalPolicy;
    use caricash_policy::Binding;
    use caricash_policy::InMemoryDelegationStore;
    use caricash_policy::InMemoryPolicyStore;
    use caricash_policy::PolicyState;
    use caricash_policy::PolicyStore;
    use caricash_policy::implicit_stage;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::Mutex;

    struct Fixture {
        workflow: ApprovalWorkflow,
        policies: Arc<InMemoryPolicyStore>,
    }

    fn fixture() -> Fixture {
        let policies = Arc::new(InMemoryPolicyStore::new());
        let delegations = Arc::new(InMemoryDelegationStore::new());
        let engine = PolicyEngine::new(policies.clone(), delegations);
        let workflow = ApprovalWorkflow::new(
            engine,
            Arc::new(InMemoryEventStore::new()),
            InMemoryAuditLog::shared(),
        );
        Fixture { workflow, policies }
    }

    fn context(approval_type: &str, maker: &str) -> RequestContext {
        RequestContext {
            approval_type: approval_type.into(),
            actor_type: "STAFF".into(),
            actor_id: maker.into(),
            staff_role: Some("ops".into()),
            payload: json!({"journal_id": "j-1", "reason": "duplicate charge"}),
        }
    }

    fn decision(decider: &str) -> DecisionInput {
        DecisionInput {
            decider_id: decider.into(),
            decider_role: Some("supervisor".into()),
            reason: None,
        }
    }

    async fn seed_two_stage_policy(policies: &Arc<InMemoryPolicyStore>) {
        let mut policy = ApprovalPolicy::draft("reversal", Some("REVERSAL_REQUESTED".into()), 1);
        let mut first = implicit_stage();
        first.exclude_maker = true;
        let mut second = implicit_stage();
        second.stage_no = 2;
        second.exclude_previous_approvers = true;
        policy.stages = vec![first, second];
        policy.bindings = vec![Binding::All];
        policy.state = PolicyState::Active;
        policies.put(policy).await.expect("policy saved");
    }

    #[tokio::test]
    async fn create_snapshots_the_stage_plan() {
        let Fixture { workflow, policies } = fixture();
        seed_two_stage_policy(&policies).await;

        let request = workflow
            .create(context("REVERSAL_REQUESTED", "maker-1"), "corr-1".into())
            .await
            .expect("request created");
        assert_eq!(request.state, RequestState::Pending);
        assert_eq!(request.total_stages, 2);
        assert_eq!(request.current_stage, 1);
        assert!(request.policy_id.is_some());
        assert_eq!(request.workflow_state, WorkflowState::StagePending);
    }

    #[tokio::test]
    async fn create_without_policy_falls_back_to_single_checker() {
        let Fixture { workflow, .. } = fixture();
        let request = workflow
            .create(context("UNGOVERNED_TYPE", "maker-1"), "corr-1".into())
            .await
            .expect("request created");
        assert_eq!(request.total_stages, 1);
        assert!(request.policy_id.is_none());

        let err = workflow
            .approve(&request.id, decision("maker-1"))
            .await
            .expect_err("maker cannot self-approve the implicit stage");
        assert!(matches!(err, ApprovalsError::MakerCheckerRequired));
    }

    #[tokio::test]
    async fn maker_cannot_approve_their_own_request() {
        let Fixture { workflow, policies } = fixture();
        seed_two_stage_policy(&policies).await;

        let request = workflow
            .create(context("REVERSAL_REQUESTED", "maker-1"), "corr-1".into())
            .await
            .expect("request created");

        let err = workflow
            .approve(&request.id, decision("maker-1"))
            .await
            .expect_err("maker approval must fail");
        assert!(matches!(err, ApprovalsError::MakerCheckerRequired));

        let unchanged = workflow.get(&request.id).await.expect("request");
        assert!(unchanged.decisions.is_empty());
    }

    #[tokio::test]
    async fn multi_stage_flow_advances_then_finalizes() {
        let Fixture { workflow, policies } = fixture();
        seed_two_stage_policy(&policies).await;

        let request = workflow
            .create(context("REVERSAL_REQUESTED", "maker-1"), "corr-1".into())
            .await
            .expect("request created");

        let after_first = workflow
            .approve(&request.id, decision("checker-1"))
            .await
            .expect("first stage approval");
        assert_eq!(after_first.state, RequestState::Pending);
        assert_eq!(after_first.current_stage, 2);

        // Stage 2 excludes previous approvers.
        let err = workflow
            .approve(&request.id, decision("checker-1"))
            .await
            .expect_err("stage 2 rejects the stage 1 approver");
        assert!(matches!(err, ApprovalsError::Forbidden));

        let finalized = workflow
            .approve(&request.id, decision("checker-2"))
            .await
            .expect("final approval");
        assert_eq!(finalized.state, RequestState::Approved);
        assert!(finalized.decided_at.is_some());

        let err = workflow
            .approve(&request.id, decision("checker-3"))
            .await
            .expect_err("finalized requests take no further decisions");
        assert!(matches!(err, ApprovalsError::Finalized));
    }

    #[tokio::test]
    async fn min_approvals_gate_stage_advancement() {
        let Fixture { workflow, policies } = fixture();
        let mut policy = ApprovalPolicy::draft("dual", Some("DUAL_CONTROL".into()), 1);
        let mut stage = implicit_stage();
        stage.min_approvals = 2;
        policy.stages = vec![stage];
        policy.state = PolicyState::Active;
        policies.put(policy).await.expect("policy saved");

        let request = workflow
            .create(context("DUAL_CONTROL", "maker-1"), "corr-1".into())
            .await
            .expect("request created");

        let after_one = workflow
            .approve(&request.id, decision("checker-1"))
            .await
            .expect("first of two approvals");
        assert_eq!(after_one.state, RequestState::Pending);

        let after_two = workflow
            .approve(&request.id, decision("checker-2"))
            .await
            .expect("second approval finalizes");
        assert_eq!(after_two.state, RequestState::Approved);
        assert_eq!(after_two.decisions.len(), 2);
    }

    #[tokio::test]
    async fn single_rejection_terminates() {
        let Fixture { workflow, policies } = fixture();
        seed_two_stage_policy(&policies).await;

        let request = workflow
            .create(context("REVERSAL_REQUESTED", "maker-1"), "corr-1".into())
            .await
            .expect("request created");

        let rejected = workflow
            .reject(
                &request.id,
                DecisionInput {
                    decider_id: "checker-1".into(),
                    decider_role: Some("supervisor".into()),
                    reason: Some("not a duplicate".into()),
                },
            )
            .await
            .expect("rejection");
        assert_eq!(rejected.state, RequestState::Rejected);

        let err = workflow
            .approve(&request.id, decision("checker-2"))
            .await
            .expect_err("rejected requests are final");
        assert!(matches!(err, ApprovalsError::Finalized));
    }

    #[tokio::test]
    async fn handler_runs_once_on_final_approval() {
        struct CountingHandler {
            calls: Mutex<Vec<RequestId>>,
        }

        #[async_trait]
        impl ApprovalHandler for CountingHandler {
            fn label(&self) -> &str {
                "counting"
            }

            async fn on_approve(
                &self,
                request: &ApprovalRequest,
            ) -> ApprovalsResult<serde_json::Value> {
                self.calls.lock().await.push(request.id.clone());
                Ok(serde_json::Value::Null)
            }
        }

        let Fixture { workflow, .. } = fixture();
        let handler = Arc::new(CountingHandler {
            calls: Mutex::new(Vec::new()),
        });
        workflow
            .register_handler("UNGOVERNED_TYPE", handler.clone())
            .await;

        let request = workflow
            .create(context("UNGOVERNED_TYPE", "maker-1"), "corr-1".into())
            .await
            .expect("request created");
        workflow
            .approve(&request.id, decision("checker-1"))
            .await
            .expect("approval");

        let repeat = workflow
            .approve(&request.id, decision("checker-2"))
            .await
            .expect_err("second approve has no effect");
        assert!(matches!(repeat, ApprovalsError::Finalized));

        let calls = handler.calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], request.id);
    }

    #[tokio::test]
    async fn handler_failure_keeps_the_approval_and_records_the_error() {
        struct FailingHandler;

        #[async_trait]
        impl ApprovalHandler for FailingHandler {
            fn label(&self) -> &str {
                "failing"
            }

            async fn on_approve(
                &self,
                _request: &ApprovalRequest,
            ) -> ApprovalsResult<serde_json::Value> {
                Err(ApprovalsError::Handler("side effect unavailable".into()))
            }
        }

        let Fixture { workflow, .. } = fixture();
        workflow
            .register_handler("UNGOVERNED_TYPE", Arc::new(FailingHandler))
            .await;

        let request = workflow
            .create(context("UNGOVERNED_TYPE", "maker-1"), "corr-1".into())
            .await
            .expect("request created");
        let approved = workflow
            .approve(&request.id, decision("checker-1"))
            .await
            .expect("approval stands");
        assert_eq!(approved.state, RequestState::Approved);
        assert_eq!(
            approved.handler_error.as_deref(),
            Some("handler failure: side effect unavailable")
        );
    }

    #[tokio::test]
    async fn expiry_sweep_expires_and_escalates() {
        let Fixture { workflow, policies } = fixture();

        let mut expiring = ApprovalPolicy::draft("expiring", Some("EXPIRING".into()), 1);
        expiring.expiry_minutes = Some(30);
        expiring.state = PolicyState::Active;
        policies.put(expiring).await.expect("policy saved");

        let mut escalating = ApprovalPolicy::draft("escalating", Some("ESCALATING".into()), 1);
        let mut stage = implicit_stage();
        stage.timeout_minutes = Some(10);
        stage.escalation_roles = vec!["duty-manager".into()];
        escalating.stages = vec![stage];
        escalating.state = PolicyState::Active;
        policies.put(escalating).await.expect("policy saved");

        let expiring_request = workflow
            .create(context("EXPIRING", "maker-1"), "corr-1".into())
            .await
            .expect("request created");
        let escalating_request = workflow
            .create(context("ESCALATING", "maker-1"), "corr-2".into())
            .await
            .expect("request created");

        let touched = workflow
            .expire_overdue(Utc::now() + Duration::hours(1))
            .await
            .expect("sweep");
        assert_eq!(touched.len(), 2);

        let expired = workflow.get(&expiring_request.id).await.expect("request");
        assert_eq!(expired.state, RequestState::Expired);

        let escalated = workflow.get(&escalating_request.id).await.expect("request");
        assert_eq!(escalated.state, RequestState::Pending);
        assert_eq!(escalated.workflow_state, WorkflowState::StageEscalated);
    }

    #[tokio::test]
    async fn list_filters_by_state_and_type() {
        let Fixture { workflow, .. } = fixture();
        let first = workflow
            .create(context("TYPE_A", "maker-1"), "corr-1".into())
            .await
            .expect("request created");
        workflow
            .create(context("TYPE_B", "maker-2"), "corr-2".into())
            .await
            .expect("request created");

        workflow
            .approve(&first.id, decision("checker-1"))
            .await
            .expect("approval");

        let pending = workflow
            .list(RequestFilter {
                state: Some(RequestState::Pending),
                ..RequestFilter::default()
            })
            .await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].approval_type, "TYPE_B");

        let type_a = workflow
            .list(RequestFilter {
                approval_type: Some("TYPE_A".into()),
                ..RequestFilter::default()
            })
            .await;
        assert_eq!(type_a.len(), 1);
        assert_eq!(type_a[0].state, RequestState::Approved);
    }
}
