//! Route-level interception for governed operations. When an active
//! binding covers a route, the operation is converted into an approval
//! request instead of executing; the caller receives the request id and
//! stage count to poll.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

use caricash_approvals::ApprovalWorkflow;
use caricash_approvals::ApprovalsError;
use caricash_approvals::ApprovalsResult;
use caricash_policy::RequestContext;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointBinding {
    /// Route pattern with `{param}` placeholders, e.g.
    /// `/tx/reversal/{journal_id}`.
    pub route_pattern: String,
    pub http_method: String,
    pub approval_type: String,
    pub active: bool,
}

impl EndpointBinding {
    fn matches(&self, method: &str, path: &str) -> bool {
        if !self.active || !self.http_method.eq_ignore_ascii_case(method) {
            return false;
        }
        let pattern: Vec<&str> = self.route_pattern.trim_matches('/').split('/').collect();
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        pattern.len() == segments.len()
            && pattern.iter().zip(&segments).all(|(expected, actual)| {
                (expected.starts_with('{') && expected.ends_with('}')) || expected == actual
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalTypeConfig {
    pub enabled: bool,
    #[serde(default)]
    pub require_reason: bool,
}

impl Default for ApprovalTypeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            require_reason: false,
        }
    }
}

/// Response for an intercepted call, in place of the operation's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterceptResponse {
    pub approval_required: bool,
    pub request_id: String,
    pub total_stages: u32,
}

pub struct ApprovalInterceptor {
    workflow: Arc<ApprovalWorkflow>,
    bindings: RwLock<Vec<EndpointBinding>>,
    configs: RwLock<HashMap<String, ApprovalTypeConfig>>,
}

impl ApprovalInterceptor {
    #[must_use]
    pub fn new(workflow: Arc<ApprovalWorkflow>) -> Self {
        Self {
            workflow,
            bindings: RwLock::new(Vec::new()),
            configs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn bind(&self, binding: EndpointBinding) {
        let mut bindings = self.bindings.write().await;
        bindings.retain(|existing| {
            !(existing.route_pattern == binding.route_pattern
                && existing.http_method.eq_ignore_ascii_case(&binding.http_method))
        });
        bindings.push(binding);
    }

    pub async fn bindings(&self) -> Vec<EndpointBinding> {
        self.bindings.read().await.clone()
    }

    pub async fn configure_type(&self, approval_type: &str, config: ApprovalTypeConfig) {
        let mut configs = self.configs.write().await;
        configs.insert(approval_type.to_owned(), config);
    }

    /// Checks the route against the binding table. `Ok(None)` means the
    /// operation may execute directly; `Ok(Some(..))` means it was turned
    /// into an approval request.
    pub async fn intercept(
        &self,
        method: &str,
        path: &str,
        context: RequestContext,
        correlation_id: String,
    ) -> ApprovalsResult<Option<InterceptResponse>> {
        let approval_type = {
            let bindings = self.bindings.read().await;
            bindings
                .iter()
                .find(|binding| binding.matches(method, path))
                .map(|binding| binding.approval_type.clone())
        };
        let Some(approval_type) = approval_type else {
            return Ok(None);
        };

        let config = {
            let configs = self.configs.read().await;
            configs.get(&approval_type).cloned().unwrap_or_default()
        };
        if !config.enabled {
            return Ok(None);
        }
        if config.require_reason
            && context
                .payload
                .get("reason")
                .and_then(serde_json::Value::as_str)
                .is_none_or(|reason| reason.trim().is_empty())
        {
            return Err(ApprovalsError::Validation(
                "a reason is required for this operation".into(),
            ));
        }

        let mut governed = context;
        governed.approval_type = approval_type;
        let request = self.workflow.create(governed, correlation_id).await?;
        Ok(Some(InterceptResponse {
            approval_required: true,
            request_id: request.id,
            total_stages: request.total_stages,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caricash_events::InMemoryAuditLog;
    use caricash_events::InMemoryEventStore;
    use caricash_policy::InMemoryDelegationStore;
    use caricash_policy::InMemoryPolicyStore;
    use caricash_policy::PolicyEngine;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn interceptor() -> ApprovalInterceptor {
        let engine = PolicyEngine::new(
            Arc::new(InMemoryPolicyStore::new()),
            Arc::new(InMemoryDelegationStore::new()),
        );
        let workflow = Arc::new(ApprovalWorkflow::new(
            engine,
            Arc::new(InMemoryEventStore::new()),
            InMemoryAuditLog::shared(),
        ));
        ApprovalInterceptor::new(workflow)
    }

    fn context(payload: serde_json::Value) -> RequestContext {
        RequestContext {
            approval_type: String::new(),
            actor_type: "STAFF".into(),
            actor_id: "staff-1".into(),
            staff_role: Some("ops".into()),
            payload,
        }
    }

    fn reversal_binding() -> EndpointBinding {
        EndpointBinding {
            route_pattern: "/tx/reversal/{journal_id}".into(),
            http_method: "POST".into(),
            approval_type: "REVERSAL_REQUESTED".into(),
            active: true,
        }
    }

    #[tokio::test]
    async fn unbound_routes_pass_through() {
        let interceptor = interceptor();
        let outcome = interceptor
            .intercept("POST", "/tx/deposit", context(json!({})), "corr-1".into())
            .await
            .expect("intercept");
        assert_eq!(outcome, None);
    }

    #[tokio::test]
    async fn bound_routes_become_approval_requests() {
        let interceptor = interceptor();
        interceptor.bind(reversal_binding()).await;

        let outcome = interceptor
            .intercept(
                "POST",
                "/tx/reversal/01ARZ3NDEKTSV",
                context(json!({"journal_id": "01ARZ3NDEKTSV"})),
                "corr-1".into(),
            )
            .await
            .expect("intercept")
            .expect("interception response");
        assert!(outcome.approval_required);
        assert_eq!(outcome.total_stages, 1);
    }

    #[tokio::test]
    async fn method_and_shape_must_match() {
        let interceptor = interceptor();
        interceptor.bind(reversal_binding()).await;

        let wrong_method = interceptor
            .intercept(
                "GET",
                "/tx/reversal/j-1",
                context(json!({})),
                "corr-1".into(),
            )
            .await
            .expect("intercept");
        assert_eq!(wrong_method, None);

        let wrong_shape = interceptor
            .intercept(
                "POST",
                "/tx/reversal/j-1/extra",
                context(json!({})),
                "corr-1".into(),
            )
            .await
            .expect("intercept");
        assert_eq!(wrong_shape, None);
    }

    #[tokio::test]
    async fn disabled_types_and_inactive_bindings_pass_through() {
        let interceptor = interceptor();
        let mut inactive = reversal_binding();
        inactive.active = false;
        interceptor.bind(inactive).await;
        let outcome = interceptor
            .intercept("POST", "/tx/reversal/j-1", context(json!({})), "corr".into())
            .await
            .expect("intercept");
        assert_eq!(outcome, None);

        interceptor.bind(reversal_binding()).await;
        interceptor
            .configure_type(
                "REVERSAL_REQUESTED",
                ApprovalTypeConfig {
                    enabled: false,
                    require_reason: false,
                },
            )
            .await;
        let outcome = interceptor
            .intercept("POST", "/tx/reversal/j-1", context(json!({})), "corr".into())
            .await
            .expect("intercept");
        assert_eq!(outcome, None);
    }

    #[tokio::test]
    async fn missing_reason_fails_validation_when_required() {
        let interceptor = interceptor();
        interceptor.bind(reversal_binding()).await;
        interceptor
            .configure_type(
                "REVERSAL_REQUESTED",
                ApprovalTypeConfig {
                    enabled: true,
                    require_reason: true,
                },
            )
            .await;

        let err = interceptor
            .intercept(
                "POST",
                "/tx/reversal/j-1",
                context(json!({"journal_id": "j-1"})),
                "corr-1".into(),
            )
            .await
            .expect_err("reason is required");
        assert!(matches!(err, ApprovalsError::Validation(_)));

        let outcome = interceptor
            .intercept(
                "POST",
                "/tx/reversal/j-1",
                context(json!({"journal_id": "j-1", "reason": "duplicate"})),
                "corr-1".into(),
            )
            .await
            .expect("intercept")
            .expect("interception response");
        assert!(outcome.approval_required);
    }

    #[tokio::test]
    async fn rebinding_replaces_the_previous_route_entry() {
        let interceptor = interceptor();
        interceptor.bind(reversal_binding()).await;
        let mut replacement = reversal_binding();
        replacement.approval_type = "REVERSAL_V2".into();
        interceptor.bind(replacement).await;

        let bindings = interceptor.bindings().await;
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].approval_type, "REVERSAL_V2");
    }
}
