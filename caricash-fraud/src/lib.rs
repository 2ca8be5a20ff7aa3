#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use caricash_money::Amount;
use caricash_money::Currency;
use caricash_policy::Condition;

pub type VersionId = String;
pub type RuleId = String;
pub type CaseId = String;

pub type FraudResult<T> = Result<T, FraudError>;

#[derive(Debug, Error)]
pub enum FraudError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("governance violation: {0}")]
    Governance(String),
    #[error("scoring provider failure: {0}")]
    Scoring(String),
    #[error(transparent)]
    Condition(#[from] caricash_policy::PolicyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VersionState {
    Draft,
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudRulesVersion {
    pub id: VersionId,
    pub state: VersionState,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextKind {
    Txn,
    BankDeposit,
    Payout,
    Settlement,
    BeneficiaryChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleAction {
    Allow,
    Review,
    Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudRule {
    pub id: RuleId,
    pub version_id: VersionId,
    pub applies_to: ContextKind,
    pub severity: Severity,
    pub action: RuleAction,
    pub conditions: Vec<Condition>,
    /// Lower runs first.
    pub priority: i32,
    pub reason_code: String,
    #[serde(default)]
    pub create_case: bool,
}

/// Evaluation input. `signals` carries free-form risk features; the
/// provider score is injected as the `score` field before rules run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudContext {
    pub context_type: ContextKind,
    pub actor_type: String,
    pub actor_id: String,
    pub amount: Amount,
    pub currency: Currency,
    #[serde(default)]
    pub signals: serde_json::Value,
}

impl FraudContext {
    fn resolve_field(&self, field: &str, score: Option<&Score>) -> Option<serde_json::Value> {
        match field {
            "actor_type" => Some(serde_json::Value::String(self.actor_type.clone())),
            "actor_id" => Some(serde_json::Value::String(self.actor_id.clone())),
            "amount" => Some(serde_json::Value::String(self.amount.to_string())),
            "currency" => Some(serde_json::Value::String(self.currency.to_string())),
            "score" => score.map(|score| serde_json::json!(score.score)),
            _ => field.strip_prefix("signals.").and_then(|path| {
                let mut cursor = &self.signals;
                for segment in path.split('.') {
                    cursor = cursor.get(segment)?;
                }
                Some(cursor.clone())
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub score: f64,
    pub model_version: String,
    pub explanation: serde_json::Value,
}

/// Optional ML hook invoked before rule evaluation. Rules may reference the
/// returned value through the `score` condition field.
#[async_trait]
pub trait ScoringProvider: Send + Sync {
    async fn score(&self, context: &FraudContext) -> FraudResult<Score>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudCase {
    pub id: CaseId,
    pub context_type: ContextKind,
    pub actor_id: String,
    pub rule_id: RuleId,
    pub reason_code: String,
    pub severity: Severity,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub decision: RuleAction,
    pub matched: Vec<FraudRule>,
    pub score: Option<Score>,
    pub opened_cases: Vec<FraudCase>,
}

#[async_trait]
pub trait FraudRuleStore: Send + Sync {
    async fn create_version(&self, created_by: &str) -> FraudResult<FraudRulesVersion>;
    async fn add_rule(&self, rule: FraudRule) -> FraudResult<FraudRule>;
    /// Governed activation: the approver must differ from the author, and
    /// exactly one version is ACTIVE afterwards (the previous one is
    /// demoted in the same step).
    async fn activate_version(
        &self,
        version_id: &VersionId,
        approved_by: &str,
    ) -> FraudResult<FraudRulesVersion>;
    async fn active_version(&self) -> FraudResult<Option<FraudRulesVersion>>;
    async fn version(&self, version_id: &VersionId) -> FraudResult<FraudRulesVersion>;
    async fn rules_for(&self, version_id: &VersionId) -> FraudResult<Vec<FraudRule>>;
}

#[derive(Default)]
struct StoreState {
    versions: HashMap<VersionId, FraudRulesVersion>,
    rules: HashMap<VersionId, Vec<FraudRule>>,
}

#[derive(Default)]
pub struct InMemoryFraudRuleStore {
    state: RwLock<StoreState>,
}

impl InMemoryFraudRuleStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FraudRuleStore for InMemoryFraudRuleStore {
    async fn create_version(&self, created_by: &str) -> FraudResult<FraudRulesVersion> {
        let mut state = self.state.write().await;
        let version = FraudRulesVersion {
            id: Uuid::new_v4().to_string(),
            state: VersionState::Draft,
            created_by: created_by.to_owned(),
            approved_by: None,
            created_at: Utc::now(),
            activated_at: None,
        };
        state.versions.insert(version.id.clone(), version.clone());
        state.rules.insert(version.id.clone(), Vec::new());
        Ok(version)
    }

    async fn add_rule(&self, rule: FraudRule) -> FraudResult<FraudRule> {
        for condition in &rule.conditions {
            condition.validate()?;
        }
        if rule.reason_code.trim().is_empty() {
            return Err(FraudError::Validation("reason_code must be provided".into()));
        }
        let mut state = self.state.write().await;
        let version = state
            .versions
            .get(&rule.version_id)
            .ok_or_else(|| FraudError::NotFound(format!("rules version {}", rule.version_id)))?;
        if version.state != VersionState::Draft {
            return Err(FraudError::Validation(
                "rules can only be added to a draft version".into(),
            ));
        }
        state
            .rules
            .entry(rule.version_id.clone())
            .or_default()
            .push(rule.clone());
        Ok(rule)
    }

    async fn activate_version(
        &self,
        version_id: &VersionId,
        approved_by: &str,
    ) -> FraudResult<FraudRulesVersion> {
        let mut state = self.state.write().await;
        let created_by = state
            .versions
            .get(version_id)
            .ok_or_else(|| FraudError::NotFound(format!("rules version {version_id}")))?
            .created_by
            .clone();
        if created_by == approved_by {
            return Err(FraudError::Governance(
                "rules version approver must differ from its author".into(),
            ));
        }

        for version in state.versions.values_mut() {
            if version.state == VersionState::Active {
                version.state = VersionState::Inactive;
            }
        }
        let version = state
            .versions
            .get_mut(version_id)
            .ok_or_else(|| FraudError::NotFound(format!("rules version {version_id}")))?;
        version.state = VersionState::Active;
        version.approved_by = Some(approved_by.to_owned());
        version.activated_at = Some(Utc::now());
        Ok(version.clone())
    }

    async fn active_version(&self) -> FraudResult<Option<FraudRulesVersion>> {
        let state = self.state.read().await;
        Ok(state
            .versions
            .values()
            .find(|version| version.state == VersionState::Active)
            .cloned())
    }

    async fn version(&self, version_id: &VersionId) -> FraudResult<FraudRulesVersion> {
        let state = self.state.read().await;
        state
            .versions
            .get(version_id)
            .cloned()
            .ok_or_else(|| FraudError::NotFound(format!("rules version {version_id}")))
    }

    async fn rules_for(&self, version_id: &VersionId) -> FraudResult<Vec<FraudRule>> {
        let state = self.state.read().await;
        Ok(state.rules.get(version_id).cloned().unwrap_or_default())
    }
}

pub struct FraudEvaluator {
    store: Arc<dyn FraudRuleStore>,
    scoring: Option<Arc<dyn ScoringProvider>>,
    cases: RwLock<Vec<FraudCase>>,
}

impl FraudEvaluator {
    pub fn new(store: Arc<dyn FraudRuleStore>) -> Self {
        Self {
            store,
            scoring: None,
            cases: RwLock::new(Vec::new()),
        }
    }

    pub fn with_scoring(store: Arc<dyn FraudRuleStore>, scoring: Arc<dyn ScoringProvider>) -> Self {
        Self {
            store,
            scoring: Some(scoring),
            cases: RwLock::new(Vec::new()),
        }
    }

    pub async fn cases(&self) -> Vec<FraudCase> {
        self.cases.read().await.clone()
    }

    /// Runs the ACTIVE rules version against the context. Rules evaluate in
    /// ascending priority; one BLOCK decides the outcome, otherwise one
    /// REVIEW, otherwise ALLOW. Matched rules flagged `create_case` open a
    /// fraud case each.
    pub async fn evaluate(&self, context: &FraudContext) -> FraudResult<Evaluation> {
        let score = match &self.scoring {
            Some(provider) => Some(provider.score(context).await?),
            None => None,
        };

        let Some(version) = self.store.active_version().await? else {
            return Ok(Evaluation {
                decision: RuleAction::Allow,
                matched: Vec::new(),
                score,
                opened_cases: Vec::new(),
            });
        };

        let mut rules: Vec<FraudRule> = self
            .store
            .rules_for(&version.id)
            .await?
            .into_iter()
            .filter(|rule| rule.applies_to == context.context_type)
            .collect();
        rules.sort_by_key(|rule| rule.priority);

        let mut matched = Vec::new();
        for rule in rules {
            let hit = rule.conditions.iter().all(|condition| {
                let resolved = context.resolve_field(&condition.field, score.as_ref());
                condition.matches(resolved.as_ref())
            });
            if hit {
                matched.push(rule);
            }
        }

        let decision = if matched.iter().any(|rule| rule.action == RuleAction::Block) {
            RuleAction::Block
        } else if matched.iter().any(|rule| rule.action == RuleAction::Review) {
            RuleAction::Review
        } else {
            RuleAction::Allow
        };

        let mut opened_cases = Vec::new();
        for rule in matched.iter().filter(|rule| rule.create_case) {
            opened_cases.push(FraudCase {
                id: Uuid::new_v4().to_string(),
                context_type: context.context_type,
                actor_id: context.actor_id.clone(),
                rule_id: rule.id.clone(),
                reason_code: rule.reason_code.clone(),
                severity: rule.severity,
                opened_at: Utc::now(),
            });
        }
        if !opened_cases.is_empty() {
            let mut cases = self.cases.write().await;
            cases.extend(opened_cases.clone());
        }

        debug!(
            context = ?context.context_type,
            decision = ?decision,
            matched = matched.len(),
            "fraud rules evaluated"
        );
        Ok(Evaluation {
            decision,
            matched,
            score,
            opened_cases,
        })
    }
}
