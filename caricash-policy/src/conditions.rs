//! Closed-operator condition evaluation shared by the policy engine and the
//! fraud rule evaluator. Values are dynamic JSON but the operator set is a
//! fixed enum, and each condition is schema-checked before it is persisted.

use std::cmp::Ordering;

use regex_lite::Regex;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::PolicyError;
use crate::PolicyResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Contains,
    Regex,
    Between,
    Exists,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
}

impl Condition {
    /// Schema validation applied when a policy or rule is persisted.
    /// Malformed operand shapes are rejected up front rather than silently
    /// evaluating to false later.
    pub fn validate(&self) -> PolicyResult<()> {
        if self.field.trim().is_empty() {
            return Err(PolicyError::Validation(
                "condition field must be provided".into(),
            ));
        }
        match self.operator {
            ConditionOperator::In | ConditionOperator::NotIn => {
                if !self.value.is_array() {
                    return Err(PolicyError::Validation(format!(
                        "operator on {} requires an array operand",
                        self.field
                    )));
                }
            }
            ConditionOperator::Between => match self.value.as_array() {
                Some(bounds) if bounds.len() == 2 => {}
                _ => {
                    return Err(PolicyError::Validation(format!(
                        "between on {} requires a two-element array",
                        self.field
                    )));
                }
            },
            ConditionOperator::Exists => {
                if !self.value.is_boolean() {
                    return Err(PolicyError::Validation(format!(
                        "exists on {} requires a boolean operand",
                        self.field
                    )));
                }
            }
            ConditionOperator::Regex => {
                let pattern = self.value.as_str().ok_or_else(|| {
                    PolicyError::Validation(format!(
                        "regex on {} requires a string operand",
                        self.field
                    ))
                })?;
                Regex::new(pattern).map_err(|err| {
                    PolicyError::Validation(format!("invalid regex on {}: {err}", self.field))
                })?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Evaluates against a resolved field value; `None` means the field is
    /// absent from the request context.
    #[must_use]
    pub fn matches(&self, resolved: Option<&Value>) -> bool {
        if self.operator == ConditionOperator::Exists {
            let expected = self.value.as_bool().unwrap_or(true);
            return resolved.is_some() == expected;
        }
        let Some(actual) = resolved else {
            return false;
        };
        match self.operator {
            ConditionOperator::Eq => values_equal(actual, &self.value),
            ConditionOperator::Neq => !values_equal(actual, &self.value),
            ConditionOperator::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            ConditionOperator::Gte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            ConditionOperator::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            ConditionOperator::Lte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            ConditionOperator::In => self.value.as_array().is_some_and(|options| {
                options.iter().any(|option| values_equal(actual, option))
            }),
            ConditionOperator::NotIn => self.value.as_array().is_some_and(|options| {
                !options.iter().any(|option| values_equal(actual, option))
            }),
            ConditionOperator::Contains => contains(actual, &self.value),
            ConditionOperator::Regex => self
                .value
                .as_str()
                .and_then(|pattern| Regex::new(pattern).ok())
                .zip(actual.as_str())
                .is_some_and(|(regex, haystack)| regex.is_match(haystack)),
            ConditionOperator::Between => self.value.as_array().is_some_and(|bounds| {
                match (bounds.first(), bounds.get(1)) {
                    (Some(low), Some(high)) => {
                        matches!(
                            compare(actual, low),
                            Some(Ordering::Greater | Ordering::Equal)
                        ) && matches!(
                            compare(actual, high),
                            Some(Ordering::Less | Ordering::Equal)
                        )
                    }
                    _ => false,
                }
            }),
            ConditionOperator::Exists => false,
        }
    }
}

/// Numeric comparison where both sides are numbers or numeric strings
/// (fixed-point amounts travel as strings); otherwise lexicographic on
/// strings.
fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
        return a.partial_cmp(&b);
    }
    match (left.as_str(), right.as_str()) {
        (Some(a), Some(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().parse().ok(),
        _ => None,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn contains(actual: &Value, operand: &Value) -> bool {
    match actual {
        Value::String(haystack) => operand
            .as_str()
            .is_some_and(|needle| haystack.contains(needle)),
        Value::Array(items) => items.iter().any(|item| values_equal(item, operand)),
        _ => false,
    }
}
