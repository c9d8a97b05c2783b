//! Condition evaluator
//!
//! Resolves an agent's condition tree against the execution context.
//! Every node yields a verdict and a reason; compound nodes never
//! short-circuit so the audit trail is complete.

use crate::context::{as_f64, as_text, lookup, zero_like};
use crate::error::EngineError;
use crate::models::{ComparisonOperator, Condition, ConditionResult, LogicalOperator, OracleExchange};
use crate::oracle::{consult, DecisionOracle};
use crate::Result;
use async_recursion::async_recursion;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Reason recorded when an AI condition could not reach the oracle.
pub const ORACLE_UNAVAILABLE: &str = "oracle unavailable";

/// Verdicts for an agent's top-level conditions.
#[derive(Debug, Clone)]
pub struct ConditionsOutcome {
    pub results: Vec<ConditionResult>,
    pub all_passed: bool,
    pub configuration_error: Option<String>,
}

pub struct ConditionEvaluator {
    oracle: Arc<dyn DecisionOracle>,
    call_timeout: Duration,
    max_depth: usize,
}

impl ConditionEvaluator {
    pub fn new(oracle: Arc<dyn DecisionOracle>, call_timeout: Duration, max_depth: usize) -> Self {
        Self {
            oracle,
            call_timeout,
            max_depth,
        }
    }

    /// Evaluate top-level conditions in declared order. An empty list passes.
    pub async fn evaluate_all(
        &self,
        conditions: &[Condition],
        context: &Value,
        metadata: &Value,
        transcript: &mut Vec<OracleExchange>,
    ) -> ConditionsOutcome {
        let mut results = Vec::with_capacity(conditions.len());
        let mut fault = None;

        for condition in conditions {
            results.push(
                self.evaluate_node(condition, context, metadata, transcript, 1, &mut fault)
                    .await,
            );
        }

        let configuration_error = fault.map(|e| {
            error!(error = %e, "Condition configuration error");
            e.to_string()
        });

        let all_passed = configuration_error.is_none() && results.iter().all(|r| r.passed);
        debug!(
            condition_count = results.len(),
            all_passed, "Conditions evaluated"
        );

        ConditionsOutcome {
            results,
            all_passed,
            configuration_error,
        }
    }

    /// Evaluate one node. `depth` starts at 1 for top-level conditions.
    /// A configuration error anywhere in the tree is returned after every
    /// node has been visited.
    pub async fn evaluate(
        &self,
        condition: &Condition,
        context: &Value,
        metadata: &Value,
        transcript: &mut Vec<OracleExchange>,
        depth: usize,
    ) -> Result<ConditionResult> {
        let mut fault = None;
        let result = self
            .evaluate_node(condition, context, metadata, transcript, depth, &mut fault)
            .await;
        match fault {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    /// Misconfigured nodes become failed leaves carrying the error; the
    /// first such error is kept in `fault`.
    #[async_recursion]
    async fn evaluate_node(
        &self,
        condition: &Condition,
        context: &Value,
        metadata: &Value,
        transcript: &mut Vec<OracleExchange>,
        depth: usize,
        fault: &mut Option<EngineError>,
    ) -> ConditionResult {
        if depth > self.max_depth {
            return misconfigured(
                condition,
                EngineError::ConditionDepthExceeded(self.max_depth),
                fault,
            );
        }

        match condition {
            Condition::Simple {
                field,
                operator,
                value,
            } => {
                let (passed, reason) = evaluate_simple(context, field, *operator, value);
                leaf(condition, passed, reason)
            }

            Condition::Compound {
                operator,
                conditions,
            } => {
                if conditions.is_empty() {
                    return misconfigured(
                        condition,
                        EngineError::EmptyCompoundCondition(operator.as_str().to_string()),
                        fault,
                    );
                }

                let mut children = Vec::with_capacity(conditions.len());
                for child in conditions {
                    children.push(
                        self.evaluate_node(child, context, metadata, transcript, depth + 1, fault)
                            .await,
                    );
                }

                let passed_count = children.iter().filter(|c| c.passed).count();
                let passed = match operator {
                    LogicalOperator::And => passed_count == children.len(),
                    LogicalOperator::Or => passed_count > 0,
                    LogicalOperator::Not => !children[0].passed,
                };

                let reason = match operator {
                    LogicalOperator::Not => format!(
                        "NOT of first child ({})",
                        if children[0].passed { "true" } else { "false" }
                    ),
                    op => format!(
                        "{}: {}/{} children true",
                        op.as_str(),
                        passed_count,
                        children.len()
                    ),
                };

                ConditionResult {
                    kind: condition.kind().to_string(),
                    description: condition.describe(),
                    passed,
                    reason,
                    children,
                }
            }

            Condition::AiEvaluated {
                prompt,
                expected_output,
            } => {
                let expected = expected_output.trim();
                if expected.is_empty() {
                    return leaf(condition, false, "expected output is empty".to_string());
                }

                let full_prompt = build_condition_prompt(prompt, expected, context);
                match consult(
                    self.oracle.as_ref(),
                    full_prompt,
                    metadata,
                    "condition",
                    self.call_timeout,
                    transcript,
                )
                .await
                {
                    Ok(response) => {
                        let passed = response.to_lowercase().contains(&expected.to_lowercase());
                        let reason = format!(
                            "oracle answered {:?}; expected {:?}",
                            truncate(&response, 120),
                            expected
                        );
                        leaf(condition, passed, reason)
                    }
                    Err(_) => leaf(condition, false, ORACLE_UNAVAILABLE.to_string()),
                }
            }
        }
    }
}

fn misconfigured(
    condition: &Condition,
    error: EngineError,
    fault: &mut Option<EngineError>,
) -> ConditionResult {
    let result = leaf(condition, false, error.to_string());
    fault.get_or_insert(error);
    result
}

fn leaf(condition: &Condition, passed: bool, reason: String) -> ConditionResult {
    ConditionResult {
        kind: condition.kind().to_string(),
        description: condition.describe(),
        passed,
        reason,
        children: vec![],
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        trimmed.to_string()
    } else {
        let mut out: String = trimmed.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}

fn build_condition_prompt(description: &str, expected: &str, context: &Value) -> String {
    let context_json =
        serde_json::to_string_pretty(context).unwrap_or_else(|_| context.to_string());

    format!(
        r#"You are evaluating a condition for a personal-finance automation.

CONDITION:
{}

CONTEXT (JSON):
{}

Reply with exactly "{}" if the condition holds for this context.
Otherwise reply with a short answer that does not contain that word."#,
        description, context_json, expected
    )
}

fn evaluate_simple(
    context: &Value,
    field: &str,
    operator: ComparisonOperator,
    expected: &Value,
) -> (bool, String) {
    let (actual, missing) = match lookup(context, field) {
        Some(v) => (v.clone(), false),
        None => (zero_like(expected), true),
    };

    let (passed, detail) = compare(&actual, operator, expected);
    let reason = format!(
        "{}{} = {} {} {}: {}{}",
        field,
        if missing { " (missing)" } else { "" },
        actual,
        operator.symbol(),
        expected,
        passed,
        detail.map(|d| format!(" ({})", d)).unwrap_or_default()
    );

    (passed, reason)
}

/// Apply a comparison operator. Ordering operators are numeric,
/// `contains`/`matches` are textual, equality is numeric when both sides
/// are numbers and textual otherwise. The optional string explains a
/// false verdict caused by a type problem.
pub fn compare(
    actual: &Value,
    operator: ComparisonOperator,
    expected: &Value,
) -> (bool, Option<String>) {
    match operator {
        ComparisonOperator::GreaterThan
        | ComparisonOperator::LessThan
        | ComparisonOperator::GreaterOrEqual
        | ComparisonOperator::LessOrEqual => match (as_f64(actual), as_f64(expected)) {
            (Some(a), Some(b)) => {
                let passed = match operator {
                    ComparisonOperator::GreaterThan => a > b,
                    ComparisonOperator::LessThan => a < b,
                    ComparisonOperator::GreaterOrEqual => a >= b,
                    _ => a <= b,
                };
                (passed, None)
            }
            _ => (false, Some("operands are not numeric".to_string())),
        },

        ComparisonOperator::Equal | ComparisonOperator::NotEqual => {
            let equal = match (numeric(actual), numeric(expected)) {
                (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
                _ => as_text(actual) == as_text(expected),
            };
            let passed = if operator == ComparisonOperator::Equal {
                equal
            } else {
                !equal
            };
            (passed, None)
        }

        ComparisonOperator::Contains => (as_text(actual).contains(&as_text(expected)), None),

        ComparisonOperator::Matches => match Regex::new(&as_text(expected)) {
            Ok(re) => (re.is_match(&as_text(actual)), None),
            Err(e) => (false, Some(format!("invalid pattern: {}", e))),
        },
    }
}

/// Numbers and numeric strings only; booleans compare textually.
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(_) | Value::String(_) => as_f64(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::MockOracle;
    use serde_json::json;

    fn evaluator(oracle: MockOracle) -> ConditionEvaluator {
        ConditionEvaluator::new(Arc::new(oracle), Duration::from_secs(2), 8)
    }

    fn simple(field: &str, operator: ComparisonOperator, value: Value) -> Condition {
        Condition::Simple {
            field: field.to_string(),
            operator,
            value,
        }
    }

    fn constant(passed: bool) -> Condition {
        simple("flag", ComparisonOperator::Equal, json!(passed))
    }

    fn compound(operator: LogicalOperator, conditions: Vec<Condition>) -> Condition {
        Condition::Compound {
            operator,
            conditions,
        }
    }

    async fn eval(condition: &Condition, context: &Value) -> Result<ConditionResult> {
        let mut transcript = Vec::new();
        evaluator(MockOracle::new())
            .evaluate(condition, context, &json!({}), &mut transcript, 1)
            .await
    }

    #[tokio::test]
    async fn test_simple_numeric_comparison() {
        let ctx = json!({"amount": 10000});
        let cond = simple("amount", ComparisonOperator::GreaterThan, json!(5000));
        let result = eval(&cond, &ctx).await.unwrap();
        assert!(result.passed);
        assert!(result.reason.contains("10000"));

        let ctx = json!({"amount": 4000});
        assert!(!eval(&cond, &ctx).await.unwrap().passed);
    }

    #[tokio::test]
    async fn test_missing_field_uses_zero_value() {
        let ctx = json!({});
        let cond = simple("transaction.amount", ComparisonOperator::LessThan, json!(1));
        let result = eval(&cond, &ctx).await.unwrap();
        assert!(result.passed);
        assert!(result.reason.contains("missing"));

        let cond = simple("merchant", ComparisonOperator::Equal, json!(""));
        assert!(eval(&cond, &ctx).await.unwrap().passed);
    }

    #[test]
    fn test_string_operators() {
        let (passed, _) = compare(&json!("Swiggy Order"), ComparisonOperator::Contains, &json!("Swiggy"));
        assert!(passed);
        let (passed, _) = compare(&json!(12345), ComparisonOperator::Contains, &json!("234"));
        assert!(passed);
        let (passed, _) = compare(&json!("UPI-123"), ComparisonOperator::Matches, &json!("^UPI-\\d+$"));
        assert!(passed);
        let (passed, detail) = compare(&json!("x"), ComparisonOperator::Matches, &json!("("));
        assert!(!passed);
        assert!(detail.unwrap().contains("invalid pattern"));
    }

    #[test]
    fn test_equality_coerces_numeric_strings() {
        assert!(compare(&json!("5000"), ComparisonOperator::Equal, &json!(5000)).0);
        assert!(compare(&json!("food"), ComparisonOperator::NotEqual, &json!("rent")).0);
        assert!(!compare(&json!("abc"), ComparisonOperator::GreaterThan, &json!(1)).0);
    }

    #[tokio::test]
    async fn test_compound_laws() {
        let ctx = json!({"flag": true});
        let t = || constant(true);
        let f = || constant(false);

        let and = compound(LogicalOperator::And, vec![t(), t()]);
        assert!(eval(&and, &ctx).await.unwrap().passed);

        let or = compound(LogicalOperator::Or, vec![f(), f()]);
        assert!(!eval(&or, &ctx).await.unwrap().passed);

        let not = compound(LogicalOperator::Not, vec![t()]);
        assert!(!eval(&not, &ctx).await.unwrap().passed);

        let empty = compound(LogicalOperator::And, vec![]);
        assert!(matches!(
            eval(&empty, &ctx).await,
            Err(EngineError::EmptyCompoundCondition(_))
        ));
    }

    #[tokio::test]
    async fn test_compound_records_every_child() {
        let ctx = json!({"flag": true});
        let or = compound(
            LogicalOperator::Or,
            vec![constant(true), constant(false), constant(true)],
        );
        let result = eval(&or, &ctx).await.unwrap();
        assert_eq!(result.children.len(), 3);
        assert_eq!(result.reason, "OR: 2/3 children true");
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let mut cond = constant(true);
        for _ in 0..10 {
            cond = compound(LogicalOperator::And, vec![cond]);
        }
        assert!(matches!(
            eval(&cond, &json!({"flag": true})).await,
            Err(EngineError::ConditionDepthExceeded(8))
        ));
    }

    #[tokio::test]
    async fn test_ai_condition_matches_case_insensitively() {
        let oracle = MockOracle::new().with_rule("recurring", "Yes, looks like a subscription");
        let evaluator = evaluator(oracle);
        let cond = Condition::AiEvaluated {
            prompt: "Is this a recurring subscription payment?".into(),
            expected_output: "YES".into(),
        };
        let mut transcript = Vec::new();
        let result = evaluator
            .evaluate(&cond, &json!({"merchant": "Netflix"}), &json!({}), &mut transcript, 1)
            .await
            .unwrap();

        assert!(result.passed);
        assert_eq!(transcript.len(), 1);
        assert!(transcript[0].prompt.contains("Netflix"));
    }

    #[tokio::test]
    async fn test_ai_condition_degrades_when_oracle_down() {
        let evaluator = evaluator(MockOracle::new());
        let cond = Condition::AiEvaluated {
            prompt: "Is this unusual?".into(),
            expected_output: "yes".into(),
        };
        let mut transcript = Vec::new();
        let result = evaluator
            .evaluate(&cond, &json!({}), &json!({}), &mut transcript, 1)
            .await
            .unwrap();

        assert!(!result.passed);
        assert_eq!(result.reason, ORACLE_UNAVAILABLE);
        assert!(transcript[0].error.is_some());
    }

    #[tokio::test]
    async fn test_evaluate_all_reports_configuration_error() {
        let evaluator = evaluator(MockOracle::new());
        let conditions = vec![constant(true), compound(LogicalOperator::Or, vec![])];
        let mut transcript = Vec::new();
        let outcome = evaluator
            .evaluate_all(&conditions, &json!({"flag": true}), &json!({}), &mut transcript)
            .await;

        assert_eq!(outcome.results.len(), 2);
        assert!(!outcome.all_passed);
        assert!(outcome
            .configuration_error
            .unwrap()
            .contains("EmptyCompoundCondition"));
    }

    #[tokio::test]
    async fn test_nested_configuration_error_keeps_sibling_verdicts() {
        let evaluator = evaluator(MockOracle::new());
        let conditions = vec![compound(
            LogicalOperator::Or,
            vec![
                constant(true),
                compound(LogicalOperator::And, vec![]),
                constant(true),
            ],
        )];
        let mut transcript = Vec::new();
        let outcome = evaluator
            .evaluate_all(&conditions, &json!({"flag": true}), &json!({}), &mut transcript)
            .await;

        let or = &outcome.results[0];
        assert_eq!(or.children.len(), 3);
        assert!(or.children[0].passed);
        assert!(!or.children[1].passed);
        assert!(or.children[1].reason.contains("EmptyCompoundCondition"));
        assert!(or.children[2].passed);
        assert_eq!(or.reason, "OR: 2/3 children true");

        assert!(!outcome.all_passed);
        assert!(outcome.configuration_error.is_some());
    }

    #[tokio::test]
    async fn test_no_conditions_pass_vacuously() {
        let evaluator = evaluator(MockOracle::new());
        let mut transcript = Vec::new();
        let outcome = evaluator
            .evaluate_all(&[], &json!({}), &json!({}), &mut transcript)
            .await;
        assert!(outcome.all_passed);
        assert!(outcome.results.is_empty());
    }
}
