//! Save-time validation of agent definitions
//!
//! Everything that can be checked without running the agent is checked
//! here, so a saved agent only fails at runtime for runtime reasons.

use crate::error::EngineError;
use crate::expression;
use crate::models::{
    Action, ActionKind, AgentDefinition, AmountSpec, ComparisonOperator, Condition, Trigger,
    TriggerKind,
};
use crate::Result;
use croner::Cron;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy)]
pub struct ValidationLimits {
    pub max_condition_depth: usize,
    pub max_actions: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_condition_depth: 16,
            max_actions: 50,
        }
    }
}

fn invalid(message: impl Into<String>) -> EngineError {
    EngineError::InvalidAgent(message.into())
}

pub fn validate_definition(definition: &AgentDefinition, limits: &ValidationLimits) -> Result<()> {
    if definition.name.trim().is_empty() {
        return Err(invalid("name must not be empty"));
    }

    let mut trigger_ids = HashSet::new();
    for trigger in &definition.triggers {
        if !trigger_ids.insert(trigger.id.as_str()) {
            return Err(invalid(format!("duplicate trigger id '{}'", trigger.id)));
        }
        validate_trigger(trigger)?;
    }

    for condition in &definition.conditions {
        validate_condition(condition, 1, limits.max_condition_depth)?;
    }

    if definition.actions.len() > limits.max_actions {
        return Err(invalid(format!(
            "{} actions exceed the limit of {}",
            definition.actions.len(),
            limits.max_actions
        )));
    }

    let mut action_ids = HashSet::new();
    for action in &definition.actions {
        if !action_ids.insert(action.id.as_str()) {
            return Err(invalid(format!("duplicate action id '{}'", action.id)));
        }
        validate_action(action)?;
    }

    Ok(())
}

pub fn validate_cron(schedule: &str) -> Result<Cron> {
    Cron::new(schedule)
        .parse()
        .map_err(|e| invalid(format!("invalid schedule '{}': {}", schedule, e)))
}

fn validate_trigger(trigger: &Trigger) -> Result<()> {
    if trigger.id.trim().is_empty() {
        return Err(invalid("trigger id must not be empty"));
    }

    match &trigger.kind {
        TriggerKind::Time { schedule } => validate_cron(schedule).map(|_| ()),
        TriggerKind::Event {
            event_type,
            filters,
        } => {
            if event_type.trim().is_empty() {
                return Err(invalid(format!("trigger '{}' has no event_type", trigger.id)));
            }
            filters
                .iter()
                .try_for_each(|f| validate_pattern(f.operator, &f.value))
        }
        TriggerKind::Threshold { value, .. } if !value.is_finite() => Err(invalid(format!(
            "trigger '{}' threshold must be finite",
            trigger.id
        ))),
        TriggerKind::Threshold { .. } => Ok(()),
        TriggerKind::Pattern { min_confidence, .. }
        | TriggerKind::AiDetected { min_confidence, .. } => {
            if (0.0..=1.0).contains(min_confidence) {
                Ok(())
            } else {
                Err(invalid(format!(
                    "trigger '{}' min_confidence must be within [0, 1]",
                    trigger.id
                )))
            }
        }
    }
}

fn validate_pattern(operator: ComparisonOperator, value: &Value) -> Result<()> {
    if operator != ComparisonOperator::Matches {
        return Ok(());
    }

    let pattern = value
        .as_str()
        .ok_or_else(|| invalid("'matches' expects a string pattern"))?;
    Regex::new(pattern)
        .map(|_| ())
        .map_err(|e| invalid(format!("invalid pattern '{}': {}", pattern, e)))
}

fn validate_condition(condition: &Condition, depth: usize, max_depth: usize) -> Result<()> {
    if depth > max_depth {
        return Err(EngineError::ConditionDepthExceeded(max_depth));
    }

    match condition {
        Condition::Simple {
            field,
            operator,
            value,
        } => {
            if field.trim().is_empty() {
                return Err(invalid("condition field must not be empty"));
            }
            validate_pattern(*operator, value)
        }
        Condition::Compound {
            operator,
            conditions,
        } => {
            if conditions.is_empty() {
                return Err(EngineError::EmptyCompoundCondition(operator.as_str().to_string()));
            }
            conditions
                .iter()
                .try_for_each(|c| validate_condition(c, depth + 1, max_depth))
        }
        Condition::AiEvaluated {
            prompt,
            expected_output,
        } => {
            if prompt.trim().is_empty() || expected_output.trim().is_empty() {
                return Err(invalid("AI condition needs a prompt and an expected output"));
            }
            Ok(())
        }
    }
}

fn validate_action(action: &Action) -> Result<()> {
    if action.id.trim().is_empty() {
        return Err(invalid("action id must not be empty"));
    }

    if let Some(retry) = &action.retry {
        if retry.enabled && retry.max_attempts < 1 {
            return Err(invalid(format!(
                "action '{}' retry needs max_attempts >= 1",
                action.id
            )));
        }
    }

    match &action.kind {
        ActionKind::Transfer(transfer) => {
            if transfer.from_account.trim().is_empty() || transfer.to_account.trim().is_empty() {
                return Err(invalid(format!("action '{}' needs both accounts", action.id)));
            }
            match &transfer.amount {
                AmountSpec::Fixed { value } if *value <= Decimal::ZERO => Err(invalid(format!(
                    "action '{}' fixed amount must be positive",
                    action.id
                ))),
                AmountSpec::Percentage { percent, .. }
                    if *percent <= Decimal::ZERO || *percent > Decimal::ONE_HUNDRED =>
                {
                    Err(invalid(format!(
                        "action '{}' percentage must be within (0, 100]",
                        action.id
                    )))
                }
                AmountSpec::Calculated { expression: source } => expression::parse(source)
                    .map(|_| ())
                    .map_err(|e| invalid(format!("action '{}': {}", action.id, e))),
                _ => Ok(()),
            }
        }
        ActionKind::Notify(notify) => {
            if notify.channels.is_empty() {
                return Err(invalid(format!("action '{}' has no channels", action.id)));
            }
            Ok(())
        }
        ActionKind::AiDecision(decision) => {
            if decision.allowed_actions.is_empty() {
                return Err(invalid(format!(
                    "action '{}' must allow at least one decision",
                    action.id
                )));
            }
            Ok(())
        }
        ActionKind::Execute(execute) if execute.operation.trim().is_empty() => Err(invalid(
            format!("action '{}' names no operation", action.id),
        )),
        ActionKind::Analyze(_) | ActionKind::Recommend(_) | ActionKind::Execute(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::assert_ok;

    fn definition(extra: Value) -> AgentDefinition {
        let mut base = json!({
            "name": "Saver",
            "category": "savings",
        });
        if let (Value::Object(base), Value::Object(extra)) = (&mut base, extra) {
            base.extend(extra);
        }
        serde_json::from_value(base).unwrap()
    }

    fn check(extra: Value) -> Result<()> {
        validate_definition(&definition(extra), &ValidationLimits::default())
    }

    #[test]
    fn test_valid_definition_passes() {
        let result = check(json!({
            "triggers": [
                { "id": "daily", "type": "time", "schedule": "0 9 * * *" },
                { "id": "tx", "type": "event", "event_type": "transaction.created",
                  "filters": [{ "field": "merchant", "operator": "matches", "value": "^Amazon" }] }
            ],
            "conditions": [
                { "type": "simple", "field": "amount", "operator": ">", "value": 5000 }
            ],
            "actions": [
                { "id": "a1", "type": "transfer", "from_account": "checking", "to_account": "savings",
                  "amount": { "mode": "calculated", "expression": "min(amount * 0.1, 500)" } }
            ]
        }));
        assert!(result.is_ok(), "{:?}", result);
    }

    #[test]
    fn test_rejects_bad_definitions() {
        let bad = vec![
            json!({ "name": "  " }),
            json!({ "triggers": [{ "id": "t", "type": "time", "schedule": "every tuesday" }] }),
            json!({ "conditions": [{ "type": "compound", "operator": "AND", "conditions": [] }] }),
            json!({ "conditions": [{ "type": "simple", "field": "memo", "operator": "matches", "value": "(" }] }),
            json!({ "actions": [{ "id": "a", "type": "transfer", "from_account": "c", "to_account": "s",
                                  "amount": { "mode": "fixed", "value": 0 } }] }),
            json!({ "actions": [{ "id": "a", "type": "transfer", "from_account": "c", "to_account": "s",
                                  "amount": { "mode": "percentage", "percent": 150 } }] }),
            json!({ "actions": [{ "id": "a", "type": "transfer", "from_account": "c", "to_account": "s",
                                  "amount": { "mode": "calculated", "expression": "amount *" } }] }),
            json!({ "actions": [{ "id": "a", "type": "ai_decision", "context": "x", "allowed_actions": [] }] }),
            json!({ "actions": [{ "id": "a", "type": "recommend", "prompt": "p",
                                  "retry": { "max_attempts": 0 } }] }),
        ];

        for extra in bad {
            assert!(check(extra.clone()).is_err(), "accepted {}", extra);
        }
    }

    #[test]
    fn test_depth_limit() {
        let mut condition = json!({ "type": "simple", "field": "amount", "operator": ">", "value": 1 });
        for _ in 0..3 {
            condition = json!({ "type": "compound", "operator": "NOT", "conditions": [condition] });
        }
        let def = definition(json!({ "conditions": [condition] }));

        let tight = ValidationLimits {
            max_condition_depth: 3,
            max_actions: 50,
        };
        assert!(matches!(
            validate_definition(&def, &tight),
            Err(EngineError::ConditionDepthExceeded(3))
        ));
        assert_ok!(validate_definition(&def, &ValidationLimits::default()));
    }
}
