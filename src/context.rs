//! Evaluation context built from a trigger event
//!
//! Conditions, amount expressions and message templates all read from the
//! same JSON document via dotted paths (`transaction.amount`, `items.0.id`).

use crate::models::{Agent, TriggerEvent};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use std::str::FromStr;

/// Build the context document for one execution.
///
/// Payload keys are copied to the top level. When the payload carries a
/// `transaction` object, its `amount` is also exposed as `amount` unless the
/// payload already defines one.
pub fn build_context(agent: &Agent, event: &TriggerEvent) -> Value {
    let mut root = Map::new();

    if let Value::Object(payload) = &event.payload {
        for (key, value) in payload {
            root.insert(key.clone(), value.clone());
        }
    } else if !event.payload.is_null() {
        root.insert("payload".to_string(), event.payload.clone());
    }

    if !root.contains_key("amount") {
        if let Some(amount) = lookup(&event.payload, "transaction.amount") {
            root.insert("amount".to_string(), amount.clone());
        }
    }

    root.insert(
        "trigger".to_string(),
        json!({
            "type": event.trigger_type,
            "id": event.trigger_id,
            "fired_at": event.fired_at.to_rfc3339(),
        }),
    );
    root.insert(
        "agent".to_string(),
        json!({
            "id": agent.agent_id,
            "name": agent.name,
            "category": agent.category,
        }),
    );

    Value::Object(root)
}

/// Resolve a dotted path. Numeric segments index into arrays.
pub fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return Some(root);
    }

    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Zero value shaped like `example`, used when a path is missing.
pub fn zero_like(example: &Value) -> Value {
    match example {
        Value::Number(_) => json!(0),
        Value::String(_) => json!(""),
        Value::Bool(_) => json!(false),
        Value::Array(_) => json!([]),
        Value::Object(_) => json!({}),
        Value::Null => Value::Null,
    }
}

/// Numeric view of a value; numeric strings coerce.
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

pub fn as_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Decimal::from(i))
            } else if let Some(u) = n.as_u64() {
                Some(Decimal::from(u))
            } else {
                n.as_f64().and_then(Decimal::from_f64)
            }
        }
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

/// String view used by `contains`/`matches`: strings verbatim, everything
/// else as compact JSON.
pub fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replace `{{path}}` placeholders with context values. Unknown paths
/// render as empty strings.
pub fn interpolate(template: &str, context: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let path = after[..end].trim();
                if let Some(value) = lookup(context, path) {
                    out.push_str(&as_text(value));
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}
