//! Oracle output adapter
//!
//! Turns free text into structured decisions. Anything that does not parse
//! is a failure of that call, never a panic and never a guess.

use crate::context::as_decimal;
use crate::error::EngineError;
use crate::Result;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiDecision {
    pub action: String,
    pub reasoning: String,
    pub parameters: Map<String, Value>,
}

impl AiDecision {
    pub fn amount(&self) -> Option<Decimal> {
        self.parameters.get("amount").and_then(as_decimal)
    }

    pub fn string_param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

/// Pull the JSON object out of a response that may be fenced or wrapped
/// in prose.
fn extract_json_object(response: &str) -> Option<Value> {
    let cleaned = response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    if let Ok(parsed) = serde_json::from_str::<Value>(cleaned) {
        if parsed.is_object() {
            return Some(parsed);
        }
    }

    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&cleaned[start..=end])
        .ok()
        .filter(Value::is_object)
}

/// Parse `{action, reasoning, parameters}`.
pub fn parse_decision(response: &str) -> Result<AiDecision> {
    let json = extract_json_object(response).ok_or_else(|| {
        EngineError::MalformedOracleResponse(format!("no JSON object in response: {}", response))
    })?;

    let action = json
        .get("action")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EngineError::MalformedOracleResponse("missing 'action'".to_string()))?
        .to_string();

    let reasoning = json
        .get("reasoning")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let parameters = match json.get("parameters") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => {
            return Err(EngineError::MalformedOracleResponse(
                "'parameters' must be an object".to_string(),
            ))
        }
    };

    Ok(AiDecision {
        action,
        reasoning,
        parameters,
    })
}

/// Numeric answer for AI-determined amounts: a decision with
/// `parameters.amount`, an object with `amount`, or a bare number.
pub fn parse_amount(response: &str) -> Result<Decimal> {
    if let Some(json) = extract_json_object(response) {
        let amount = json
            .get("parameters")
            .and_then(|p| p.get("amount"))
            .or_else(|| json.get("amount"))
            .and_then(as_decimal);
        return amount.ok_or_else(|| {
            EngineError::MalformedOracleResponse("decision carries no numeric amount".to_string())
        });
    }

    let bare = response.trim().trim_start_matches('₹').trim_start_matches('$').replace(',', "");
    Decimal::from_str(bare.trim()).map_err(|_| {
        EngineError::MalformedOracleResponse(format!("not a numeric amount: {}", response.trim()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_decision() {
        let raw = "```json\n{\"action\": \"transfer\", \"reasoning\": \"surplus\", \"parameters\": {\"amount\": 250}}\n```";
        let decision = parse_decision(raw).unwrap();
        assert_eq!(decision.action, "transfer");
        assert_eq!(decision.reasoning, "surplus");
        assert_eq!(decision.amount(), Some(Decimal::from(250)));
    }

    #[test]
    fn test_parse_decision_embedded_in_prose() {
        let raw = "Sure! Here you go: {\"action\": \"hold\"} Let me know.";
        let decision = parse_decision(raw).unwrap();
        assert_eq!(decision.action, "hold");
        assert!(decision.parameters.is_empty());
    }

    #[test]
    fn test_parse_decision_fails_closed() {
        assert!(matches!(
            parse_decision("I think you should transfer money"),
            Err(EngineError::MalformedOracleResponse(_))
        ));
        assert!(parse_decision("{\"reasoning\": \"no action\"}").is_err());
        assert!(parse_decision("{\"action\": \"x\", \"parameters\": [1]}").is_err());
    }

    #[test]
    fn test_parse_amount_variants() {
        assert_eq!(parse_amount("1,500").unwrap(), Decimal::from(1500));
        assert_eq!(parse_amount("{\"amount\": \"42.5\"}").unwrap(), Decimal::from_str("42.5").unwrap());
        assert_eq!(
            parse_amount("{\"action\":\"transfer\",\"parameters\":{\"amount\":300}}").unwrap(),
            Decimal::from(300)
        );
        assert!(parse_amount("a lot").is_err());
    }
}
