//! Gemini-backed decision oracle

use crate::gemini::GeminiClient;
use crate::oracle::DecisionOracle;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;

pub struct GeminiOracle {
    client: GeminiClient,
}

impl GeminiOracle {
    pub fn new(api_key: String, model: Option<&str>) -> Result<Self> {
        Ok(Self {
            client: GeminiClient::new(api_key, model)?,
        })
    }

    /// Persona and instructions from the agent's reasoning config.
    fn system_instructions(metadata: &Value) -> Option<String> {
        let reasoning = metadata.get("reasoning")?;
        let persona = reasoning.get("persona").and_then(Value::as_str);
        let instructions = reasoning.get("system_instructions").and_then(Value::as_str);

        match (persona, instructions) {
            (Some(p), Some(i)) => Some(format!("Persona: {}\n\n{}", p, i)),
            (Some(p), None) => Some(format!("Persona: {}", p)),
            (None, Some(i)) => Some(i.to_string()),
            (None, None) => None,
        }
    }
}

#[async_trait]
impl DecisionOracle for GeminiOracle {
    async fn ask(&self, prompt: &str, metadata: &Value) -> Result<String> {
        let temperature = metadata
            .get("reasoning")
            .and_then(|r| r.get("temperature"))
            .and_then(Value::as_f64)
            .map(|t| t as f32);

        let instructions = Self::system_instructions(metadata);
        self.client
            .generate(prompt, instructions.as_deref(), temperature)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_system_instructions_from_reasoning() {
        let metadata = json!({
            "reasoning": {"persona": "frugal advisor", "system_instructions": "Never exceed budgets."}
        });
        let text = GeminiOracle::system_instructions(&metadata).unwrap();
        assert!(text.contains("frugal advisor"));
        assert!(text.contains("Never exceed budgets."));
        assert!(GeminiOracle::system_instructions(&json!({})).is_none());
    }
}
