//! Decision oracle interface
//!
//! The oracle is a capability that turns a prompt into free text. Nothing
//! outside `decision` interprets that text beyond substring checks.

use crate::error::EngineError;
use crate::models::{Agent, OracleExchange};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub mod decision;
pub mod gemini;
pub use decision::{parse_decision, AiDecision};
pub use gemini::GeminiOracle;

/// Natural-language reasoning collaborator
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn ask(&self, prompt: &str, metadata: &Value) -> Result<String>;
}

/// Call metadata: the agent's reasoning config forwarded verbatim.
pub fn oracle_metadata(agent: &Agent, purpose: &str) -> Value {
    json!({
        "agent_id": agent.agent_id,
        "owner_id": agent.owner_id,
        "purpose": purpose,
        "reasoning": agent.reasoning,
    })
}

/// Ask the oracle under a deadline and append the exchange to `transcript`.
pub async fn consult(
    oracle: &dyn DecisionOracle,
    prompt: String,
    metadata: &Value,
    purpose: &str,
    timeout: Duration,
    transcript: &mut Vec<OracleExchange>,
) -> Result<String> {
    debug!(purpose, prompt_len = prompt.len(), "Consulting oracle");

    let outcome = match tokio::time::timeout(timeout, oracle.ask(&prompt, metadata)).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout(format!(
            "oracle did not answer within {} ms",
            timeout.as_millis()
        ))),
    };

    let (response, error) = match &outcome {
        Ok(text) => (Some(text.clone()), None),
        Err(e) => {
            warn!(purpose, error = %e, "Oracle call failed");
            (None, Some(e.to_string()))
        }
    };

    transcript.push(OracleExchange {
        purpose: purpose.to_string(),
        prompt,
        response,
        error,
        at: Utc::now(),
    });

    outcome
}

/// Scripted oracle for development & testing.
/// Answers with the first rule whose needle occurs in the prompt.
pub struct MockOracle {
    rules: Vec<(String, String)>,
    default_response: Option<String>,
    failures_remaining: AtomicU32,
    delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
}

impl MockOracle {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            default_response: None,
            failures_remaining: AtomicU32::new(0),
            delay: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_rule(mut self, needle: &str, response: &str) -> Self {
        self.rules.push((needle.to_string(), response.to_string()));
        self
    }

    pub fn with_default(mut self, response: &str) -> Self {
        self.default_response = Some(response.to_string());
        self
    }

    /// Fail the next `count` calls with `OracleUnavailable`.
    pub fn failing_first(self, count: u32) -> Self {
        self.failures_remaining.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn prompts(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }
}

impl Default for MockOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DecisionOracle for MockOracle {
    async fn ask(&self, prompt: &str, _metadata: &Value) -> Result<String> {
        self.prompts.lock().await.push(prompt.to_string());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EngineError::OracleUnavailable("scripted outage".to_string()));
        }

        self.rules
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, response)| response.clone())
            .or_else(|| self.default_response.clone())
            .ok_or_else(|| EngineError::OracleUnavailable("no scripted response".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_consult_records_exchange() {
        let oracle = MockOracle::new().with_rule("salary", "YES, it is salary");
        let mut transcript = Vec::new();

        let answer = consult(
            &oracle,
            "Is this a salary credit?".to_string(),
            &json!({}),
            "condition",
            Duration::from_secs(1),
            &mut transcript,
        )
        .await
        .unwrap();

        assert_eq!(answer, "YES, it is salary");
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].purpose, "condition");
        assert!(transcript[0].error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consult_times_out() {
        let oracle = MockOracle::new()
            .with_default("late")
            .with_delay(Duration::from_secs(30));
        let mut transcript = Vec::new();

        let result = consult(
            &oracle,
            "anything".to_string(),
            &json!({}),
            "analyze",
            Duration::from_secs(5),
            &mut transcript,
        )
        .await;

        assert!(matches!(result, Err(EngineError::Timeout(_))));
        assert!(transcript[0].response.is_none());
        assert!(transcript[0].error.is_some());
    }

    #[tokio::test]
    async fn test_mock_oracle_scripted_failures() {
        let oracle = MockOracle::new().with_default("ok").failing_first(1);
        assert!(oracle.ask("x", &json!({})).await.is_err());
        assert_eq!(oracle.ask("x", &json!({})).await.unwrap(), "ok");
        assert_eq!(oracle.prompts().await.len(), 2);
    }
}
