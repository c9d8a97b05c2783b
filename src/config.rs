//! Engine configuration
//!
//! Read from the environment (after `.env` is loaded by the binaries).
//! Everything except secrets has a default.

use crate::agent::validation::ValidationLimits;
use crate::error::EngineError;
use crate::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline for every oracle, transfer and notification call
    pub external_call_timeout: Duration,
    /// Pending triggers kept per agent before new ones are dropped
    pub agent_queue_depth: usize,
    pub max_condition_depth: usize,
    pub max_actions_per_agent: usize,
    /// Upper bound on a single backoff sleep
    pub max_backoff: Duration,
    pub clock_tick: Duration,
    /// Recent trigger occurrences remembered for de-duplication
    pub dedupe_window: usize,
    pub gemini_api_key: Option<String>,
    pub gemini_model: Option<String>,
    pub financial_api_base_url: Option<String>,
    pub database_url: Option<String>,
    pub remote_operations: Vec<String>,
    pub port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            external_call_timeout: Duration::from_secs(5),
            agent_queue_depth: 8,
            max_condition_depth: 16,
            max_actions_per_agent: 50,
            max_backoff: Duration::from_secs(300),
            clock_tick: Duration::from_secs(30),
            dedupe_window: 1024,
            gemini_api_key: None,
            gemini_model: None,
            financial_api_base_url: None,
            database_url: None,
            remote_operations: Vec::new(),
            port: 8080,
        }
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(key: &str, default: T) -> Result<T> {
    match non_empty(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| EngineError::Config(format!("{} has invalid value '{}'", key, raw))),
        None => Ok(default),
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let timeout_ms = parse_var(
            "AGENT_CALL_TIMEOUT_MS",
            defaults.external_call_timeout.as_millis() as u64,
        )?;
        let tick_secs = parse_var("AGENT_TICK_SECS", defaults.clock_tick.as_secs())?;
        let max_backoff_secs = parse_var("AGENT_MAX_BACKOFF_SECS", defaults.max_backoff.as_secs())?;

        let port = match non_empty("PORT") {
            Some(_) => parse_var("PORT", defaults.port)?,
            None => parse_var("API_PORT", defaults.port)?,
        };

        let config = Self {
            external_call_timeout: Duration::from_millis(timeout_ms),
            agent_queue_depth: parse_var("AGENT_QUEUE_DEPTH", defaults.agent_queue_depth)?,
            max_condition_depth: parse_var(
                "AGENT_MAX_CONDITION_DEPTH",
                defaults.max_condition_depth,
            )?,
            max_actions_per_agent: parse_var("AGENT_MAX_ACTIONS", defaults.max_actions_per_agent)?,
            max_backoff: Duration::from_secs(max_backoff_secs),
            clock_tick: Duration::from_secs(tick_secs),
            dedupe_window: parse_var("AGENT_DEDUPE_WINDOW", defaults.dedupe_window)?,
            gemini_api_key: non_empty("GEMINI_API_KEY"),
            gemini_model: non_empty("GEMINI_MODEL"),
            financial_api_base_url: non_empty("FINANCIAL_API_BASE_URL"),
            database_url: non_empty("DATABASE_URL"),
            remote_operations: non_empty("AGENT_OPERATIONS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            port,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validation_limits(&self) -> ValidationLimits {
        ValidationLimits {
            max_condition_depth: self.max_condition_depth,
            max_actions: self.max_actions_per_agent,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.external_call_timeout.is_zero() {
            return Err(EngineError::Config(
                "AGENT_CALL_TIMEOUT_MS must be positive".to_string(),
            ));
        }
        if self.agent_queue_depth == 0 {
            return Err(EngineError::Config(
                "AGENT_QUEUE_DEPTH must be at least 1".to_string(),
            ));
        }
        if self.max_condition_depth == 0 {
            return Err(EngineError::Config(
                "AGENT_MAX_CONDITION_DEPTH must be at least 1".to_string(),
            ));
        }
        if self.clock_tick.is_zero() {
            return Err(EngineError::Config("AGENT_TICK_SECS must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert_ok!(config.validate());
        assert_eq!(config.external_call_timeout, Duration::from_secs(5));
        assert_eq!(config.agent_queue_depth, 8);
    }

    #[test]
    fn test_zero_queue_depth_rejected() {
        let config = EngineConfig {
            agent_queue_depth: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));

        let config = EngineConfig {
            clock_tick: Duration::ZERO,
            ..EngineConfig::default()
        };
        assert_err!(config.validate());
    }

    #[test]
    fn test_validation_limits_follow_config() {
        let config = EngineConfig {
            max_condition_depth: 4,
            max_actions_per_agent: 7,
            ..EngineConfig::default()
        };
        let limits = config.validation_limits();
        assert_eq!(limits.max_condition_depth, 4);
        assert_eq!(limits.max_actions, 7);
    }
}
