//! Error types for the agent rule engine

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {

    // =============================
    // Orchestration Errors
    // =============================

    #[error("Agent not found: {0}")]
    AgentNotFound(Uuid),

    #[error("Agent {agent_id} is not active (status: {status})")]
    AgentNotActive { agent_id: Uuid, status: String },

    #[error("Invalid agent definition: {0}")]
    InvalidAgent(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // =============================
    // Policy Violations (never retried)
    // =============================

    #[error("PermissionDenied: {0}")]
    PermissionDenied(String),

    #[error("LimitExceeded: amount {amount} exceeds limit {limit}")]
    LimitExceeded { amount: Decimal, limit: Decimal },

    #[error("AccountNotAllowed: {0}")]
    AccountNotAllowed(String),

    #[error("DisallowedAIAction: {0}")]
    DisallowedAiAction(String),

    // =============================
    // Evaluation Errors
    // =============================

    #[error("EmptyCompoundCondition: {0} has no child conditions")]
    EmptyCompoundCondition(String),

    #[error("Condition tree exceeds maximum depth ({0})")]
    ConditionDepthExceeded(usize),

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    // =============================
    // Transient Errors (retry-eligible)
    // =============================

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Oracle unavailable: {0}")]
    OracleUnavailable(String),

    #[error("Malformed oracle response: {0}")]
    MalformedOracleResponse(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    // =============================
    // Storage & Configuration
    // =============================

    #[error("Version conflict for agent {0}")]
    VersionConflict(Uuid),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl EngineError {
    /// Whether an action failing with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Timeout(_)
                | EngineError::OracleUnavailable(_)
                | EngineError::MalformedOracleResponse(_)
                | EngineError::ServiceUnavailable(_)
                | EngineError::HttpError(_)
                | EngineError::IoError(_)
        )
    }

    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            EngineError::PermissionDenied(_)
                | EngineError::LimitExceeded { .. }
                | EngineError::AccountNotAllowed(_)
                | EngineError::DisallowedAiAction(_)
        )
    }

    /// Configuration mistakes the agent owner has to fix.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            EngineError::EmptyCompoundCondition(_) | EngineError::ConditionDepthExceeded(_)
        )
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::DatabaseError(err.to_string())
    }
}
