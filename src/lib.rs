//! Agent Rule Engine
//!
//! The rule-execution core behind user-defined financial agents:
//! - Watches schedules, events, metric thresholds and detections
//! - Evaluates simple, compound and AI-assisted conditions
//! - Runs guarded, retryable actions (transfers, notifications, AI decisions)
//! - Enforces transfer permissions and limits, never clamping
//! - Seals every run into an immutable, verifiable audit record
//!
//! EXECUTION FLOW:
//! TRIGGER → CONDITIONS → ACTIONS → CLASSIFY → AUDIT → STATS

pub mod agent;
pub mod api;
pub mod audit;
pub mod conditions;
pub mod config;
pub mod context;
pub mod error;
pub mod execution;
pub mod expression;
pub mod gemini;
pub mod models;
pub mod operations;
pub mod oracle;
pub mod services;
pub mod state;
pub mod triggers;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use agent::{AgentManager, Orchestrator};
pub use config::EngineConfig;
