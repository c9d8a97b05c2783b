//! Core data models for the agent rule engine

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

fn default_true() -> bool {
    true
}

fn default_base_field() -> String {
    "transaction.amount".to_string()
}

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentCategory {
    Savings,
    Investment,
    Spending,
    Tax,
    Debt,
    Custom,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

impl AgentStatus {
    /// Allowed lifecycle moves. Archiving is terminal.
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, next),
            (Draft, Active)
                | (Paused, Active)
                | (Active, Paused)
                | (Draft, Archived)
                | (Active, Archived)
                | (Paused, Archived)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Draft => "draft",
            AgentStatus::Active => "active",
            AgentStatus::Paused => "paused",
            AgentStatus::Archived => "archived",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ComparisonOperator {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "matches")]
    Matches,
}

impl ComparisonOperator {
    pub fn symbol(&self) -> &'static str {
        match self {
            ComparisonOperator::GreaterThan => ">",
            ComparisonOperator::LessThan => "<",
            ComparisonOperator::GreaterOrEqual => ">=",
            ComparisonOperator::LessOrEqual => "<=",
            ComparisonOperator::Equal => "==",
            ComparisonOperator::NotEqual => "!=",
            ComparisonOperator::Contains => "contains",
            ComparisonOperator::Matches => "matches",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOperator {
    And,
    Or,
    Not,
}

impl LogicalOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogicalOperator::And => "AND",
            LogicalOperator::Or => "OR",
            LogicalOperator::Not => "NOT",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

//
// ================= Agent =================
//

/// Oracle persona settings. The engine never interprets these; they are
/// forwarded to the oracle as call metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReasoningConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Permissions {
    #[serde(default)]
    pub can_transfer_money: bool,
    #[serde(default)]
    pub max_transaction_amount: Decimal,
    #[serde(default = "default_true")]
    pub requires_confirmation: bool,
    #[serde(default)]
    pub confirmation_threshold: Decimal,
    #[serde(default)]
    pub allowed_accounts: BTreeSet<String>,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            can_transfer_money: false,
            max_transaction_amount: Decimal::ZERO,
            requires_confirmation: true,
            confirmation_threshold: Decimal::ZERO,
            allowed_accounts: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentStats {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub partial_executions: u64,
    pub failed_executions: u64,
    pub average_execution_time_ms: f64,
    pub total_impact: Decimal,
    pub last_executed_at: Option<DateTime<Utc>>,
}

impl AgentStats {
    /// Fold one finished execution into the running aggregates.
    pub fn record(&mut self, execution: &Execution) {
        self.total_executions += 1;
        match execution.status {
            ExecutionStatus::Success => self.successful_executions += 1,
            ExecutionStatus::PartialSuccess => self.partial_executions += 1,
            ExecutionStatus::Failed => self.failed_executions += 1,
        }

        let n = self.total_executions as f64;
        self.average_execution_time_ms +=
            (execution.execution_time_ms as f64 - self.average_execution_time_ms) / n;

        self.total_impact += execution.impact;
        self.last_executed_at = Some(execution.created_at);
    }
}

/// User-editable part of an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category: AgentCategory,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub permissions: Permissions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub description: String,
    pub category: AgentCategory,
    pub status: AgentStatus,
    pub reasoning: ReasoningConfig,
    pub triggers: Vec<Trigger>,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
    pub permissions: Permissions,
    #[serde(default)]
    pub stats: AgentStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Bumped by the store on every successful save.
    #[serde(default)]
    pub version: u64,
}

impl Agent {
    pub fn from_definition(owner_id: Uuid, definition: AgentDefinition) -> Self {
        let now = Utc::now();
        Self {
            agent_id: Uuid::new_v4(),
            owner_id,
            name: definition.name,
            description: definition.description,
            category: definition.category,
            status: AgentStatus::Draft,
            reasoning: definition.reasoning,
            triggers: definition.triggers,
            conditions: definition.conditions,
            actions: definition.actions,
            permissions: definition.permissions,
            stats: AgentStats::default(),
            created_at: now,
            updated_at: now,
            last_run_at: None,
            version: 0,
        }
    }

    /// Replace the editable fields, keeping identity, status and stats.
    pub fn apply_definition(&mut self, definition: AgentDefinition) {
        self.name = definition.name;
        self.description = definition.description;
        self.category = definition.category;
        self.reasoning = definition.reasoning;
        self.triggers = definition.triggers;
        self.conditions = definition.conditions;
        self.actions = definition.actions;
        self.permissions = definition.permissions;
        self.updated_at = Utc::now();
    }

    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }
}

//
// ================= Triggers =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub operator: ComparisonOperator,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trigger {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: TriggerKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    Time {
        schedule: String,
    },
    Event {
        event_type: String,
        #[serde(default)]
        filters: Vec<FieldFilter>,
    },
    Threshold {
        metric: String,
        operator: ComparisonOperator,
        value: f64,
    },
    Pattern {
        description: String,
        min_confidence: f64,
    },
    AiDetected {
        description: String,
        min_confidence: f64,
    },
}

impl TriggerKind {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            TriggerKind::Time { .. } => TriggerType::Time,
            TriggerKind::Event { .. } => TriggerType::Event,
            TriggerKind::Threshold { .. } => TriggerType::Threshold,
            TriggerKind::Pattern { .. } => TriggerType::Pattern,
            TriggerKind::AiDetected { .. } => TriggerType::AiDetected,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Time,
    Event,
    Threshold,
    Pattern,
    AiDetected,
    Manual,
}

/// What fired: handed to the orchestrator by the watcher or a manual call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_id: Option<String>,
    pub fired_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl TriggerEvent {
    pub fn new(trigger_type: TriggerType, trigger_id: Option<String>, payload: Value) -> Self {
        Self {
            trigger_type,
            trigger_id,
            fired_at: Utc::now(),
            payload,
        }
    }

    pub fn manual(payload: Value) -> Self {
        Self::new(TriggerType::Manual, None, payload)
    }
}

//
// ================= Conditions =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Simple {
        field: String,
        operator: ComparisonOperator,
        value: Value,
    },
    Compound {
        operator: LogicalOperator,
        #[serde(default)]
        conditions: Vec<Condition>,
    },
    AiEvaluated {
        prompt: String,
        expected_output: String,
    },
}

impl Condition {
    pub fn kind(&self) -> &'static str {
        match self {
            Condition::Simple { .. } => "simple",
            Condition::Compound { .. } => "compound",
            Condition::AiEvaluated { .. } => "ai_evaluated",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Condition::Simple {
                field,
                operator,
                value,
            } => format!("{} {} {}", field, operator.symbol(), value),
            Condition::Compound {
                operator,
                conditions,
            } => format!("{}({} conditions)", operator.as_str(), conditions.len()),
            Condition::AiEvaluated { prompt, .. } => format!("AI: {}", prompt),
        }
    }

    /// Nesting depth; a leaf has depth 1.
    pub fn depth(&self) -> usize {
        match self {
            Condition::Compound { conditions, .. } => {
                1 + conditions.iter().map(Condition::depth).max().unwrap_or(0)
            }
            _ => 1,
        }
    }
}

//
// ================= Actions =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(flatten)]
    pub kind: ActionKind,
}

impl Action {
    /// Total attempts allowed, including the first one.
    pub fn max_attempts(&self) -> u32 {
        match &self.retry {
            Some(policy) if policy.enabled => policy.max_attempts.max(1),
            _ => 1,
        }
    }

    pub fn backoff_seconds(&self) -> u64 {
        match &self.retry {
            Some(policy) if policy.enabled => policy.backoff_seconds,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    Transfer(TransferAction),
    Notify(NotifyAction),
    Analyze(AnalyzeAction),
    Recommend(RecommendAction),
    AiDecision(AiDecisionAction),
    Execute(ExecuteAction),
}

impl ActionKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ActionKind::Transfer(_) => "transfer",
            ActionKind::Notify(_) => "notify",
            ActionKind::Analyze(_) => "analyze",
            ActionKind::Recommend(_) => "recommend",
            ActionKind::AiDecision(_) => "ai_decision",
            ActionKind::Execute(_) => "execute",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferAction {
    pub from_account: String,
    pub to_account: String,
    pub amount: AmountSpec,
    #[serde(default)]
    pub memo: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AmountSpec {
    Fixed {
        value: Decimal,
    },
    Percentage {
        percent: Decimal,
        #[serde(default = "default_base_field")]
        base_field: String,
    },
    AiDetermined {
        prompt: String,
    },
    Calculated {
        expression: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotifyAction {
    pub channels: Vec<String>,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub priority: NotificationPriority,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyzeAction {
    pub prompt: String,
    #[serde(default)]
    pub analysis_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecommendAction {
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiDecisionAction {
    pub context: String,
    pub allowed_actions: Vec<String>,
    #[serde(default)]
    pub safety_constraints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecuteAction {
    pub operation: String,
    #[serde(default)]
    pub parameters: Value,
}

//
// ================= Execution Record =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionResult {
    pub kind: String,
    pub description: String,
    pub passed: bool,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ConditionResult>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Failed,
    Skipped,
    PendingConfirmation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionOutcome {
    pub action_id: String,
    pub action_type: String,
    pub status: ActionStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    pub execution_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl ActionOutcome {
    /// A pending confirmation counts as success at this level.
    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            ActionStatus::Success | ActionStatus::PendingConfirmation
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    PartialSuccess,
    Failed,
}

/// One prompt/response pair sent to the decision oracle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OracleExchange {
    pub purpose: String,
    pub prompt: String,
    pub response: Option<String>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerProvenance {
    pub trigger_type: TriggerType,
    pub trigger_id: Option<String>,
    pub fired_at: DateTime<Utc>,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub execution_id: Uuid,
    pub agent_id: Uuid,
    pub owner_id: Uuid,
    pub trigger: TriggerProvenance,
    pub conditions_evaluated: Vec<ConditionResult>,
    pub conditions_met: bool,
    pub actions_executed: Vec<ActionOutcome>,
    pub status: ExecutionStatus,
    pub execution_time_ms: u64,
    pub impact: Decimal,
    pub oracle_transcript: Vec<OracleExchange>,
    #[serde(default)]
    pub configuration_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// SHA-256 over the record with this field blank.
    #[serde(default)]
    pub digest: String,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for AgentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentCategory::Savings => "Savings",
            AgentCategory::Investment => "Investment",
            AgentCategory::Spending => "Spending",
            AgentCategory::Tax => "Tax",
            AgentCategory::Debt => "Debt",
            AgentCategory::Custom => "Custom",
        };
        write!(f, "{}", s)
    }
}
