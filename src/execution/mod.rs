//! Action executor
//!
//! Runs an agent's actions one after another, enforcing transfer
//! permissions and retry policy. Failures never escape as errors; each one
//! becomes a failed `ActionOutcome` carrying its attempts.

use crate::context::{as_decimal, interpolate, lookup};
use crate::error::EngineError;
use crate::expression;
use crate::models::{
    Action, ActionKind, ActionOutcome, ActionStatus, Agent, AiDecisionAction, AmountSpec,
    AttemptRecord, NotificationPriority, NotifyAction, OracleExchange, TransferAction,
};
use crate::operations::OperationRegistry;
use crate::oracle::decision::parse_amount;
use crate::oracle::{consult, parse_decision, AiDecision, DecisionOracle};
use crate::services::{
    Notification, NotificationChannel, TransferRequest, TransferService, TransferStatus,
};
use crate::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What a single successful attempt produced.
struct Dispatched {
    status: ActionStatus,
    result: Value,
}

impl Dispatched {
    fn success(result: Value) -> Self {
        Self {
            status: ActionStatus::Success,
            result,
        }
    }
}

pub struct ActionExecutor {
    transfers: Arc<dyn TransferService>,
    notifications: Arc<dyn NotificationChannel>,
    oracle: Arc<dyn DecisionOracle>,
    operations: Arc<OperationRegistry>,
    call_timeout: Duration,
    max_backoff: Duration,
}

impl ActionExecutor {
    pub fn new(
        transfers: Arc<dyn TransferService>,
        notifications: Arc<dyn NotificationChannel>,
        oracle: Arc<dyn DecisionOracle>,
        operations: Arc<OperationRegistry>,
        call_timeout: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            transfers,
            notifications,
            oracle,
            operations,
            call_timeout,
            max_backoff,
        }
    }

    /// Run actions in priority order (stable, lower first). Disabled actions
    /// are recorded as skipped without being attempted.
    pub async fn execute_all(
        &self,
        actions: &[Action],
        agent: &Agent,
        context: &Value,
        metadata: &Value,
        transcript: &mut Vec<OracleExchange>,
    ) -> Vec<ActionOutcome> {
        let mut ordered: Vec<&Action> = actions.iter().collect();
        ordered.sort_by_key(|a| a.priority);

        let mut outcomes = Vec::with_capacity(ordered.len());

        for action in ordered {
            if !action.enabled {
                debug!(action_id = %action.id, "Skipping disabled action");
                outcomes.push(ActionOutcome {
                    action_id: action.id.clone(),
                    action_type: action.kind.type_name().to_string(),
                    status: ActionStatus::Skipped,
                    result: None,
                    error: None,
                    attempts: vec![],
                    execution_time_ms: 0,
                    timestamp: Utc::now(),
                });
                continue;
            }

            let outcome = self
                .run_with_retry(action, agent, context, metadata, transcript)
                .await;

            info!(
                agent_id = %agent.agent_id,
                action_id = %outcome.action_id,
                action_type = %outcome.action_type,
                status = ?outcome.status,
                attempts = outcome.attempts.len(),
                "Action finished"
            );
            outcomes.push(outcome);
        }

        outcomes
    }

    async fn run_with_retry(
        &self,
        action: &Action,
        agent: &Agent,
        context: &Value,
        metadata: &Value,
        transcript: &mut Vec<OracleExchange>,
    ) -> ActionOutcome {
        let start = Instant::now();
        let max_attempts = action.max_attempts();
        let backoff = Duration::from_secs(action.backoff_seconds()).min(self.max_backoff);
        let mut attempts = Vec::new();
        let mut attempt = 0;

        let (status, result, error) = loop {
            attempt += 1;

            match self
                .dispatch(&action.kind, agent, context, metadata, transcript)
                .await
            {
                Ok(done) => {
                    attempts.push(AttemptRecord {
                        attempt,
                        error: None,
                        at: Utc::now(),
                    });
                    break (done.status, Some(done.result), None);
                }
                Err(e) => {
                    attempts.push(AttemptRecord {
                        attempt,
                        error: Some(e.to_string()),
                        at: Utc::now(),
                    });

                    if !e.is_retryable() || attempt >= max_attempts {
                        warn!(
                            action_id = %action.id,
                            attempt,
                            error = %e,
                            "Action failed"
                        );
                        break (ActionStatus::Failed, None, Some(e.to_string()));
                    }

                    warn!(
                        action_id = %action.id,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Transient action failure, retrying"
                    );
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        };

        ActionOutcome {
            action_id: action.id.clone(),
            action_type: action.kind.type_name().to_string(),
            status,
            result,
            error,
            attempts,
            execution_time_ms: start.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    async fn dispatch(
        &self,
        kind: &ActionKind,
        agent: &Agent,
        context: &Value,
        metadata: &Value,
        transcript: &mut Vec<OracleExchange>,
    ) -> Result<Dispatched> {
        match kind {
            ActionKind::Transfer(transfer) => {
                self.transfer(transfer, agent, context, metadata, transcript)
                    .await
            }
            ActionKind::Notify(notify) => self.notify(notify, context).await,
            ActionKind::Analyze(analyze) => {
                let prompt = format!(
                    "Analyze the following financial activity{}.\n\n{}\n\nContext:\n{}",
                    analyze
                        .analysis_type
                        .as_deref()
                        .map(|t| format!(" ({})", t))
                        .unwrap_or_default(),
                    interpolate(&analyze.prompt, context),
                    context
                );
                let analysis = self
                    .ask(prompt, metadata, "analyze", transcript)
                    .await?;
                Ok(Dispatched::success(json!({
                    "analysis_type": analyze.analysis_type,
                    "analysis": analysis,
                })))
            }
            ActionKind::Recommend(recommend) => {
                let prompt = format!(
                    "Give one concrete recommendation.\n\n{}\n\nContext:\n{}",
                    interpolate(&recommend.prompt, context),
                    context
                );
                let recommendation = self
                    .ask(prompt, metadata, "recommend", transcript)
                    .await?;
                Ok(Dispatched::success(json!({ "recommendation": recommendation })))
            }
            ActionKind::AiDecision(decision) => {
                self.ai_decision(decision, agent, context, metadata, transcript)
                    .await
            }
            ActionKind::Execute(execute) => {
                let operation = self.operations.get(&execute.operation)?;
                let output = self
                    .bounded(
                        &format!("operation {}", execute.operation),
                        operation.run(&execute.parameters, context),
                    )
                    .await?;
                Ok(Dispatched::success(json!({
                    "operation": execute.operation,
                    "output": output,
                })))
            }
        }
    }

    // ===== Transfers =====

    async fn transfer(
        &self,
        transfer: &TransferAction,
        agent: &Agent,
        context: &Value,
        metadata: &Value,
        transcript: &mut Vec<OracleExchange>,
    ) -> Result<Dispatched> {
        ensure_can_transfer(agent)?;

        let amount = self
            .resolve_amount(&transfer.amount, context, metadata, transcript)
            .await?;

        let memo = transfer
            .memo
            .as_deref()
            .map(|m| interpolate(m, context))
            .unwrap_or_default();

        self.guarded_transfer(
            agent,
            TransferRequest {
                from_account: transfer.from_account.clone(),
                to_account: transfer.to_account.clone(),
                amount,
                memo,
            },
        )
        .await
    }

    async fn resolve_amount(
        &self,
        amount: &AmountSpec,
        context: &Value,
        metadata: &Value,
        transcript: &mut Vec<OracleExchange>,
    ) -> Result<Decimal> {
        match amount {
            AmountSpec::Fixed { value } => Ok(*value),
            AmountSpec::Percentage {
                percent,
                base_field,
            } => {
                let base = lookup(context, base_field)
                    .and_then(as_decimal)
                    .ok_or_else(|| {
                        EngineError::InvalidAction(format!(
                            "percentage base '{}' is missing or not numeric",
                            base_field
                        ))
                    })?;
                Ok(base * *percent / Decimal::ONE_HUNDRED)
            }
            AmountSpec::AiDetermined { prompt } => {
                let prompt = format!(
                    "{}\n\nContext:\n{}\n\nRespond with JSON: {{\"action\": \"transfer\", \"reasoning\": \"...\", \"parameters\": {{\"amount\": <number>}}}}",
                    interpolate(prompt, context),
                    context
                );
                let response = self.ask(prompt, metadata, "amount", transcript).await?;
                parse_amount(&response)
            }
            AmountSpec::Calculated { expression: source } => expression::evaluate(source, context),
        }
    }

    /// Permission, limit and account checks, then the confirmation rule.
    /// Shared by plain transfers and AI-decided ones.
    async fn guarded_transfer(&self, agent: &Agent, request: TransferRequest) -> Result<Dispatched> {
        let permissions = &agent.permissions;
        ensure_can_transfer(agent)?;

        if request.amount <= Decimal::ZERO {
            return Err(EngineError::InvalidAction(format!(
                "transfer amount must be positive, got {}",
                request.amount
            )));
        }

        if request.amount > permissions.max_transaction_amount {
            return Err(EngineError::LimitExceeded {
                amount: request.amount,
                limit: permissions.max_transaction_amount,
            });
        }

        for account in [&request.from_account, &request.to_account] {
            if !permissions.allowed_accounts.contains(account) {
                return Err(EngineError::AccountNotAllowed(account.clone()));
            }
        }

        let immediate = request.amount < permissions.confirmation_threshold
            && !permissions.requires_confirmation;

        if !immediate {
            info!(
                agent_id = %agent.agent_id,
                amount = %request.amount,
                "Transfer held for user confirmation"
            );
            return Ok(Dispatched {
                status: ActionStatus::PendingConfirmation,
                result: json!({
                    "from_account": request.from_account,
                    "to_account": request.to_account,
                    "amount": request.amount,
                    "status": TransferStatus::PendingConfirmation,
                    "reference": Value::Null,
                }),
            });
        }

        let receipt = self
            .bounded("transfer", self.transfers.transfer(&request))
            .await?;

        let status = match receipt.status {
            TransferStatus::Completed => ActionStatus::Success,
            TransferStatus::PendingConfirmation => ActionStatus::PendingConfirmation,
        };

        Ok(Dispatched {
            status,
            result: json!({
                "from_account": request.from_account,
                "to_account": request.to_account,
                "amount": request.amount,
                "status": receipt.status,
                "reference": receipt.reference,
            }),
        })
    }

    // ===== Notifications =====

    async fn notify(&self, notify: &NotifyAction, context: &Value) -> Result<Dispatched> {
        let notification = Notification {
            channels: notify.channels.clone(),
            title: interpolate(&notify.title, context),
            message: interpolate(&notify.message, context),
            priority: notify.priority,
        };

        self.deliver(&notification).await?;

        Ok(Dispatched::success(json!({
            "channels": notification.channels,
            "title": notification.title,
            "message": notification.message,
        })))
    }

    async fn deliver(&self, notification: &Notification) -> Result<()> {
        self.bounded("notification", self.notifications.send(notification))
            .await
    }

    // ===== AI decisions =====

    async fn ai_decision(
        &self,
        settings: &AiDecisionAction,
        agent: &Agent,
        context: &Value,
        metadata: &Value,
        transcript: &mut Vec<OracleExchange>,
    ) -> Result<Dispatched> {
        let prompt = decision_prompt(settings, context);
        let response = self.ask(prompt, metadata, "decision", transcript).await?;
        let decision = parse_decision(&response)?;

        if !settings
            .allowed_actions
            .iter()
            .any(|allowed| allowed == &decision.action)
        {
            warn!(
                agent_id = %agent.agent_id,
                action = %decision.action,
                "Oracle chose an action outside the allowed set"
            );
            return Err(EngineError::DisallowedAiAction(decision.action));
        }

        let decided = json!({
            "action": decision.action,
            "reasoning": decision.reasoning,
            "parameters": decision.parameters,
        });

        match decision.action.as_str() {
            "transfer" => {
                let request = decision_transfer(&decision)?;
                let mut done = self.guarded_transfer(agent, request).await?;
                if let Value::Object(map) = &mut done.result {
                    map.insert("decision".to_string(), decided);
                }
                Ok(done)
            }
            "notify" => {
                let notification = decision_notification(&decision);
                self.deliver(&notification).await?;
                Ok(Dispatched::success(json!({
                    "decision": decided,
                    "channels": notification.channels,
                    "title": notification.title,
                })))
            }
            _ => Ok(Dispatched::success(json!({ "decision": decided }))),
        }
    }

    // ===== Helpers =====

    async fn ask(
        &self,
        prompt: String,
        metadata: &Value,
        purpose: &str,
        transcript: &mut Vec<OracleExchange>,
    ) -> Result<String> {
        consult(
            self.oracle.as_ref(),
            prompt,
            metadata,
            purpose,
            self.call_timeout,
            transcript,
        )
        .await
    }

    async fn bounded<T>(&self, what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(format!(
                "{} did not complete within {} ms",
                what,
                self.call_timeout.as_millis()
            ))),
        }
    }
}

fn ensure_can_transfer(agent: &Agent) -> Result<()> {
    if agent.permissions.can_transfer_money {
        Ok(())
    } else {
        Err(EngineError::PermissionDenied(format!(
            "agent {} may not transfer money",
            agent.agent_id
        )))
    }
}

fn decision_prompt(settings: &AiDecisionAction, context: &Value) -> String {
    let constraints = if settings.safety_constraints.is_empty() {
        "none".to_string()
    } else {
        settings.safety_constraints
            .iter()
            .map(|c| format!("- {}", c))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        r#"{}

Context:
{}

Allowed actions: {}
Safety constraints:
{}

Respond ONLY with JSON:
{{"action": "<one of the allowed actions>", "reasoning": "<short explanation>", "parameters": {{}}}}
A transfer needs "from_account", "to_account" and "amount" parameters."#,
        interpolate(&settings.context, context),
        context,
        settings.allowed_actions.join(", "),
        constraints
    )
}

fn decision_transfer(decision: &AiDecision) -> Result<TransferRequest> {
    let account = |key: &str| {
        decision
            .string_param(key)
            .map(str::to_string)
            .ok_or_else(|| {
                EngineError::MalformedOracleResponse(format!("transfer decision lacks '{}'", key))
            })
    };

    Ok(TransferRequest {
        from_account: account("from_account")?,
        to_account: account("to_account")?,
        amount: decision.amount().ok_or_else(|| {
            EngineError::MalformedOracleResponse("transfer decision lacks 'amount'".to_string())
        })?,
        memo: decision
            .string_param("memo")
            .map(str::to_string)
            .unwrap_or_else(|| decision.reasoning.clone()),
    })
}

fn decision_notification(decision: &AiDecision) -> Notification {
    let channels = decision
        .parameters
        .get("channels")
        .and_then(Value::as_array)
        .map(|c| {
            c.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| vec!["in_app".to_string()]);

    Notification {
        channels,
        title: decision
            .string_param("title")
            .unwrap_or("Agent decision")
            .to_string(),
        message: decision
            .string_param("message")
            .map(str::to_string)
            .unwrap_or_else(|| decision.reasoning.clone()),
        priority: NotificationPriority::Normal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecuteAction, RecommendAction, RetryPolicy};
    use crate::operations::create_default_registry;
    use crate::oracle::MockOracle;
    use crate::services::{InMemoryTransferService, RecordingNotificationChannel};
    use crate::state::tests::sample_agent;
    use uuid::Uuid;

    struct Harness {
        executor: ActionExecutor,
        transfers: Arc<InMemoryTransferService>,
        notifications: Arc<RecordingNotificationChannel>,
    }

    fn harness_with(
        oracle: MockOracle,
        transfers: InMemoryTransferService,
        notifications: RecordingNotificationChannel,
    ) -> Harness {
        let transfers = Arc::new(transfers);
        let notifications = Arc::new(notifications);
        let executor = ActionExecutor::new(
            transfers.clone(),
            notifications.clone(),
            Arc::new(oracle),
            Arc::new(create_default_registry(None, &[])),
            Duration::from_secs(5),
            Duration::from_secs(300),
        );
        Harness {
            executor,
            transfers,
            notifications,
        }
    }

    fn harness(oracle: MockOracle) -> Harness {
        harness_with(
            oracle,
            InMemoryTransferService::new(),
            RecordingNotificationChannel::new(),
        )
    }

    fn transfer_agent() -> Agent {
        let mut agent = sample_agent(Uuid::new_v4());
        agent.permissions.can_transfer_money = true;
        agent.permissions.max_transaction_amount = Decimal::from(1_000_000);
        agent.permissions.requires_confirmation = false;
        agent.permissions.confirmation_threshold = Decimal::from(10_000_000);
        agent.permissions.allowed_accounts =
            ["checking".to_string(), "savings".to_string()].into_iter().collect();
        agent
    }

    fn action(id: &str, priority: i32, kind: ActionKind) -> Action {
        Action {
            id: id.to_string(),
            name: String::new(),
            enabled: true,
            priority,
            retry: None,
            kind,
        }
    }

    fn transfer_of(amount: AmountSpec) -> ActionKind {
        ActionKind::Transfer(TransferAction {
            from_account: "checking".into(),
            to_account: "savings".into(),
            amount,
            memo: Some("Auto-save {{amount}}".into()),
        })
    }

    fn notify_kind(message: &str) -> ActionKind {
        ActionKind::Notify(NotifyAction {
            channels: vec!["push".into()],
            title: "Saved".into(),
            message: message.into(),
            priority: NotificationPriority::Normal,
        })
    }

    async fn run(h: &Harness, agent: &Agent, actions: &[Action], context: Value) -> Vec<ActionOutcome> {
        let mut transcript = Vec::new();
        h.executor
            .execute_all(actions, agent, &context, &json!({}), &mut transcript)
            .await
    }

    #[tokio::test]
    async fn test_percentage_transfer_moves_money() {
        let h = harness(MockOracle::new());
        let agent = transfer_agent();
        let actions = vec![action(
            "save",
            0,
            transfer_of(AmountSpec::Percentage {
                percent: Decimal::from(10),
                base_field: "transaction.amount".into(),
            }),
        )];

        let outcomes = run(&h, &agent, &actions, json!({"transaction": {"amount": 10000}, "amount": 10000})).await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, ActionStatus::Success);
        let ledger = h.transfers.ledger().await;
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].request.amount, Decimal::from(1000));
        assert_eq!(ledger[0].request.memo, "Auto-save 10000");
        let result = outcomes[0].result.as_ref().unwrap();
        assert_eq!(as_decimal(&result["amount"]), Some(Decimal::from(1000)));
    }

    #[tokio::test]
    async fn test_limit_exceeded_is_not_retried() {
        let h = harness(MockOracle::new());
        let agent = transfer_agent();
        let mut save = action(
            "save",
            0,
            transfer_of(AmountSpec::Fixed {
                value: Decimal::from(2_000_000),
            }),
        );
        save.retry = Some(RetryPolicy {
            enabled: true,
            max_attempts: 3,
            backoff_seconds: 0,
        });

        let outcomes = run(&h, &agent, &[save], json!({})).await;

        assert_eq!(outcomes[0].status, ActionStatus::Failed);
        assert_eq!(outcomes[0].attempts.len(), 1);
        assert!(outcomes[0].error.as_ref().unwrap().contains("LimitExceeded"));
        assert_eq!(h.transfers.calls(), 0);
    }

    #[tokio::test]
    async fn test_policy_checks() {
        let h = harness(MockOracle::new());
        let fixed = |v: i64| transfer_of(AmountSpec::Fixed { value: Decimal::from(v) });

        let mut no_transfer = transfer_agent();
        no_transfer.permissions.can_transfer_money = false;
        let outcomes = run(&h, &no_transfer, &[action("a", 0, fixed(10))], json!({})).await;
        assert!(outcomes[0].error.as_ref().unwrap().contains("PermissionDenied"));

        let mut narrow = transfer_agent();
        narrow.permissions.allowed_accounts = ["checking".to_string()].into_iter().collect();
        let outcomes = run(&h, &narrow, &[action("a", 0, fixed(10))], json!({})).await;
        assert!(outcomes[0].error.as_ref().unwrap().contains("AccountNotAllowed"));

        let outcomes = run(&h, &transfer_agent(), &[action("a", 0, fixed(0))], json!({})).await;
        assert_eq!(outcomes[0].status, ActionStatus::Failed);

        assert_eq!(h.transfers.calls(), 0);
    }

    #[tokio::test]
    async fn test_confirmation_required_holds_transfer() {
        let h = harness(MockOracle::new());
        let mut agent = transfer_agent();
        agent.permissions.requires_confirmation = true;

        let outcomes = run(
            &h,
            &agent,
            &[action("a", 0, transfer_of(AmountSpec::Fixed { value: Decimal::from(50) }))],
            json!({}),
        )
        .await;

        assert_eq!(outcomes[0].status, ActionStatus::PendingConfirmation);
        assert!(outcomes[0].is_success());
        assert_eq!(h.transfers.calls(), 0);

        // At or above the threshold is held as well.
        let mut agent = transfer_agent();
        agent.permissions.confirmation_threshold = Decimal::from(50);
        let outcomes = run(
            &h,
            &agent,
            &[action("a", 0, transfer_of(AmountSpec::Fixed { value: Decimal::from(50) }))],
            json!({}),
        )
        .await;
        assert_eq!(outcomes[0].status, ActionStatus::PendingConfirmation);
        assert_eq!(h.transfers.calls(), 0);
    }

    #[tokio::test]
    async fn test_calculated_and_ai_determined_amounts() {
        let h = harness(MockOracle::new().with_rule("How much", r#"{"amount": 125.5}"#));
        let agent = transfer_agent();
        let actions = vec![
            action(
                "calc",
                0,
                transfer_of(AmountSpec::Calculated {
                    expression: "min(amount * 0.05, 300)".into(),
                }),
            ),
            action(
                "ai",
                1,
                transfer_of(AmountSpec::AiDetermined {
                    prompt: "How much should be saved?".into(),
                }),
            ),
        ];

        let outcomes = run(&h, &agent, &actions, json!({"amount": 10000})).await;

        assert!(outcomes.iter().all(|o| o.status == ActionStatus::Success));
        let ledger = h.transfers.ledger().await;
        assert_eq!(ledger[0].request.amount, Decimal::from(300));
        assert_eq!(ledger[1].request.amount, Decimal::new(1255, 1));
    }

    #[tokio::test]
    async fn test_priority_order_and_disabled_skip() {
        let h = harness(MockOracle::new());
        let mut disabled = action("off", 0, notify_kind("never"));
        disabled.enabled = false;
        let actions = vec![
            action("second", 5, notify_kind("second")),
            disabled,
            action("first", 1, notify_kind("first {{merchant}}")),
            action("third", 5, notify_kind("third")),
        ];

        let outcomes = run(&h, &transfer_agent(), &actions, json!({"merchant": "Cafe"})).await;

        let order: Vec<&str> = outcomes.iter().map(|o| o.action_id.as_str()).collect();
        assert_eq!(order, vec!["off", "first", "second", "third"]);
        assert_eq!(outcomes[0].status, ActionStatus::Skipped);
        assert!(outcomes[0].attempts.is_empty());

        let sent = h.notifications.sent().await;
        let messages: Vec<&str> = sent.iter().map(|n| n.message.as_str()).collect();
        assert_eq!(messages, vec!["first Cafe", "second", "third"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retries_with_backoff() {
        let h = harness_with(
            MockOracle::new(),
            InMemoryTransferService::new(),
            RecordingNotificationChannel::new().failing_first(2),
        );
        let mut notify = action("n", 0, notify_kind("hello"));
        notify.retry = Some(RetryPolicy {
            enabled: true,
            max_attempts: 3,
            backoff_seconds: 2,
        });

        let started = tokio::time::Instant::now();
        let outcomes = run(&h, &transfer_agent(), &[notify], json!({})).await;

        assert_eq!(outcomes[0].status, ActionStatus::Success);
        assert_eq!(outcomes[0].attempts.len(), 3);
        assert!(outcomes[0].attempts[0].error.is_some());
        assert!(outcomes[0].attempts[2].error.is_none());
        assert!(started.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_reports_last_error() {
        let h = harness_with(
            MockOracle::new(),
            InMemoryTransferService::new().failing_first(10),
            RecordingNotificationChannel::new(),
        );
        let mut save = action("save", 0, transfer_of(AmountSpec::Fixed { value: Decimal::from(10) }));
        save.retry = Some(RetryPolicy {
            enabled: true,
            max_attempts: 3,
            backoff_seconds: 0,
        });

        let outcomes = run(&h, &transfer_agent(), &[save], json!({})).await;

        assert_eq!(outcomes[0].status, ActionStatus::Failed);
        assert_eq!(outcomes[0].attempts.len(), 3);
        assert_eq!(h.transfers.calls(), 3);
        assert!(outcomes[0].error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_transfer_times_out_and_retries() {
        let h = harness_with(
            MockOracle::new(),
            InMemoryTransferService::new().with_delay(Duration::from_secs(60)),
            RecordingNotificationChannel::new(),
        );
        let mut save = action("save", 0, transfer_of(AmountSpec::Fixed { value: Decimal::from(10) }));
        save.retry = Some(RetryPolicy {
            enabled: true,
            max_attempts: 2,
            backoff_seconds: 1,
        });

        let outcomes = run(&h, &transfer_agent(), &[save], json!({})).await;

        assert_eq!(outcomes[0].status, ActionStatus::Failed);
        assert_eq!(outcomes[0].attempts.len(), 2);
        assert_eq!(h.transfers.calls(), 2);
        assert!(h.transfers.ledger().await.is_empty());
        assert!(outcomes[0]
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("Timed out")));
    }

    #[tokio::test]
    async fn test_ai_decision_outside_allowed_set() {
        let h = harness(MockOracle::new().with_default(
            r#"{"action": "sell_all", "reasoning": "panic", "parameters": {}}"#,
        ));
        let decide = action(
            "decide",
            0,
            ActionKind::AiDecision(AiDecisionAction {
                context: "Market dropped".into(),
                allowed_actions: vec!["notify".into(), "hold".into()],
                safety_constraints: vec!["never sell".into()],
            }),
        );

        let outcomes = run(&h, &transfer_agent(), &[decide], json!({})).await;

        assert_eq!(outcomes[0].status, ActionStatus::Failed);
        assert!(outcomes[0].error.as_ref().unwrap().starts_with("DisallowedAIAction"));
        assert_eq!(h.transfers.calls(), 0);
        assert!(h.notifications.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_ai_decision_transfer_goes_through_limits() {
        let h = harness(MockOracle::new().with_default(
            r#"{"action": "transfer", "reasoning": "surplus", "parameters": {"from_account": "checking", "to_account": "savings", "amount": 5000000}}"#,
        ));
        let decide = action(
            "decide",
            0,
            ActionKind::AiDecision(AiDecisionAction {
                context: "Surplus cash".into(),
                allowed_actions: vec!["transfer".into()],
                safety_constraints: vec![],
            }),
        );

        let outcomes = run(&h, &transfer_agent(), &[decide], json!({})).await;

        assert_eq!(outcomes[0].status, ActionStatus::Failed);
        assert!(outcomes[0].error.as_ref().unwrap().contains("LimitExceeded"));
        assert_eq!(h.transfers.calls(), 0);
    }

    #[tokio::test]
    async fn test_recommend_and_execute() {
        let h = harness(MockOracle::new().with_rule("recommendation", "Cut dining out"));
        let actions = vec![
            action(
                "rec",
                0,
                ActionKind::Recommend(RecommendAction {
                    prompt: "Spending is up".into(),
                }),
            ),
            action(
                "snap",
                1,
                ActionKind::Execute(ExecuteAction {
                    operation: "snapshot_context".into(),
                    parameters: json!({"fields": ["amount"]}),
                }),
            ),
            action(
                "missing",
                2,
                ActionKind::Execute(ExecuteAction {
                    operation: "launch_rocket".into(),
                    parameters: Value::Null,
                }),
            ),
        ];

        let mut transcript = Vec::new();
        let outcomes = h
            .executor
            .execute_all(&actions, &transfer_agent(), &json!({"amount": 42}), &json!({}), &mut transcript)
            .await;

        assert_eq!(outcomes[0].result.as_ref().unwrap()["recommendation"], "Cut dining out");
        assert_eq!(outcomes[1].result.as_ref().unwrap()["output"]["snapshot"]["amount"], 42);
        assert_eq!(outcomes[2].status, ActionStatus::Failed);
        assert_eq!(transcript.len(), 1);
    }
}
