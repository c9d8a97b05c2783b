use agent_rule_engine::{
    agent::{validation::ValidationLimits, AgentManager, Orchestrator},
    audit,
    conditions::ConditionEvaluator,
    execution::ActionExecutor,
    models::{AgentDefinition, TriggerEvent},
    operations::create_default_registry,
    oracle::MockOracle,
    services::{InMemoryTransferService, RecordingNotificationChannel},
    state::InMemoryAgentStore,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    info!("Agent Rule Engine demo starting");

    // Create components
    let store = Arc::new(InMemoryAgentStore::new());
    let transfers = Arc::new(InMemoryTransferService::new());
    let notifications = Arc::new(RecordingNotificationChannel::new());
    let oracle = Arc::new(
        MockOracle::new()
            .with_rule("discretionary", "Yes, this looks like discretionary spending.")
            .with_default("No."),
    );

    let evaluator = ConditionEvaluator::new(oracle.clone(), Duration::from_secs(5), 16);
    let executor = ActionExecutor::new(
        transfers.clone(),
        notifications.clone(),
        oracle,
        Arc::new(create_default_registry(None, &[])),
        Duration::from_secs(5),
        Duration::from_secs(300),
    );
    let orchestrator = Orchestrator::new(store.clone(), evaluator, executor);
    let manager = AgentManager::new(store, ValidationLimits::default());

    // Create a sample agent
    let definition: AgentDefinition = serde_json::from_value(json!({
        "name": "Big spend saver",
        "description": "Moves 10% of every large discretionary purchase into savings",
        "category": "savings",
        "triggers": [{ "id": "tx", "type": "event", "event_type": "transaction.created" }],
        "conditions": [
            { "type": "simple", "field": "amount", "operator": ">", "value": 5000 },
            { "type": "ai_evaluated", "prompt": "Is this discretionary spending?", "expected_output": "yes" }
        ],
        "actions": [
            {
                "id": "save", "type": "transfer", "priority": 1,
                "from_account": "checking", "to_account": "savings",
                "amount": { "mode": "percentage", "percent": 10 },
                "memo": "Auto-save on {{transaction.merchant}}",
                "retry": { "max_attempts": 3, "backoff_seconds": 1 }
            },
            {
                "id": "tell", "type": "notify", "priority": 2,
                "channels": ["push"], "title": "Saved for you",
                "message": "You spent {{amount}} at {{transaction.merchant}}; 10% went to savings."
            }
        ],
        "permissions": {
            "can_transfer_money": true,
            "max_transaction_amount": 1000000,
            "requires_confirmation": false,
            "confirmation_threshold": 10000000,
            "allowed_accounts": ["checking", "savings"]
        }
    }))?;

    let agent = manager.create(Uuid::new_v4(), definition).await?;
    manager.activate(agent.agent_id).await?;

    for amount in [10_000, 4_000] {
        let trigger = TriggerEvent::manual(json!({
            "transaction": { "amount": amount, "merchant": "Electronics Hub" }
        }));

        info!(agent_id = %agent.agent_id, amount, "Running agent");

        let execution = orchestrator.execute(agent.agent_id, trigger).await?;

        println!("\n=== EXECUTION {} ===", execution.execution_id);
        println!("Transaction amount: {}", amount);
        println!("Conditions met: {}", execution.conditions_met);
        for condition in &execution.conditions_evaluated {
            println!("  [{}] {}: {}", if condition.passed { "x" } else { " " }, condition.description, condition.reason);
        }
        for outcome in &execution.actions_executed {
            println!(
                "  {} ({}) -> {:?} after {} attempt(s)",
                outcome.action_id,
                outcome.action_type,
                outcome.status,
                outcome.attempts.len()
            );
        }
        println!("Status: {:?}", execution.status);
        println!("Impact: {}", execution.impact);
        println!("Digest verified: {}", audit::verify(&execution));
    }

    let stored = manager.get(agent.agent_id).await?;
    println!("\n=== AGENT STATS ===");
    println!("Executions: {}", stored.stats.total_executions);
    println!("Successful: {}", stored.stats.successful_executions);
    println!("Total impact: {}", stored.stats.total_impact);
    println!("Ledger entries: {}", transfers.ledger().await.len());
    println!("Notifications sent: {}", notifications.sent().await.len());

    Ok(())
}
