use agent_rule_engine::{
    agent::{AgentManager, Orchestrator},
    api::{start_server, ApiState},
    conditions::ConditionEvaluator,
    config::EngineConfig,
    execution::ActionExecutor,
    operations::create_default_registry,
    oracle::{DecisionOracle, GeminiOracle, MockOracle},
    services::{
        FinancialApiClient, HttpNotificationChannel, HttpTransferService,
        InMemoryTransferService, NotificationChannel, RecordingNotificationChannel,
        TransferService,
    },
    state::{AgentStore, InMemoryAgentStore, PgAgentStore},
    triggers::{spawn_clock, Dispatcher, TriggerWatcher},
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = EngineConfig::from_env()?;

    info!("Agent Rule Engine - API Server");
    info!(port = config.port, "Configuration loaded");

    // Store
    let store: Arc<dyn AgentStore> = match &config.database_url {
        Some(url) => Arc::new(PgAgentStore::connect(url).await?),
        None => {
            warn!("DATABASE_URL not set, agents are kept in memory only");
            Arc::new(InMemoryAgentStore::new())
        }
    };

    // Decision oracle
    let oracle: Arc<dyn DecisionOracle> = match &config.gemini_api_key {
        Some(key) => Arc::new(GeminiOracle::new(key.clone(), config.gemini_model.as_deref())?),
        None => {
            warn!("GEMINI_API_KEY not set, AI conditions and actions will fail closed");
            Arc::new(MockOracle::new())
        }
    };

    // Financial services
    let api = match &config.financial_api_base_url {
        Some(url) => Some(FinancialApiClient::new(url, config.external_call_timeout)?),
        None => None,
    };
    let (transfers, notifications): (Arc<dyn TransferService>, Arc<dyn NotificationChannel>) =
        match &api {
            Some(api) => (
                Arc::new(HttpTransferService::new(api.clone())),
                Arc::new(HttpNotificationChannel::new(api.clone())),
            ),
            None => {
                warn!("FINANCIAL_API_BASE_URL not set, using the in-memory ledger");
                (
                    Arc::new(InMemoryTransferService::new()),
                    Arc::new(RecordingNotificationChannel::new()),
                )
            }
        };
    let operations = Arc::new(create_default_registry(
        api.as_ref(),
        &config.remote_operations,
    ));

    // Create components
    let evaluator = ConditionEvaluator::new(
        oracle.clone(),
        config.external_call_timeout,
        config.max_condition_depth,
    );
    let executor = ActionExecutor::new(
        transfers,
        notifications,
        oracle,
        operations,
        config.external_call_timeout,
        config.max_backoff,
    );
    let orchestrator = Arc::new(Orchestrator::new(store.clone(), evaluator, executor));

    let dispatcher = Arc::new(Dispatcher::new(orchestrator.clone(), config.agent_queue_depth));
    let watcher = Arc::new(TriggerWatcher::new(dispatcher, config.dedupe_window));
    watcher.sync_from_store(store.as_ref()).await?;
    let _clock = spawn_clock(watcher.clone(), config.clock_tick);

    let manager = Arc::new(
        AgentManager::new(store, config.validation_limits()).with_watcher(watcher.clone()),
    );

    info!("Engine initialized, starting API server");

    start_server(
        ApiState {
            manager,
            orchestrator,
            watcher,
        },
        config.port,
    )
    .await?;

    Ok(())
}
