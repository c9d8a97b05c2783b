//! Execution orchestrator - one agent run from trigger to audit record
//!
//! TRIGGER → CONDITIONS → ACTIONS → CLASSIFY → AUDIT → STATS

use crate::audit;
use crate::conditions::ConditionEvaluator;
use crate::context::{as_decimal, build_context};
use crate::error::EngineError;
use crate::execution::ActionExecutor;
use crate::models::{
    ActionOutcome, ActionStatus, Execution, ExecutionStatus, TriggerEvent, TriggerProvenance,
};
use crate::oracle::oracle_metadata;
use crate::state::AgentStore;
use crate::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub mod lifecycle;
pub mod validation;
pub use lifecycle::AgentManager;

/// Attempts at the stats compare-and-swap before giving up.
const MAX_STATS_RETRIES: u32 = 5;

/// `success` when nothing failed, `partial_success` when some succeeded and
/// some failed, `failed` when none succeeded. Skipped actions do not count.
pub fn classify_outcomes(outcomes: &[ActionOutcome]) -> ExecutionStatus {
    let attempted = outcomes
        .iter()
        .filter(|o| o.status != ActionStatus::Skipped);

    let (succeeded, failed) = attempted.fold((0usize, 0usize), |(s, f), o| {
        if o.is_success() {
            (s + 1, f)
        } else {
            (s, f + 1)
        }
    });

    match (succeeded, failed) {
        (_, 0) => ExecutionStatus::Success,
        (0, _) => ExecutionStatus::Failed,
        _ => ExecutionStatus::PartialSuccess,
    }
}

/// Sum of `amount` over completed actions. Pending confirmations move no
/// money yet and contribute nothing.
pub fn compute_impact(outcomes: &[ActionOutcome]) -> Decimal {
    outcomes
        .iter()
        .filter(|o| o.status == ActionStatus::Success)
        .filter_map(|o| o.result.as_ref())
        .filter_map(|r| r.get("amount").and_then(as_decimal))
        .sum()
}

pub struct Orchestrator {
    store: Arc<dyn AgentStore>,
    evaluator: ConditionEvaluator,
    executor: ActionExecutor,
    agent_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn AgentStore>,
        evaluator: ConditionEvaluator,
        executor: ActionExecutor,
    ) -> Self {
        Self {
            store,
            evaluator,
            executor,
            agent_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> Arc<dyn AgentStore> {
        self.store.clone()
    }

    async fn agent_lock(&self, agent_id: Uuid) -> Arc<Mutex<()>> {
        self.agent_locks
            .lock()
            .await
            .entry(agent_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run one execution. Only a missing/inactive agent or a failure to
    /// persist the audit record is an error; everything else is captured in
    /// the returned record.
    pub async fn execute(&self, agent_id: Uuid, trigger: TriggerEvent) -> Result<Execution> {
        let lock = self.agent_lock(agent_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.run(agent_id, trigger).await
        };
        self.release_lock(agent_id, lock).await;
        result
    }

    /// Forget the agent's lock once no other run holds or awaits it.
    async fn release_lock(&self, agent_id: Uuid, lock: Arc<Mutex<()>>) {
        let mut locks = self.agent_locks.lock().await;
        // One reference in the map, one here.
        let idle = Arc::strong_count(&lock) == 2
            && locks
                .get(&agent_id)
                .is_some_and(|held| Arc::ptr_eq(held, &lock));
        if idle {
            locks.remove(&agent_id);
        }
    }

    #[cfg(test)]
    pub(crate) async fn tracked_locks(&self) -> usize {
        self.agent_locks.lock().await.len()
    }

    async fn run(&self, agent_id: Uuid, trigger: TriggerEvent) -> Result<Execution> {
        let start_time = Instant::now();

        let agent = self
            .store
            .get(agent_id)
            .await?
            .ok_or(EngineError::AgentNotFound(agent_id))?;

        if !agent.is_active() {
            return Err(EngineError::AgentNotActive {
                agent_id,
                status: agent.status.to_string(),
            });
        }

        info!(
            agent_id = %agent_id,
            trigger_type = ?trigger.trigger_type,
            trigger_id = ?trigger.trigger_id,
            "Orchestrator: starting execution"
        );

        let context = build_context(&agent, &trigger);
        let metadata = oracle_metadata(&agent, "execution");
        let mut transcript = Vec::new();

        // === CONDITIONS ===
        let conditions = self
            .evaluator
            .evaluate_all(&agent.conditions, &context, &metadata, &mut transcript)
            .await;

        if let Some(reason) = &conditions.configuration_error {
            error!(agent_id = %agent_id, %reason, "Agent has a configuration error");
        }

        // === ACTIONS ===
        let (actions_executed, status) = if conditions.all_passed {
            let outcomes = self
                .executor
                .execute_all(&agent.actions, &agent, &context, &metadata, &mut transcript)
                .await;
            let status = classify_outcomes(&outcomes);
            (outcomes, status)
        } else {
            debug!(agent_id = %agent_id, "Conditions not met, no actions run");
            (Vec::new(), ExecutionStatus::Failed)
        };

        let impact = compute_impact(&actions_executed);

        // === AUDIT ===
        let mut execution = Execution {
            execution_id: Uuid::new_v4(),
            agent_id,
            owner_id: agent.owner_id,
            trigger: TriggerProvenance {
                trigger_type: trigger.trigger_type,
                trigger_id: trigger.trigger_id,
                fired_at: trigger.fired_at,
                payload: trigger.payload,
            },
            conditions_evaluated: conditions.results,
            conditions_met: conditions.all_passed,
            actions_executed,
            status,
            execution_time_ms: start_time.elapsed().as_millis() as u64,
            impact,
            oracle_transcript: transcript,
            configuration_error: conditions.configuration_error,
            created_at: Utc::now(),
            digest: String::new(),
        };
        audit::seal(&mut execution);

        self.store.append_execution(&execution).await?;

        // === STATS ===
        if let Err(e) = self.record_stats(&execution).await {
            warn!(
                agent_id = %agent_id,
                execution_id = %execution.execution_id,
                error = %e,
                "Stats update failed; execution record kept"
            );
        }

        info!(
            agent_id = %agent_id,
            execution_id = %execution.execution_id,
            status = ?execution.status,
            impact = %execution.impact,
            duration_ms = execution.execution_time_ms,
            "Orchestrator: execution complete"
        );

        Ok(execution)
    }

    /// Fold the execution into the agent's stats with compare-and-swap,
    /// reloading on version conflicts.
    async fn record_stats(&self, execution: &Execution) -> Result<()> {
        for attempt in 1..=MAX_STATS_RETRIES {
            let mut agent = self
                .store
                .get(execution.agent_id)
                .await?
                .ok_or(EngineError::AgentNotFound(execution.agent_id))?;

            agent.stats.record(execution);
            agent.last_run_at = Some(execution.created_at);

            match self.store.save(&agent).await {
                Ok(_) => return Ok(()),
                Err(EngineError::VersionConflict(_)) => {
                    debug!(agent_id = %agent.agent_id, attempt, "Stats save conflicted, reloading");
                }
                Err(e) => return Err(e),
            }
        }

        Err(EngineError::VersionConflict(execution.agent_id))
    }
}
