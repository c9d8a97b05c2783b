//! Agent store
//!
//! Durable home of agents, their execution audit trail and stats.
//! Saves are compare-and-swap on `Agent::version`; executions are
//! append-only.

use crate::error::EngineError;
use crate::models::{Agent, AgentStatus, Execution};
use crate::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub mod postgres;
pub use postgres::PgAgentStore;

/// Trait for agent persistence
#[async_trait::async_trait]
pub trait AgentStore: Send + Sync {
    async fn get(&self, agent_id: Uuid) -> Result<Option<Agent>>;

    /// Persist `agent` if its `version` matches the stored one (or it is
    /// new with version 0). Returns the stored copy with the bumped version.
    async fn save(&self, agent: &Agent) -> Result<Agent>;

    async fn append_execution(&self, execution: &Execution) -> Result<()>;

    /// Newest first.
    async fn list_executions(&self, agent_id: Uuid, limit: usize) -> Result<Vec<Execution>>;

    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<Execution>>;

    async fn list_agents(&self, owner_id: Uuid) -> Result<Vec<Agent>>;

    async fn list_active(&self) -> Result<Vec<Agent>>;
}

/// In-memory store for development and tests
pub struct InMemoryAgentStore {
    agents: Arc<RwLock<HashMap<Uuid, Agent>>>,
    executions_by_agent: Arc<RwLock<HashMap<Uuid, Vec<Execution>>>>,
    reject_saves: AtomicBool,
}

impl InMemoryAgentStore {
    pub fn new() -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            executions_by_agent: Arc::new(RwLock::new(HashMap::new())),
            reject_saves: AtomicBool::new(false),
        }
    }

    /// Make every subsequent `save` fail with a storage error.
    pub fn reject_saves(&self, reject: bool) {
        self.reject_saves.store(reject, Ordering::SeqCst);
    }

    pub async fn execution_count(&self) -> usize {
        self.executions_by_agent
            .read()
            .await
            .values()
            .map(Vec::len)
            .sum()
    }
}

impl Default for InMemoryAgentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AgentStore for InMemoryAgentStore {
    async fn get(&self, agent_id: Uuid) -> Result<Option<Agent>> {
        let agents = self.agents.read().await;
        Ok(agents.get(&agent_id).cloned())
    }

    async fn save(&self, agent: &Agent) -> Result<Agent> {
        if self.reject_saves.load(Ordering::SeqCst) {
            return Err(EngineError::Storage("store is rejecting writes".to_string()));
        }

        let mut agents = self.agents.write().await;
        let stored_version = agents.get(&agent.agent_id).map(|a| a.version).unwrap_or(0);

        if stored_version != agent.version {
            return Err(EngineError::VersionConflict(agent.agent_id));
        }

        let mut saved = agent.clone();
        saved.version = stored_version + 1;
        agents.insert(saved.agent_id, saved.clone());
        Ok(saved)
    }

    async fn append_execution(&self, execution: &Execution) -> Result<()> {
        let mut executions = self.executions_by_agent.write().await;
        let entries = executions.entry(execution.agent_id).or_insert_with(Vec::new);

        if entries
            .iter()
            .any(|e| e.execution_id == execution.execution_id)
        {
            return Err(EngineError::Storage(format!(
                "execution {} already recorded",
                execution.execution_id
            )));
        }

        entries.push(execution.clone());
        Ok(())
    }

    async fn list_executions(&self, agent_id: Uuid, limit: usize) -> Result<Vec<Execution>> {
        let executions = self.executions_by_agent.read().await;

        Ok(executions
            .get(&agent_id)
            .map(|entries| entries.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<Execution>> {
        let executions = self.executions_by_agent.read().await;

        Ok(executions
            .values()
            .flat_map(|entries| entries.iter())
            .find(|e| e.execution_id == execution_id)
            .cloned())
    }

    async fn list_agents(&self, owner_id: Uuid) -> Result<Vec<Agent>> {
        let agents = self.agents.read().await;

        let mut owned: Vec<Agent> = agents
            .values()
            .filter(|a| a.owner_id == owner_id)
            .cloned()
            .collect();
        owned.sort_by_key(|a| a.created_at);
        Ok(owned)
    }

    async fn list_active(&self) -> Result<Vec<Agent>> {
        let agents = self.agents.read().await;

        Ok(agents
            .values()
            .filter(|a| a.status == AgentStatus::Active)
            .cloned()
            .collect())
    }
}
