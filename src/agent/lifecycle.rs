//! Agent lifecycle management
//!
//! Creation and edits are validated before anything is stored. Status
//! changes follow `draft → active ⇄ paused → archived` and keep the trigger
//! watcher in step with what is active.

use super::validation::{validate_definition, ValidationLimits};
use crate::error::EngineError;
use crate::models::{Agent, AgentDefinition, AgentStatus, Execution};
use crate::state::AgentStore;
use crate::triggers::TriggerWatcher;
use crate::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Reload-and-retry bound for saves racing a stats update.
const MAX_SAVE_RETRIES: u32 = 5;

pub struct AgentManager {
    store: Arc<dyn AgentStore>,
    watcher: Option<Arc<TriggerWatcher>>,
    limits: ValidationLimits,
}

impl AgentManager {
    pub fn new(store: Arc<dyn AgentStore>, limits: ValidationLimits) -> Self {
        Self {
            store,
            watcher: None,
            limits,
        }
    }

    pub fn with_watcher(mut self, watcher: Arc<TriggerWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub async fn create(&self, owner_id: Uuid, definition: AgentDefinition) -> Result<Agent> {
        validate_definition(&definition, &self.limits)?;

        let agent = self
            .store
            .save(&Agent::from_definition(owner_id, definition))
            .await?;

        info!(
            agent_id = %agent.agent_id,
            owner_id = %owner_id,
            name = %agent.name,
            "Agent created"
        );
        Ok(agent)
    }

    /// Replace the editable fields. Archived agents are frozen.
    pub async fn update(&self, agent_id: Uuid, definition: AgentDefinition) -> Result<Agent> {
        validate_definition(&definition, &self.limits)?;

        let agent = self
            .modify(agent_id, |agent| {
                if agent.status == AgentStatus::Archived {
                    return Err(EngineError::InvalidAgent(
                        "archived agents cannot be edited".to_string(),
                    ));
                }
                agent.apply_definition(definition.clone());
                Ok(())
            })
            .await?;

        self.sync_watcher(&agent).await;
        info!(agent_id = %agent_id, "Agent updated");
        Ok(agent)
    }

    pub async fn activate(&self, agent_id: Uuid) -> Result<Agent> {
        self.transition(agent_id, AgentStatus::Active).await
    }

    pub async fn pause(&self, agent_id: Uuid) -> Result<Agent> {
        self.transition(agent_id, AgentStatus::Paused).await
    }

    pub async fn archive(&self, agent_id: Uuid) -> Result<Agent> {
        self.transition(agent_id, AgentStatus::Archived).await
    }

    pub async fn get(&self, agent_id: Uuid) -> Result<Agent> {
        self.store
            .get(agent_id)
            .await?
            .ok_or(EngineError::AgentNotFound(agent_id))
    }

    pub async fn list(&self, owner_id: Uuid) -> Result<Vec<Agent>> {
        self.store.list_agents(owner_id).await
    }

    /// Newest first.
    pub async fn executions(&self, agent_id: Uuid, limit: usize) -> Result<Vec<Execution>> {
        self.get(agent_id).await?;
        self.store.list_executions(agent_id, limit).await
    }

    async fn transition(&self, agent_id: Uuid, next: AgentStatus) -> Result<Agent> {
        let agent = self
            .modify(agent_id, |agent| {
                if !agent.status.can_transition_to(next) {
                    return Err(EngineError::InvalidTransition {
                        from: agent.status.to_string(),
                        to: next.to_string(),
                    });
                }
                agent.status = next;
                agent.updated_at = Utc::now();
                Ok(())
            })
            .await?;

        self.sync_watcher(&agent).await;
        info!(agent_id = %agent_id, status = %agent.status, "Agent status changed");
        Ok(agent)
    }

    /// Load, apply `change`, save; reload on version conflicts.
    async fn modify<F>(&self, agent_id: Uuid, change: F) -> Result<Agent>
    where
        F: Fn(&mut Agent) -> Result<()>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut agent = self.get(agent_id).await?;
            change(&mut agent)?;

            match self.store.save(&agent).await {
                Err(EngineError::VersionConflict(_)) if attempt < MAX_SAVE_RETRIES => {
                    debug!(agent_id = %agent_id, attempt, "Save conflicted, reloading");
                }
                other => return other,
            }
        }
    }

    async fn sync_watcher(&self, agent: &Agent) {
        if let Some(watcher) = &self.watcher {
            watcher.register(agent).await;
        }
    }
}
