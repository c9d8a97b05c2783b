//! Per-agent dispatch queues
//!
//! Each agent gets a bounded queue and one worker that feeds the
//! orchestrator in arrival order. When the queue is full the trigger is
//! dropped and logged.

use super::TriggerSink;
use crate::agent::Orchestrator;
use crate::models::TriggerEvent;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct Dispatcher {
    orchestrator: Arc<Orchestrator>,
    queue_depth: usize,
    queues: Mutex<HashMap<Uuid, mpsc::Sender<TriggerEvent>>>,
}

impl Dispatcher {
    pub fn new(orchestrator: Arc<Orchestrator>, queue_depth: usize) -> Self {
        Self {
            orchestrator,
            queue_depth: queue_depth.max(1),
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn spawn_worker(&self, agent_id: Uuid) -> mpsc::Sender<TriggerEvent> {
        let (tx, mut rx) = mpsc::channel::<TriggerEvent>(self.queue_depth);
        let orchestrator = self.orchestrator.clone();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match orchestrator.execute(agent_id, event).await {
                    Ok(execution) => info!(
                        agent_id = %agent_id,
                        execution_id = %execution.execution_id,
                        status = ?execution.status,
                        "Dispatched execution finished"
                    ),
                    Err(e) => warn!(agent_id = %agent_id, error = %e, "Dispatched execution rejected"),
                }
            }
            debug!(agent_id = %agent_id, "Dispatch worker stopped");
        });

        tx
    }

    pub async fn queue_count(&self) -> usize {
        self.queues.lock().await.len()
    }
}

#[async_trait]
impl TriggerSink for Dispatcher {
    async fn dispatch(&self, agent_id: Uuid, event: TriggerEvent) -> bool {
        let mut queues = self.queues.lock().await;
        let sender = queues
            .entry(agent_id)
            .or_insert_with(|| self.spawn_worker(agent_id));

        match sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(
                    agent_id = %agent_id,
                    trigger_id = ?event.trigger_id,
                    queue_depth = self.queue_depth,
                    "Agent queue full, dropping trigger"
                );
                false
            }
            Err(TrySendError::Closed(event)) => {
                let fresh = self.spawn_worker(agent_id);
                let accepted = fresh.try_send(event).is_ok();
                queues.insert(agent_id, fresh);
                accepted
            }
        }
    }

    /// Dropping the sender lets the worker drain what is queued and exit.
    async fn retire(&self, agent_id: Uuid) {
        if self.queues.lock().await.remove(&agent_id).is_some() {
            debug!(agent_id = %agent_id, "Agent queue retired");
        }
    }
}
