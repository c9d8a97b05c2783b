//! Trigger watcher
//!
//! Keeps the enabled triggers of every active agent and turns external
//! signals (clock ticks, events, metric samples, detections) into trigger
//! events for the dispatcher. Each qualifying occurrence is dispatched at
//! most once.

use crate::agent::validation::validate_cron;
use crate::conditions::compare;
use crate::context::{lookup, zero_like};
use crate::models::{Agent, Trigger, TriggerEvent, TriggerKind};
use crate::state::AgentStore;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod dispatch;
pub use dispatch::Dispatcher;

/// Where fired triggers go. Returns false when the trigger was dropped.
#[async_trait]
pub trait TriggerSink: Send + Sync {
    async fn dispatch(&self, agent_id: Uuid, event: TriggerEvent) -> bool;

    /// The agent no longer fires; release anything held for it.
    async fn retire(&self, _agent_id: Uuid) {}
}

/// A trigger that matched a signal.
#[derive(Debug, Clone)]
pub struct Fired {
    pub agent_id: Uuid,
    pub event: TriggerEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct OccurrenceKey {
    agent_id: Uuid,
    trigger_id: String,
    occurrence: String,
}

/// Bounded memory of recent occurrences, oldest evicted first.
struct DedupeWindow {
    capacity: usize,
    order: VecDeque<OccurrenceKey>,
    seen: HashSet<OccurrenceKey>,
}

impl DedupeWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// True the first time a key is seen within the window.
    fn admit(&mut self, key: OccurrenceKey) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }
}

struct WatcherState {
    last_tick: Option<DateTime<Utc>>,
    /// Last predicate value per (agent, trigger) for threshold crossings.
    threshold_state: HashMap<(Uuid, String), bool>,
    dedupe: DedupeWindow,
}

pub struct TriggerWatcher {
    registry: RwLock<HashMap<Uuid, Vec<Trigger>>>,
    state: Mutex<WatcherState>,
    sink: Arc<dyn TriggerSink>,
}

impl TriggerWatcher {
    pub fn new(sink: Arc<dyn TriggerSink>, dedupe_window: usize) -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            state: Mutex::new(WatcherState {
                last_tick: None,
                threshold_state: HashMap::new(),
                dedupe: DedupeWindow::new(dedupe_window),
            }),
            sink,
        }
    }

    // ===== Registry =====

    /// Track an agent's enabled triggers. Non-active agents are removed.
    pub async fn register(&self, agent: &Agent) {
        if !agent.is_active() {
            self.unregister(agent.agent_id).await;
            return;
        }

        let enabled: Vec<Trigger> = agent
            .triggers
            .iter()
            .filter(|t| t.enabled)
            .cloned()
            .collect();

        debug!(
            agent_id = %agent.agent_id,
            trigger_count = enabled.len(),
            "Registering agent triggers"
        );
        self.registry.write().await.insert(agent.agent_id, enabled);
    }

    pub async fn unregister(&self, agent_id: Uuid) {
        self.registry.write().await.remove(&agent_id);
        self.sink.retire(agent_id).await;
        self.state
            .lock()
            .await
            .threshold_state
            .retain(|(id, _), _| *id != agent_id);
    }

    /// Load every active agent from the store.
    pub async fn sync_from_store(&self, store: &dyn AgentStore) -> Result<usize> {
        let agents = store.list_active().await?;
        for agent in &agents {
            self.register(agent).await;
        }
        info!(agent_count = agents.len(), "Trigger registry loaded");
        Ok(agents.len())
    }

    pub async fn registered_agents(&self) -> usize {
        self.registry.read().await.len()
    }

    // ===== Signals =====

    /// Fire time triggers with a cron occurrence in `(last_tick, at]`.
    /// The first tick only sets the baseline.
    pub async fn tick(&self, at: DateTime<Utc>) -> Vec<Fired> {
        let since = {
            let mut state = self.state.lock().await;
            let since = state.last_tick.replace(at);
            match since {
                Some(since) if since < at => since,
                _ => return Vec::new(),
            }
        };

        let mut matches = Vec::new();
        for (agent_id, triggers) in self.registry.read().await.iter() {
            for trigger in triggers {
                let TriggerKind::Time { schedule } = &trigger.kind else {
                    continue;
                };

                let cron = match validate_cron(schedule) {
                    Ok(cron) => cron,
                    Err(e) => {
                        warn!(agent_id = %agent_id, trigger_id = %trigger.id, error = %e, "Skipping unparsable schedule");
                        continue;
                    }
                };

                // Only the latest occurrence counts; missed ones collapse into one run.
                let mut occurrence = None;
                let mut cursor = since;
                while let Ok(next) = cron.find_next_occurrence(&cursor, false) {
                    if next > at {
                        break;
                    }
                    occurrence = Some(next);
                    cursor = next;
                }

                if let Some(scheduled) = occurrence {
                    matches.push((
                        *agent_id,
                        trigger.clone(),
                        scheduled.to_rfc3339(),
                        json!({ "scheduled_at": scheduled.to_rfc3339(), "tick_at": at.to_rfc3339() }),
                    ));
                }
            }
        }

        self.fire(matches).await
    }

    /// Fire event triggers of `event_type` whose filters all hold on `payload`.
    /// Events without an occurrence id are never de-duplicated.
    pub async fn event(
        &self,
        event_type: &str,
        payload: Value,
        occurrence_id: Option<String>,
    ) -> Vec<Fired> {
        let occurrence = occurrence_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut matches = Vec::new();
        for (agent_id, triggers) in self.registry.read().await.iter() {
            for trigger in triggers {
                let TriggerKind::Event {
                    event_type: wanted,
                    filters,
                } = &trigger.kind
                else {
                    continue;
                };

                if wanted != event_type {
                    continue;
                }

                let passes = filters.iter().all(|filter| {
                    let actual = lookup(&payload, &filter.field)
                        .cloned()
                        .unwrap_or_else(|| zero_like(&filter.value));
                    compare(&actual, filter.operator, &filter.value).0
                });

                if passes {
                    matches.push((*agent_id, trigger.clone(), occurrence.clone(), payload.clone()));
                }
            }
        }

        self.fire(matches).await
    }

    /// Feed a metric sample. Threshold triggers fire only when their
    /// predicate goes from false to true.
    pub async fn metric(&self, name: &str, value: f64) -> Vec<Fired> {
        let mut matches = Vec::new();
        {
            let registry = self.registry.read().await;
            let mut state = self.state.lock().await;

            for (agent_id, triggers) in registry.iter() {
                for trigger in triggers {
                    let TriggerKind::Threshold {
                        metric,
                        operator,
                        value: threshold,
                    } = &trigger.kind
                    else {
                        continue;
                    };

                    if metric != name {
                        continue;
                    }

                    let (holds, _) = compare(&json!(value), *operator, &json!(threshold));
                    let previous = state
                        .threshold_state
                        .insert((*agent_id, trigger.id.clone()), holds)
                        .unwrap_or(false);

                    if holds && !previous {
                        matches.push((
                            *agent_id,
                            trigger.clone(),
                            Uuid::new_v4().to_string(),
                            json!({ "metric": name, "value": value, "threshold": threshold }),
                        ));
                    }
                }
            }
        }

        self.fire(matches).await
    }

    /// Fire pattern / AI-detected triggers whose description matches and
    /// whose confidence bar is met.
    pub async fn detection(
        &self,
        description: &str,
        confidence: f64,
        occurrence_id: Option<String>,
    ) -> Vec<Fired> {
        let occurrence = occurrence_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let wanted = description.trim().to_lowercase();

        let mut matches = Vec::new();
        for (agent_id, triggers) in self.registry.read().await.iter() {
            for trigger in triggers {
                let (described, min_confidence) = match &trigger.kind {
                    TriggerKind::Pattern {
                        description,
                        min_confidence,
                    }
                    | TriggerKind::AiDetected {
                        description,
                        min_confidence,
                    } => (description, *min_confidence),
                    _ => continue,
                };

                if described.trim().to_lowercase() == wanted && confidence >= min_confidence {
                    matches.push((
                        *agent_id,
                        trigger.clone(),
                        occurrence.clone(),
                        json!({ "description": description, "confidence": confidence }),
                    ));
                }
            }
        }

        self.fire(matches).await
    }

    async fn fire(&self, matches: Vec<(Uuid, Trigger, String, Value)>) -> Vec<Fired> {
        let admitted: Vec<Fired> = {
            let mut state = self.state.lock().await;
            matches
                .into_iter()
                .filter(|(agent_id, trigger, occurrence, _)| {
                    state.dedupe.admit(OccurrenceKey {
                        agent_id: *agent_id,
                        trigger_id: trigger.id.clone(),
                        occurrence: occurrence.clone(),
                    })
                })
                .map(|(agent_id, trigger, _, payload)| Fired {
                    agent_id,
                    event: TriggerEvent::new(
                        trigger.kind.trigger_type(),
                        Some(trigger.id.clone()),
                        payload,
                    ),
                })
                .collect()
        };

        for fired in &admitted {
            debug!(
                agent_id = %fired.agent_id,
                trigger_id = ?fired.event.trigger_id,
                "Trigger fired"
            );
            self.sink.dispatch(fired.agent_id, fired.event.clone()).await;
        }

        admitted
    }
}

/// Emit a tick every `period` until the task is aborted.
pub fn spawn_clock(watcher: Arc<TriggerWatcher>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let fired = watcher.tick(Utc::now()).await;
            if !fired.is_empty() {
                info!(count = fired.len(), "Scheduled triggers fired");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentStatus, ComparisonOperator, FieldFilter};
    use crate::state::tests::sample_agent;
    use chrono::TimeZone;

    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<(Uuid, TriggerEvent)>>,
    }

    #[async_trait]
    impl TriggerSink for RecordingSink {
        async fn dispatch(&self, agent_id: Uuid, event: TriggerEvent) -> bool {
            self.received.lock().await.push((agent_id, event));
            true
        }
    }

    fn trigger(id: &str, kind: TriggerKind) -> Trigger {
        Trigger {
            id: id.to_string(),
            enabled: true,
            kind,
        }
    }

    fn active_agent(triggers: Vec<Trigger>) -> Agent {
        let mut agent = sample_agent(Uuid::new_v4());
        agent.status = AgentStatus::Active;
        agent.triggers = triggers;
        agent
    }

    fn watcher() -> (TriggerWatcher, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (TriggerWatcher::new(sink.clone(), 16), sink)
    }

    #[tokio::test]
    async fn test_event_filters_and_dedupe() {
        let (watcher, sink) = watcher();
        let agent = active_agent(vec![trigger(
            "big-tx",
            TriggerKind::Event {
                event_type: "transaction.created".into(),
                filters: vec![FieldFilter {
                    field: "transaction.amount".into(),
                    operator: ComparisonOperator::GreaterThan,
                    value: json!(5000),
                }],
            },
        )]);
        watcher.register(&agent).await;

        let small = json!({"transaction": {"amount": 100}});
        let big = json!({"transaction": {"amount": 9000}});

        assert!(watcher.event("transaction.created", small, Some("tx-1".into())).await.is_empty());
        assert!(watcher.event("account.opened", big.clone(), Some("tx-2".into())).await.is_empty());
        assert_eq!(watcher.event("transaction.created", big.clone(), Some("tx-3".into())).await.len(), 1);
        // Same occurrence delivered twice.
        assert!(watcher.event("transaction.created", big, Some("tx-3".into())).await.is_empty());

        let received = sink.received.lock().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, agent.agent_id);
        assert_eq!(received[0].1.trigger_id.as_deref(), Some("big-tx"));
    }

    #[tokio::test]
    async fn test_disabled_and_inactive_are_inert() {
        let (watcher, _sink) = watcher();
        let mut disabled = trigger(
            "t",
            TriggerKind::Event {
                event_type: "x".into(),
                filters: vec![],
            },
        );
        disabled.enabled = false;
        watcher.register(&active_agent(vec![disabled])).await;

        let mut paused = active_agent(vec![trigger(
            "t",
            TriggerKind::Event {
                event_type: "x".into(),
                filters: vec![],
            },
        )]);
        paused.status = AgentStatus::Paused;
        watcher.register(&paused).await;

        assert!(watcher.event("x", json!({}), None).await.is_empty());
        assert_eq!(watcher.registered_agents().await, 1);
    }

    #[tokio::test]
    async fn test_threshold_fires_on_crossing_only() {
        let (watcher, _sink) = watcher();
        watcher
            .register(&active_agent(vec![trigger(
                "low-balance",
                TriggerKind::Threshold {
                    metric: "balance".into(),
                    operator: ComparisonOperator::LessThan,
                    value: 1000.0,
                },
            )]))
            .await;

        assert!(watcher.metric("balance", 5000.0).await.is_empty());
        assert_eq!(watcher.metric("balance", 900.0).await.len(), 1);
        assert!(watcher.metric("balance", 800.0).await.is_empty());
        assert!(watcher.metric("balance", 1500.0).await.is_empty());
        assert_eq!(watcher.metric("balance", 500.0).await.len(), 1);
    }

    #[tokio::test]
    async fn test_tick_fires_once_per_occurrence() {
        let (watcher, _sink) = watcher();
        watcher
            .register(&active_agent(vec![trigger(
                "morning",
                TriggerKind::Time {
                    schedule: "0 9 * * *".into(),
                },
            )]))
            .await;

        let at = |h, m| Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap();

        assert!(watcher.tick(at(8, 59)).await.is_empty());
        let fired = watcher.tick(at(9, 0)).await;
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].event.payload["scheduled_at"], json!(at(9, 0).to_rfc3339()));
        assert!(watcher.tick(at(9, 1)).await.is_empty());
        assert!(watcher.tick(at(12, 0)).await.is_empty());
    }

    #[tokio::test]
    async fn test_detection_matches_description_and_confidence() {
        let (watcher, _sink) = watcher();
        watcher
            .register(&active_agent(vec![
                trigger(
                    "subs",
                    TriggerKind::Pattern {
                        description: "Recurring subscription".into(),
                        min_confidence: 0.8,
                    },
                ),
                trigger(
                    "fraud",
                    TriggerKind::AiDetected {
                        description: "unusual spending".into(),
                        min_confidence: 0.5,
                    },
                ),
            ]))
            .await;

        assert!(watcher.detection("recurring subscription", 0.6, None).await.is_empty());
        assert_eq!(watcher.detection("recurring subscription", 0.9, None).await.len(), 1);
        let fired = watcher.detection("Unusual spending", 0.7, Some("d-1".into())).await;
        assert_eq!(fired[0].event.trigger_type, crate::models::TriggerType::AiDetected);
        assert!(watcher.detection("Unusual spending", 0.7, Some("d-1".into())).await.is_empty());
    }

    #[test]
    fn test_dedupe_window_evicts_oldest() {
        let mut window = DedupeWindow::new(2);
        let key = |o: &str| OccurrenceKey {
            agent_id: Uuid::nil(),
            trigger_id: "t".into(),
            occurrence: o.into(),
        };

        assert!(window.admit(key("a")));
        assert!(!window.admit(key("a")));
        assert!(window.admit(key("b")));
        assert!(window.admit(key("c")));
        assert!(window.admit(key("a")));
    }
}
