// Agent Registry - single source of truth for agent presence and status
// Every mutation goes through one async lock, so updates are linearized

use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn, Instrument};

use super::types::{AgentRecord, AgentStatus};
use crate::error::{BusError, Result};
use crate::events::{Event, EventPublisher, EventType};
use crate::telemetry::create_coordination_span;

const SOURCE_ID: &str = "agent_registry";

#[derive(Default)]
struct RegistryState {
    agents: HashMap<String, AgentRecord>,
    ready: BTreeSet<String>,
}

pub struct AgentRegistry {
    state: Mutex<RegistryState>,
    publisher: Arc<dyn EventPublisher>,
    ready_changed: Notify,
}

impl AgentRegistry {
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            publisher,
            ready_changed: Notify::new(),
        }
    }

    pub async fn register_agent<I, S>(&self, agent_id: &str, capabilities: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let capabilities: BTreeSet<String> = capabilities.into_iter().map(Into::into).collect();
        let span = create_coordination_span("register_agent", Some(agent_id), None);

        async move {
            let mut state = self.state.lock().await;
            if state.agents.contains_key(agent_id) {
                warn!(agent_id = %agent_id, "Rejected duplicate agent registration");
                return Err(BusError::DuplicateAgent {
                    agent_id: agent_id.to_string(),
                });
            }

            let record = AgentRecord::new(agent_id, capabilities);
            self.emit(
                Event::new(EventType::Agent, SOURCE_ID)
                    .with_field("type", "agent_registered")
                    .with_field("agent_id", agent_id)
                    .with_field("capabilities", json!(record.capabilities)),
            );
            info!(
                agent_id = %agent_id,
                capabilities = ?record.capabilities,
                "Agent registered"
            );
            state.agents.insert(agent_id.to_string(), record);
            Ok(())
        }
        .instrument(span)
        .await
    }

    pub async fn unregister_agent(&self, agent_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.agents.remove(agent_id).is_none() {
            return Err(BusError::UnknownAgent {
                agent_id: agent_id.to_string(),
            });
        }
        state.ready.remove(agent_id);

        self.emit(
            Event::new(EventType::Agent, SOURCE_ID)
                .with_field("type", "agent_unregistered")
                .with_field("agent_id", agent_id),
        );
        info!(agent_id = %agent_id, "Agent unregistered");
        drop(state);

        // Verification treats departed agents as settled
        self.ready_changed.notify_waiters();
        Ok(())
    }

    /// Apply a status update in a single critical section
    ///
    /// `status` accepts an [`AgentStatus`] or its string form; unknown strings fail
    /// with `InvalidStatus`. `task` and `error` replace the record's current values.
    pub async fn update_status<S>(
        &self,
        agent_id: &str,
        status: S,
        task: Option<&str>,
        error: Option<&str>,
    ) -> Result<()>
    where
        S: TryInto<AgentStatus>,
        BusError: From<S::Error>,
    {
        let status: AgentStatus = status.try_into()?;
        let span = create_coordination_span("update_status", Some(agent_id), None);

        async move {
            let mut state = self.state.lock().await;
            let record = state
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| BusError::UnknownAgent {
                    agent_id: agent_id.to_string(),
                })?;

            let previous = record.status;
            if !previous.can_transition_to(status) {
                warn!(
                    agent_id = %agent_id,
                    from = %previous,
                    to = %status,
                    "Rejected agent status transition"
                );
                return Err(BusError::InvalidTransition {
                    agent_id: agent_id.to_string(),
                    from: previous.to_string(),
                    to: status.to_string(),
                });
            }

            record.status = status;
            record.current_task = task.map(str::to_string);
            record.error_message = error.map(str::to_string);
            record.updated_at = chrono::Utc::now();

            let became_ready = status == AgentStatus::ShutdownReady;
            if became_ready {
                state.ready.insert(agent_id.to_string());
            }

            self.emit(
                Event::new(EventType::Agent, SOURCE_ID)
                    .with_field("type", "status_change")
                    .with_field("agent_id", agent_id)
                    .with_field("old_status", previous.as_str())
                    .with_field("new_status", status.as_str())
                    .with_field("task", json!(task))
                    .with_field("error", json!(error)),
            );
            debug!(
                agent_id = %agent_id,
                from = %previous,
                to = %status,
                task = ?task,
                "Agent status updated"
            );
            drop(state);

            if became_ready {
                self.ready_changed.notify_waiters();
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Sorted ids of IDLE agents advertising every required capability
    pub async fn get_available_agents<I, S>(&self, required_capabilities: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let required: BTreeSet<String> =
            required_capabilities.into_iter().map(Into::into).collect();
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state
            .agents
            .values()
            .filter(|record| record.is_available_for(&required))
            .map(|record| record.agent_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn get_agent_info(&self, agent_id: &str) -> Option<AgentRecord> {
        self.state.lock().await.agents.get(agent_id).cloned()
    }

    /// Copies of every record, sorted by id
    pub async fn get_all_agents(&self) -> Vec<AgentRecord> {
        let state = self.state.lock().await;
        let mut records: Vec<AgentRecord> = state.agents.values().cloned().collect();
        records.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        records
    }

    /// Sorted ids of registered agents that are not TERMINATED
    pub async fn active_agent_ids(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state
            .agents
            .values()
            .filter(|record| record.status.is_active())
            .map(|record| record.agent_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn ready_agent_ids(&self) -> BTreeSet<String> {
        self.state.lock().await.ready.clone()
    }

    pub async fn agent_count(&self) -> usize {
        self.state.lock().await.agents.len()
    }

    /// Wait until every id in `agent_ids` is ready or unregistered
    ///
    /// Returns the ids still missing when the timeout expires.
    pub async fn wait_for_ready(&self, agent_ids: &[String], timeout: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.ready_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let missing = {
                let state = self.state.lock().await;
                agent_ids
                    .iter()
                    .filter(|id| state.agents.contains_key(*id) && !state.ready.contains(*id))
                    .cloned()
                    .collect::<Vec<_>>()
            };
            if missing.is_empty() {
                return missing;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return missing;
            }
        }
    }

    /// Best-effort read used when the rest of the system may be wedged
    pub async fn try_snapshot(&self, lock_timeout: Duration) -> Option<(Vec<String>, Vec<String>)> {
        let state = tokio::time::timeout(lock_timeout, self.state.lock()).await.ok()?;
        let mut active: Vec<String> = state
            .agents
            .values()
            .filter(|record| record.status.is_active())
            .map(|record| record.agent_id.clone())
            .collect();
        active.sort();
        let ready = state.ready.iter().cloned().collect();
        Some((active, ready))
    }

    fn emit(&self, event: Event) {
        if let Err(e) = self.publisher.publish(event) {
            warn!(error = %e, "Failed to publish registry event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventDispatcher;

    fn registry() -> (Arc<EventDispatcher>, AgentRegistry) {
        let dispatcher = Arc::new(EventDispatcher::default());
        let registry = AgentRegistry::new(dispatcher.clone());
        (dispatcher, registry)
    }

    #[tokio::test]
    async fn test_register_then_lookup() {
        let (_, registry) = registry();
        registry.register_agent("a1", ["x", "y"]).await.unwrap();

        let info = registry.get_agent_info("a1").await.unwrap();
        assert_eq!(info.status, AgentStatus::Idle);
        assert_eq!(
            info.capabilities,
            ["x", "y"].iter().map(|s| s.to_string()).collect::<BTreeSet<_>>()
        );
        assert!(info.current_task.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_registration_keeps_original() {
        let (_, registry) = registry();
        registry.register_agent("a1", ["x"]).await.unwrap();
        registry.update_status("a1", AgentStatus::Busy, Some("t1"), None).await.unwrap();

        let result = registry.register_agent("a1", ["other"]).await;
        assert!(matches!(result, Err(BusError::DuplicateAgent { .. })));

        let info = registry.get_agent_info("a1").await.unwrap();
        assert_eq!(info.status, AgentStatus::Busy);
        assert!(info.capabilities.contains("x"));
        assert!(!info.capabilities.contains("other"));
    }

    #[tokio::test]
    async fn test_lifecycle_events_are_published() {
        let (dispatcher, registry) = registry();
        registry.register_agent("a1", ["x"]).await.unwrap();
        registry.update_status("a1", "BUSY", Some("t1"), None).await.unwrap();
        registry.unregister_agent("a1").await.unwrap();

        // Dispatcher not started, so everything is still queued
        assert_eq!(dispatcher.get_queue_size(), 3);
    }

    #[tokio::test]
    async fn test_update_status_errors() {
        let (_, registry) = registry();
        let unknown = registry.update_status("ghost", AgentStatus::Idle, None, None).await;
        assert!(matches!(unknown, Err(BusError::UnknownAgent { .. })));

        registry.register_agent("a1", Vec::<String>::new()).await.unwrap();
        let invalid = registry.update_status("a1", "NAPPING", None, None).await;
        assert!(matches!(invalid, Err(BusError::InvalidStatus { .. })));

        let forbidden = registry.update_status("a1", AgentStatus::Terminated, None, None).await;
        assert!(matches!(forbidden, Err(BusError::InvalidTransition { .. })));
        assert_eq!(
            registry.get_agent_info("a1").await.unwrap().status,
            AgentStatus::Idle
        );
    }

    #[tokio::test]
    async fn test_error_status_records_message() {
        let (_, registry) = registry();
        registry.register_agent("a1", ["x"]).await.unwrap();
        registry
            .update_status("a1", AgentStatus::Error, None, Some("boom"))
            .await
            .unwrap();

        let info = registry.get_agent_info("a1").await.unwrap();
        assert_eq!(info.status, AgentStatus::Error);
        assert_eq!(info.error_message.as_deref(), Some("boom"));

        registry.update_status("a1", AgentStatus::Idle, None, None).await.unwrap();
        assert!(registry.get_agent_info("a1").await.unwrap().error_message.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_ready_populates_ready_set() {
        let (_, registry) = registry();
        registry.register_agent("a1", ["x"]).await.unwrap();
        registry.register_agent("a2", ["x"]).await.unwrap();
        registry
            .update_status("a1", AgentStatus::ShutdownReady, None, None)
            .await
            .unwrap();

        let ready = registry.ready_agent_ids().await;
        assert_eq!(ready.len(), 1);
        assert!(ready.contains("a1"));
    }

    #[tokio::test]
    async fn test_wait_for_ready_returns_when_all_acknowledge() {
        let (_, registry) = registry();
        let registry = Arc::new(registry);
        registry.register_agent("a1", ["x"]).await.unwrap();
        registry.register_agent("a2", ["x"]).await.unwrap();

        let acker = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for id in ["a1", "a2"] {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    registry
                        .update_status(id, AgentStatus::ShutdownReady, None, None)
                        .await
                        .unwrap();
                }
            })
        };

        let ids = vec!["a1".to_string(), "a2".to_string()];
        let missing = registry.wait_for_ready(&ids, Duration::from_secs(5)).await;
        assert!(missing.is_empty());
        acker.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_ready_reports_missing_after_timeout() {
        let (_, registry) = registry();
        registry.register_agent("a1", ["x"]).await.unwrap();

        let ids = vec!["a1".to_string()];
        let missing = registry.wait_for_ready(&ids, Duration::from_millis(50)).await;
        assert_eq!(missing, vec!["a1".to_string()]);
    }

    #[tokio::test]
    async fn test_active_agents_exclude_terminated() {
        let (_, registry) = registry();
        registry.register_agent("a1", ["x"]).await.unwrap();
        registry.register_agent("a2", ["x"]).await.unwrap();
        registry
            .update_status("a2", AgentStatus::ShutdownReady, None, None)
            .await
            .unwrap();
        registry
            .update_status("a2", AgentStatus::Terminated, None, None)
            .await
            .unwrap();

        assert_eq!(registry.active_agent_ids().await, vec!["a1".to_string()]);
        assert_eq!(registry.get_all_agents().await.len(), 2);
    }
}
