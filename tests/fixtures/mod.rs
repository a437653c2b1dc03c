//! Shared fixtures for bus integration tests
#![allow(dead_code)]

use agent_bus::{
    handler_fn, AgentBus, AgentStatus, BusConfig, DiagnosticsConfig, Event, EventType,
    ProcessControl,
};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Exit hook that records calls instead of terminating the test process
#[derive(Default)]
pub struct RecordingProcessControl {
    calls: AtomicUsize,
    last_code: AtomicI32,
}

impl RecordingProcessControl {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_code(&self) -> i32 {
        self.last_code.load(Ordering::SeqCst)
    }
}

impl ProcessControl for RecordingProcessControl {
    fn exit(&self, code: i32) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.last_code.store(code, Ordering::SeqCst);
    }
}

/// Configuration rooted in a temporary directory with short shutdown timeouts
pub fn test_config(root: &TempDir) -> BusConfig {
    let mut config = BusConfig::default();
    config.diagnostics = DiagnosticsConfig::rooted_at(root.path());
    config.shutdown = config.shutdown.with_phase_timeouts(Duration::from_secs(2));
    config.shutdown.verification_timeout_ms = 300;
    config.shutdown.emergency_snapshot_path = root.path().join("emergency-snapshot.json");
    config
}

/// Bus with state directories created and the dispatcher running
pub async fn started_bus(config: BusConfig) -> (AgentBus, Arc<RecordingProcessControl>) {
    let process = Arc::new(RecordingProcessControl::default());
    let bus = AgentBus::with_process_control(config, process.clone());
    bus.prepare_state_dirs().await.unwrap();
    bus.start();
    (bus, process)
}

/// Records the kind of every SYSTEM event in delivery order
pub fn record_system_events(bus: &AgentBus) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.register_handler(
        EventType::System,
        handler_fn("system-recorder", move |event: Event| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock()
                    .unwrap()
                    .push(event.kind().unwrap_or_default().to_string());
                Ok(())
            }
        }),
    )
    .unwrap();
    seen
}

/// Agents acknowledge every shutdown directive addressed to them
pub fn acknowledge_directives(bus: &AgentBus) {
    let handler_bus = bus.clone();
    bus.register_handler(
        EventType::System,
        handler_fn("agent-ack", move |event: Event| {
            let bus = handler_bus.clone();
            async move {
                if event.kind() == Some("shutdown_directive") {
                    if let Some(agent_id) = event.target_id.clone() {
                        bus.update_agent_status(&agent_id, AgentStatus::ShutdownReady, None, None)
                            .await?;
                    }
                }
                Ok(())
            }
        }),
    )
    .unwrap();
}

/// Wait until every event queued so far has been delivered
pub async fn flush(bus: &AgentBus) {
    let sentinel = Event::new(EventType::custom("test.flush"), "test").with_priority(i32::MAX);
    tokio::time::timeout(Duration::from_secs(5), bus.dispatch_and_wait(sentinel))
        .await
        .expect("dispatcher did not drain in time")
        .unwrap();
}

pub fn count(seen: &Arc<Mutex<Vec<String>>>, kind: &str) -> usize {
    seen.lock().unwrap().iter().filter(|k| k.as_str() == kind).count()
}
