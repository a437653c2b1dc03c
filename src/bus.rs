//! Agent bus facade
//!
//! Wires the dispatcher, registry, diagnostics and shutdown coordinator together and
//! exposes the agent-facing API. Cloning is cheap; clones share the same components.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::agents::{AgentRecord, AgentRegistry, AgentStatus};
use crate::config::BusConfig;
use crate::diagnostics::{DiagnosticsReport, SystemDiagnostics};
use crate::error::{BusError, Result};
use crate::events::{DeliveryReceipt, Event, EventDispatcher, EventHandler, EventType};
use crate::shutdown::{ProcessControl, ShutdownCoordinator, ShutdownOutcome, StdProcessControl};

#[derive(Clone)]
pub struct AgentBus {
    config: Arc<BusConfig>,
    dispatcher: Arc<EventDispatcher>,
    registry: Arc<AgentRegistry>,
    diagnostics: Arc<SystemDiagnostics>,
    coordinator: Arc<ShutdownCoordinator>,
    signal_received: Arc<AtomicBool>,
    attempts_finished: Arc<watch::Sender<u64>>,
}

impl AgentBus {
    pub fn new(config: BusConfig) -> Self {
        Self::with_process_control(config, Arc::new(StdProcessControl))
    }

    /// Build a bus whose emergency shutdown exits through `process`
    pub fn with_process_control(config: BusConfig, process: Arc<dyn ProcessControl>) -> Self {
        let dispatcher = Arc::new(EventDispatcher::new(config.dispatcher.clone()));
        let registry = Arc::new(AgentRegistry::new(dispatcher.clone()));
        let diagnostics = Arc::new(SystemDiagnostics::new(
            registry.clone(),
            dispatcher.clone(),
            config.diagnostics.clone(),
        ));
        let coordinator = Arc::new(ShutdownCoordinator::new(
            registry.clone(),
            dispatcher.clone(),
            diagnostics.clone(),
            config.shutdown.clone(),
            process,
        ));
        let (attempts_finished, _) = watch::channel(0);

        Self {
            config: Arc::new(config),
            dispatcher,
            registry,
            diagnostics,
            coordinator,
            signal_received: Arc::new(AtomicBool::new(false)),
            attempts_finished: Arc::new(attempts_finished),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.coordinator
    }

    /// Create every directory the state_files check expects
    pub async fn prepare_state_dirs(&self) -> Result<()> {
        for dir in self.config.diagnostics.required_dirs() {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// Start the dispatch loop; must be called inside a tokio runtime
    pub fn start(&self) {
        self.dispatcher.start();
        info!("Agent bus started");
    }

    /// Shut down (unless an attempt already finished), then stop the dispatcher
    pub async fn stop(&self) {
        if self.coordinator.is_in_progress() {
            info!("Waiting for in-flight shutdown before stopping");
            self.wait_for_shutdown().await;
        } else if *self.attempts_finished.borrow() == 0 {
            match self.broadcast_shutdown().await {
                Ok(ShutdownOutcome::Skipped) if self.coordinator.is_in_progress() => {
                    self.wait_for_shutdown().await;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Shutdown during stop did not complete"),
            }
        }

        self.dispatcher.stop().await;
        info!("Agent bus stopped");
    }

    pub async fn register_agent<I, S>(&self, agent_id: &str, capabilities: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.registry.register_agent(agent_id, capabilities).await
    }

    pub async fn unregister_agent(&self, agent_id: &str) -> Result<()> {
        self.registry.unregister_agent(agent_id).await
    }

    pub async fn update_agent_status<S>(
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
        self.registry.update_status(agent_id, status, task, error).await
    }

    pub async fn get_available_agents<I, S>(&self, required_capabilities: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.registry.get_available_agents(required_capabilities).await
    }

    pub async fn get_agent_info(&self, agent_id: &str) -> Option<AgentRecord> {
        self.registry.get_agent_info(agent_id).await
    }

    pub async fn get_all_agents(&self) -> Vec<AgentRecord> {
        self.registry.get_all_agents().await
    }

    pub fn register_handler(
        &self,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        self.dispatcher.register_handler(event_type, handler)
    }

    pub fn dispatch_event(&self, event: Event) -> Result<u64> {
        self.dispatcher.dispatch_event(event)
    }

    pub async fn dispatch_and_wait(&self, event: Event) -> Result<DeliveryReceipt> {
        self.dispatcher.dispatch_and_wait(event).await
    }

    pub async fn run_pre_shutdown_diagnostics(&self) -> DiagnosticsReport {
        self.diagnostics.run_pre_shutdown_diagnostics().await
    }

    /// Run a shutdown attempt; waiters on `wait_for_shutdown` are released when it ends
    pub async fn broadcast_shutdown(&self) -> Result<ShutdownOutcome> {
        let result = self.coordinator.broadcast_shutdown().await;
        if !matches!(result, Ok(ShutdownOutcome::Skipped)) {
            self.attempts_finished.send_modify(|count| *count += 1);
        }
        result
    }

    /// Resolve once a shutdown attempt has finished and none is running
    pub async fn wait_for_shutdown(&self) {
        let mut finished = self.attempts_finished.subscribe();
        loop {
            if *finished.borrow_and_update() > 0 && !self.coordinator.is_in_progress() {
                return;
            }
            if finished.changed().await.is_err() {
                return;
            }
        }
    }

    /// React to a termination signal; only the first one starts a shutdown
    ///
    /// Returns whether this call started the shutdown.
    pub fn on_shutdown_signal(&self, signal: &str) -> bool {
        if self.signal_received.swap(true, Ordering::SeqCst) {
            warn!(signal, "Shutdown already triggered, ignoring signal");
            return false;
        }

        info!(signal, "Received shutdown signal");
        let bus = self.clone();
        tokio::spawn(async move {
            match bus.broadcast_shutdown().await {
                Ok(outcome) => info!(
                    completed = matches!(outcome, ShutdownOutcome::Completed(_)),
                    "Signal-triggered shutdown finished"
                ),
                Err(e) => warn!(error = %e, "Signal-triggered shutdown failed"),
            }
        });
        true
    }

    /// Listen for SIGTERM and SIGINT in a background task
    #[cfg(unix)]
    pub fn install_signal_handlers(&self) -> Result<JoinHandle<()>> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let bus = self.clone();

        info!("Installing signal handlers for graceful shutdown");
        Ok(tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    received = terminate.recv() => received.map(|_| "SIGTERM"),
                    received = interrupt.recv() => received.map(|_| "SIGINT"),
                };
                match name {
                    Some(name) => {
                        bus.on_shutdown_signal(name);
                    }
                    None => break,
                }
            }
        }))
    }

    /// Listen for Ctrl-C in a background task
    #[cfg(not(unix))]
    pub fn install_signal_handlers(&self) -> Result<JoinHandle<()>> {
        let bus = self.clone();

        info!("Installing Ctrl-C handler for graceful shutdown");
        Ok(tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                bus.on_shutdown_signal("CTRL_C");
            }
        }))
    }
}
