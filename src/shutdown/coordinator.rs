//! Shutdown coordinator
//!
//! Runs one shutdown attempt end to end: diagnostics gate, four directive phases fanned
//! out to every active agent with a deadline each, verification, and the emergency path
//! when anything escapes.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use statig::prelude::*;
use std::any::Any;
use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use super::directive::{DirectiveTemplate, ShutdownPhaseDirective};
use super::emergency::{EmergencySnapshot, ProcessControl};
use super::progress::{ProgressEvent, ShutdownProgress, ShutdownStage};
use super::ShutdownPhase;
use crate::agents::AgentRegistry;
use crate::config::ShutdownConfig;
use crate::diagnostics::{
    resources, run_guarded, SystemDiagnostics, RESOURCES_CHECK, STATE_FILES_CHECK,
};
use crate::error::{BusError, Result};
use crate::events::{Event, EventDispatcher, EventPublisher};
use crate::priority::EventPriority;
use crate::telemetry::{create_coordination_span, generate_correlation_id};

const SOURCE_ID: &str = "shutdown_coordinator";
const SNAPSHOT_LOCK_TIMEOUT: Duration = Duration::from_millis(500);

/// Per-phase fan-out result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: ShutdownPhase,
    pub success: bool,
    pub duration_ms: u64,
    pub failed_agents: Vec<String>,
}

/// Post-phase verification result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub passed: bool,
    pub missing_agents: Vec<String>,
    pub state_files_ok: bool,
    pub resources_ok: bool,
    pub queue_size: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub correlation_id: String,
    /// Agents active when the attempt started
    pub active_agents: Vec<String>,
    pub ready_agents: Vec<String>,
    pub phases: Vec<PhaseResult>,
    pub verification: Option<VerificationResult>,
    pub missing_agents: Vec<String>,
    pub duration_ms: u64,
}

impl ShutdownReport {
    pub fn failed_phases(&self) -> Vec<ShutdownPhase> {
        self.phases
            .iter()
            .filter(|result| !result.success)
            .map(|result| result.phase)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub enum ShutdownOutcome {
    Completed(ShutdownReport),
    Incomplete(ShutdownReport),
    /// Another attempt is running or one already completed
    Skipped,
}

impl ShutdownOutcome {
    pub fn report(&self) -> Option<&ShutdownReport> {
        match self {
            ShutdownOutcome::Completed(report) | ShutdownOutcome::Incomplete(report) => {
                Some(report)
            }
            ShutdownOutcome::Skipped => None,
        }
    }

    /// Turn an incomplete shutdown into `ShutdownIncomplete`
    pub fn ensure_complete(self) -> Result<Option<ShutdownReport>> {
        match self {
            ShutdownOutcome::Completed(report) => Ok(Some(report)),
            ShutdownOutcome::Incomplete(report) => Err(BusError::ShutdownIncomplete {
                missing_agents: report.missing_agents,
            }),
            ShutdownOutcome::Skipped => Ok(None),
        }
    }
}

pub struct ShutdownCoordinator {
    registry: Arc<AgentRegistry>,
    dispatcher: Arc<EventDispatcher>,
    diagnostics: Arc<SystemDiagnostics>,
    config: ShutdownConfig,
    template: DirectiveTemplate,
    process: Arc<dyn ProcessControl>,
    in_progress: AtomicBool,
    progress: Mutex<StateMachine<ShutdownProgress>>,
}

impl ShutdownCoordinator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        dispatcher: Arc<EventDispatcher>,
        diagnostics: Arc<SystemDiagnostics>,
        config: ShutdownConfig,
        process: Arc<dyn ProcessControl>,
    ) -> Self {
        let template = DirectiveTemplate::load(config.directive_template.as_deref());
        Self {
            registry,
            dispatcher,
            diagnostics,
            config,
            template,
            process,
            in_progress: AtomicBool::new(false),
            progress: Mutex::new(ShutdownProgress::new().state_machine()),
        }
    }

    pub fn stage(&self) -> ShutdownStage {
        self.lock_progress().inner().stage()
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Run a full shutdown attempt
    ///
    /// Returns `Skipped` when an attempt is already running or has completed.
    /// Critical diagnostics fail with `ShutdownHalted`; anything else escaping the attempt
    /// runs emergency shutdown and fails with `EmergencyShutdown`.
    pub async fn broadcast_shutdown(&self) -> Result<ShutdownOutcome> {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            info!("Shutdown already in progress, skipping");
            return Ok(ShutdownOutcome::Skipped);
        }
        let stage = self.stage();
        if !stage.accepts_attempt() {
            info!(?stage, "Shutdown already finished, skipping");
            self.in_progress.store(false, Ordering::SeqCst);
            return Ok(ShutdownOutcome::Skipped);
        }

        let correlation_id = generate_correlation_id();
        let span = create_coordination_span("broadcast_shutdown", None, Some(&correlation_id));

        let attempt = AssertUnwindSafe(self.run_attempt(&correlation_id))
            .catch_unwind()
            .instrument(span.clone())
            .await;

        let result = match attempt {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(halted @ BusError::ShutdownHalted { .. })) => Err(halted),
            Ok(Err(e)) => Err(self.emergency_shutdown(&e.to_string()).instrument(span).await),
            Err(panic) => {
                let reason = format!("shutdown panicked: {}", panic_message(panic.as_ref()));
                Err(self.emergency_shutdown(&reason).instrument(span).await)
            }
        };

        self.in_progress.store(false, Ordering::SeqCst);
        result
    }

    async fn run_attempt(&self, correlation_id: &str) -> Result<ShutdownOutcome> {
        let started = Instant::now();
        self.advance(ProgressEvent::Begin);

        let diagnostics = self.diagnostics.run_pre_shutdown_diagnostics().await;
        if diagnostics.blocks_shutdown() {
            self.advance(ProgressEvent::DiagnosticsBlocked);
            warn!(
                critical_warnings = ?diagnostics.critical_warnings,
                "Shutdown halted by critical diagnostics"
            );
            self.emit(
                Event::system("shutdown_halted", SOURCE_ID)
                    .with_priority(EventPriority::High)
                    .with_field("correlation_id", correlation_id)
                    .with_field("critical_warnings", json!(diagnostics.critical_warnings)),
            );
            return Err(BusError::ShutdownHalted {
                critical_warnings: diagnostics.critical_warnings,
            });
        }
        self.advance(ProgressEvent::DiagnosticsPassed);

        let active_agents = self.registry.active_agent_ids().await;
        info!(
            active_agents = active_agents.len(),
            "Initiating shutdown of active agents"
        );
        // A bus that cannot announce shutdown falls through to emergency shutdown
        self.dispatcher.publish(
            Event::system("shutdown_initiated", SOURCE_ID)
                .with_priority(EventPriority::High)
                .with_field("correlation_id", correlation_id)
                .with_field("active_agents", active_agents.len())
                .with_field("agent_ids", json!(active_agents)),
        )?;

        let mut phases = Vec::with_capacity(ShutdownPhase::ALL.len());
        let mut next = Some(ShutdownPhase::Prep);
        while let Some(phase) = next {
            if phase != ShutdownPhase::Prep {
                self.advance(ProgressEvent::PhaseStarted(phase));
            }
            let result = self.run_phase(phase).await;
            self.emit(
                Event::system("shutdown_phase_completed", SOURCE_ID)
                    .with_priority(EventPriority::High)
                    .with_field("correlation_id", correlation_id)
                    .with_field("phase", phase.as_str())
                    .with_field("success", result.success)
                    .with_field("duration_ms", result.duration_ms)
                    .with_field("failed_agents", json!(result.failed_agents)),
            );
            phases.push(result);
            next = phase.next();
        }

        let all_phases_ok = phases.iter().all(|result| result.success);
        let (verification, missing_agents) = if all_phases_ok {
            self.advance(ProgressEvent::VerificationStarted);
            let verification = self.verify_shutdown(&active_agents).await;
            let missing = verification.missing_agents.clone();
            (Some(verification), missing)
        } else {
            let failed: BTreeSet<String> = phases
                .iter()
                .flat_map(|result| result.failed_agents.iter().cloned())
                .collect();
            (None, failed.into_iter().collect())
        };

        let complete = verification.as_ref().is_some_and(|v| v.passed);
        self.advance(ProgressEvent::Finished { complete });

        let report = ShutdownReport {
            correlation_id: correlation_id.to_string(),
            active_agents,
            ready_agents: self.registry.ready_agent_ids().await.into_iter().collect(),
            phases,
            verification,
            missing_agents,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        if complete {
            info!(
                duration_ms = report.duration_ms,
                ready_agents = report.ready_agents.len(),
                "Shutdown completed"
            );
            self.emit(
                Event::system("shutdown_completed", SOURCE_ID)
                    .with_priority(EventPriority::High)
                    .with_field("correlation_id", correlation_id)
                    .with_field("duration_ms", report.duration_ms)
                    .with_field("ready_agents", json!(report.ready_agents)),
            );
            Ok(ShutdownOutcome::Completed(report))
        } else {
            let failed_phases: Vec<&str> = report
                .failed_phases()
                .into_iter()
                .map(ShutdownPhase::as_str)
                .collect();
            warn!(
                missing_agents = ?report.missing_agents,
                failed_phases = ?failed_phases,
                "Shutdown incomplete"
            );
            self.emit(
                Event::system("shutdown_incomplete", SOURCE_ID)
                    .with_priority(EventPriority::High)
                    .with_field("correlation_id", correlation_id)
                    .with_field("missing_agents", json!(report.missing_agents))
                    .with_field("failed_phases", json!(failed_phases)),
            );
            Ok(ShutdownOutcome::Incomplete(report))
        }
    }

    /// Send one phase directive to every active agent and wait for delivery receipts
    pub async fn run_phase(&self, phase: ShutdownPhase) -> PhaseResult {
        let started = Instant::now();
        let timeout = self.config.phase_timeout(phase);
        let deadline = tokio::time::Instant::now() + timeout;
        let agents = self.registry.active_agent_ids().await;
        let directive = ShutdownPhaseDirective::new(phase, self.template.for_phase(phase));

        info!(
            phase = %phase,
            agents = agents.len(),
            timeout_ms = timeout.as_millis() as u64,
            directive_id = %directive.directive_id,
            "Starting shutdown phase"
        );

        let mut tasks = JoinSet::new();
        for agent_id in &agents {
            let dispatcher = Arc::clone(&self.dispatcher);
            let event = directive.to_event(SOURCE_ID, agent_id);
            let agent_id = agent_id.clone();
            tasks.spawn(async move {
                let delivery = dispatcher.dispatch_and_wait(event).await;
                (agent_id, delivery)
            });
        }

        let mut pending: BTreeSet<String> = agents.iter().cloned().collect();
        let mut failed = BTreeSet::new();
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((agent_id, Ok(receipt))))) => {
                    pending.remove(&agent_id);
                    if !receipt.is_success() {
                        warn!(
                            phase = %phase,
                            agent_id = %agent_id,
                            handlers_failed = receipt.handlers_failed,
                            "Phase directive handlers failed"
                        );
                        failed.insert(agent_id);
                    }
                }
                Ok(Some(Ok((agent_id, Err(e))))) => {
                    pending.remove(&agent_id);
                    warn!(phase = %phase, agent_id = %agent_id, error = %e, "Phase directive not delivered");
                    failed.insert(agent_id);
                }
                // The agent stays pending and is counted below
                Ok(Some(Err(e))) => error!(phase = %phase, error = %e, "Phase task failed"),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        phase = %phase,
                        pending = ?pending,
                        "Shutdown phase timed out, aborting pending deliveries"
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }
        failed.extend(pending);

        let result = PhaseResult {
            phase,
            success: failed.is_empty(),
            duration_ms: started.elapsed().as_millis() as u64,
            failed_agents: failed.into_iter().collect(),
        };
        info!(
            phase = %phase,
            success = result.success,
            duration_ms = result.duration_ms,
            "Shutdown phase finished"
        );
        result
    }

    /// Confirm agents acknowledged and resources are in a state that allows exit
    pub async fn verify_shutdown(&self, active_agents: &[String]) -> VerificationResult {
        let missing_agents = self
            .registry
            .wait_for_ready(active_agents, self.config.verification_timeout())
            .await;
        let state_files =
            run_guarded(STATE_FILES_CHECK, self.diagnostics.check_state_files()).await;
        let resources = run_guarded(RESOURCES_CHECK, self.diagnostics.check_resources()).await;
        let queue_size = self.dispatcher.get_queue_size();

        let mut warnings = Vec::new();
        if queue_size > 0 {
            warnings.push(format!("{} events still queued", queue_size));
        }
        if !resources.passed {
            warnings.extend(resources.errors.iter().cloned());
        }

        let resources_ok = resources.passed || !resources.critical;
        let passed = missing_agents.is_empty() && state_files.passed && resources_ok;
        debug!(
            missing = ?missing_agents,
            state_files_ok = state_files.passed,
            resources_ok,
            queue_size,
            "Shutdown verification finished"
        );

        VerificationResult {
            passed,
            missing_agents,
            state_files_ok: state_files.passed,
            resources_ok,
            queue_size,
            warnings,
        }
    }

    /// Best-effort termination: snapshot, cleanup, announce, abort the loop, exit(1)
    ///
    /// Every step runs even when earlier ones fail. Returns the error the caller should
    /// surface if the exit hook returns.
    pub async fn emergency_shutdown(&self, reason: &str) -> BusError {
        error!(reason = %reason, "Emergency shutdown");
        self.advance(ProgressEvent::Fatal);

        guard_step("snapshot", async {
            let (active, ready) = match self.registry.try_snapshot(SNAPSHOT_LOCK_TIMEOUT).await {
                Some(lists) => lists,
                None => {
                    warn!("Registry unavailable, writing snapshot without agents");
                    (Vec::new(), Vec::new())
                }
            };
            EmergencySnapshot::capture(reason, active, ready)
                .write_to(&self.config.emergency_snapshot_path)
                .await
        })
        .await;

        let runtime_dir = self.diagnostics.config().runtime_dir.clone();
        let state_dir = self.diagnostics.config().state_dir.clone();
        guard_step("cleanup", async move {
            let removed = tokio::task::spawn_blocking(move || {
                let mut removed = resources::force_cleanup(&runtime_dir);
                removed.extend(resources::force_cleanup(&state_dir));
                removed
            })
            .await
            .map_err(|e| BusError::Io(std::io::Error::other(e)))?;
            info!(removed = removed.len(), "Emergency cleanup removed files");
            Ok(())
        })
        .await;

        guard_step("announce", async {
            self.dispatcher
                .publish(
                    Event::system("emergency_shutdown", SOURCE_ID)
                        .with_priority(EventPriority::Critical)
                        .with_field("reason", reason),
                )
                .map(|_| ())
        })
        .await;

        self.dispatcher.abort();
        self.process.exit(1);

        BusError::EmergencyShutdown {
            reason: reason.to_string(),
        }
    }

    fn advance(&self, event: ProgressEvent) {
        self.lock_progress().handle(&event);
    }

    fn lock_progress(&self) -> std::sync::MutexGuard<'_, StateMachine<ShutdownProgress>> {
        self.progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: Event) {
        let kind = event.kind().unwrap_or("").to_string();
        if let Err(e) = self.dispatcher.publish(event) {
            warn!(kind = %kind, error = %e, "Failed to publish shutdown event");
        }
    }
}

async fn guard_step<F>(step: &str, future: F)
where
    F: Future<Output = Result<()>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(step, error = %e, "Emergency shutdown step failed"),
        Err(panic) => error!(step, panic = %panic_message(panic.as_ref()), "Emergency shutdown step panicked"),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
