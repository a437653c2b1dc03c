//! Pre-shutdown diagnostics
//!
//! Four independent checks over agent status, state directories, process resources and
//! the event system. A check that errors or panics becomes a failed critical result for
//! that check alone; the others still run.

pub mod agent_state;
pub mod resources;
pub mod types;

use anyhow::Context;
use futures::FutureExt;
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

use crate::agents::{AgentRegistry, AgentStatus};
use crate::config::DiagnosticsConfig;
use crate::events::{Event, EventPublisher};
use crate::priority::EventPriority;
use crate::telemetry::create_coordination_span;

pub use types::{
    CheckResult, DiagnosticsReport, AGENT_STATUS_CHECK, EVENT_SYSTEM_CHECK, RESOURCES_CHECK,
    STATE_FILES_CHECK,
};

const SOURCE_ID: &str = "system_diagnostics";

pub struct SystemDiagnostics {
    registry: Arc<AgentRegistry>,
    publisher: Arc<dyn EventPublisher>,
    config: DiagnosticsConfig,
}

impl SystemDiagnostics {
    pub fn new(
        registry: Arc<AgentRegistry>,
        publisher: Arc<dyn EventPublisher>,
        config: DiagnosticsConfig,
    ) -> Self {
        Self {
            registry,
            publisher,
            config,
        }
    }

    pub fn config(&self) -> &DiagnosticsConfig {
        &self.config
    }

    /// Run every check, publish `pre_shutdown_check`, and return the report
    pub async fn run_pre_shutdown_diagnostics(&self) -> DiagnosticsReport {
        let span = create_coordination_span("pre_shutdown_diagnostics", None, None);

        async move {
            let mut checks = BTreeMap::new();
            checks.insert(
                AGENT_STATUS_CHECK.to_string(),
                run_guarded(AGENT_STATUS_CHECK, self.check_agent_status()).await,
            );
            checks.insert(
                STATE_FILES_CHECK.to_string(),
                run_guarded(STATE_FILES_CHECK, self.check_state_files()).await,
            );
            checks.insert(
                RESOURCES_CHECK.to_string(),
                run_guarded(RESOURCES_CHECK, self.check_resources()).await,
            );
            checks.insert(
                EVENT_SYSTEM_CHECK.to_string(),
                run_guarded(EVENT_SYSTEM_CHECK, self.check_event_system()).await,
            );

            let report = DiagnosticsReport::from_checks(checks);
            let status = report.status_label();

            if report.blocks_shutdown() {
                warn!(
                    passed = report.total_passed,
                    failed = report.total_failed,
                    critical_warnings = ?report.critical_warnings,
                    "Pre-shutdown diagnostics found critical problems"
                );
            } else {
                info!(
                    passed = report.total_passed,
                    failed = report.total_failed,
                    "Pre-shutdown diagnostics completed"
                );
            }

            let event = Event::system("pre_shutdown_check", SOURCE_ID)
                .with_priority(EventPriority::High)
                .with_field("status", status)
                .with_field("total_passed", report.total_passed)
                .with_field("total_failed", report.total_failed)
                .with_field("critical_warnings", json!(report.critical_warnings));
            if let Err(e) = self.publisher.publish(event) {
                warn!(error = %e, "Failed to publish pre_shutdown_check");
            }

            report
        }
        .instrument(span)
        .await
    }

    /// Agents in ERROR status plus schema problems in their state artifacts
    pub async fn check_agent_status(&self) -> anyhow::Result<CheckResult> {
        let agents = self.registry.get_all_agents().await;
        let mut errors = Vec::new();
        let mut failing_agents = Vec::new();
        let mut critical = false;

        for record in &agents {
            let mut agent_errors = Vec::new();
            if record.status == AgentStatus::Error {
                agent_errors.push(format!(
                    "agent {} is in ERROR state: {}",
                    record.agent_id,
                    record.error_message.as_deref().unwrap_or("no error message")
                ));
            }

            let agent_dir = self.config.agent_state_dir.join(&record.agent_id);
            agent_errors
                .extend(agent_state::inspect_agent_artifacts(&agent_dir, &record.agent_id).await);

            if !agent_errors.is_empty() {
                critical |= record.status.is_active();
                failing_agents.push(record.agent_id.clone());
                errors.extend(agent_errors);
            }
        }

        debug!(
            agents_checked = agents.len(),
            failing = failing_agents.len(),
            "Agent status check finished"
        );
        Ok(CheckResult::from_errors(
            errors,
            critical,
            json!({
                "agents_checked": agents.len(),
                "failing_agents": failing_agents,
            }),
        ))
    }

    /// Every required directory exists and accepts a probe write
    pub async fn check_state_files(&self) -> anyhow::Result<CheckResult> {
        let dirs = self.config.required_dirs();
        let mut errors = Vec::new();

        for dir in &dirs {
            if let Err(problem) = probe_directory(dir).await {
                errors.push(problem);
            }
        }

        Ok(CheckResult::from_errors(
            errors,
            false,
            json!({
                "directories": dirs
                    .iter()
                    .map(|dir| dir.display().to_string())
                    .collect::<Vec<_>>(),
            }),
        ))
    }

    /// Locked state files, stale temp files, descriptor count and zombie children
    pub async fn check_resources(&self) -> anyhow::Result<CheckResult> {
        let agent_state_dir = self.config.agent_state_dir.clone();
        let runtime_dir = self.config.runtime_dir.clone();
        let max_open_handles = self.config.max_open_handles;

        tokio::task::spawn_blocking(move || -> anyhow::Result<CheckResult> {
            let locked = resources::find_locked_files(&agent_state_dir)
                .with_context(|| format!("scanning {}", agent_state_dir.display()))?;
            let stale = resources::find_stale_temp_files(&runtime_dir)
                .with_context(|| format!("scanning {}", runtime_dir.display()))?;
            let open_handles = resources::count_open_handles();
            let zombies = resources::find_zombie_children().context("scanning /proc")?;

            let locked_errors: Vec<String> = locked
                .iter()
                .map(|path| format!("state file is locked by another process: {}", path.display()))
                .collect();
            let mut minor: Vec<String> = stale
                .iter()
                .map(|path| format!("stale temporary file: {}", path.display()))
                .collect();
            if let Some(count) = open_handles.filter(|count| *count > max_open_handles) {
                minor.push(format!(
                    "{} open file handles exceeds limit of {}",
                    count, max_open_handles
                ));
            }
            if !zombies.is_empty() {
                minor.push(format!("unreaped child processes: {:?}", zombies));
            }

            // Once the check is critical its errors block shutdown, so minor problems
            // are reported as warnings instead
            let critical = !locked_errors.is_empty();
            let (errors, warnings) = if critical {
                (locked_errors, minor)
            } else {
                (minor, Vec::new())
            };

            Ok(CheckResult::from_errors(
                errors,
                critical,
                json!({
                    "locked_files": locked.len(),
                    "stale_temp_files": stale.len(),
                    "open_handles": open_handles,
                    "max_open_handles": max_open_handles,
                    "zombie_children": zombies,
                }),
            )
            .with_warnings(warnings))
        })
        .await
        .context("resource probe task failed")?
    }

    /// The dispatch loop is running and its backlog
    pub async fn check_event_system(&self) -> anyhow::Result<CheckResult> {
        let running = self.publisher.is_running();
        let queue_size = self.publisher.queue_size();
        let details = json!({ "running": running, "queue_size": queue_size });

        if !running {
            return Ok(CheckResult::from_errors(
                vec!["event dispatcher is not running".to_string()],
                true,
                details,
            ));
        }

        if queue_size == 0 {
            return Ok(CheckResult::pass(details));
        }

        let backlog = format!("{} events still queued", queue_size);
        if self.config.queue_backlog_is_failure {
            Ok(CheckResult::from_errors(vec![backlog], false, details))
        } else {
            Ok(CheckResult::pass(details).with_warnings(vec![backlog]))
        }
    }
}

/// Run one check, turning errors and panics into a failed critical result
pub async fn run_guarded<F>(name: &str, check: F) -> CheckResult
where
    F: Future<Output = anyhow::Result<CheckResult>>,
{
    match AssertUnwindSafe(check).catch_unwind().await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!(check = name, error = %e, "Diagnostic check failed to run");
            CheckResult::check_failure(name, format!("{:#}", e))
        }
        Err(_) => {
            error!(check = name, "Diagnostic check panicked");
            CheckResult::check_failure(name, "check panicked")
        }
    }
}

async fn probe_directory(dir: &Path) -> Result<(), String> {
    match tokio::fs::metadata(dir).await {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Err(format!("{} is not a directory", dir.display())),
        Err(_) => return Err(format!("required directory missing: {}", dir.display())),
    }

    let probe = dir.join(format!(
        "{}-{}",
        resources::PROBE_PREFIX,
        uuid::Uuid::new_v4()
    ));
    tokio::fs::write(&probe, b"probe")
        .await
        .map_err(|e| format!("{} is not writable: {}", dir.display(), e))?;
    if let Err(e) = tokio::fs::remove_file(&probe).await {
        warn!(path = %probe.display(), error = %e, "Failed to remove probe file");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventDispatcher;
    use tempfile::TempDir;

    struct Fixture {
        _root: TempDir,
        dispatcher: Arc<EventDispatcher>,
        registry: Arc<AgentRegistry>,
        diagnostics: SystemDiagnostics,
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let config = DiagnosticsConfig::rooted_at(root.path());
        for dir in config.required_dirs() {
            std::fs::create_dir_all(dir).unwrap();
        }
        let dispatcher = Arc::new(EventDispatcher::default());
        let registry = Arc::new(AgentRegistry::new(dispatcher.clone()));
        let diagnostics = SystemDiagnostics::new(registry.clone(), dispatcher.clone(), config);
        Fixture {
            _root: root,
            dispatcher,
            registry,
            diagnostics,
        }
    }

    #[tokio::test]
    async fn test_guarded_check_contains_errors_and_panics() {
        let failed = run_guarded("boom", async { Err(anyhow::anyhow!("kaput")) }).await;
        assert!(!failed.passed);
        assert!(failed.critical);
        assert!(failed.errors[0].contains("kaput"));

        let panicked = run_guarded("boom", async {
            if true {
                panic!("check exploded");
            }
            Ok(CheckResult::pass(json!({})))
        })
        .await;
        assert!(!panicked.passed);
        assert!(panicked.critical);
    }

    #[tokio::test]
    async fn test_stopped_dispatcher_is_critical() {
        let f = fixture();
        let result = f.diagnostics.check_event_system().await.unwrap();
        assert!(!result.passed);
        assert!(result.critical);
    }

    #[tokio::test]
    async fn test_backlog_is_a_warning_by_default() {
        let f = fixture();
        f.dispatcher.start();
        // Hold the loop inside a handler so the second event stays queued
        let gate = Arc::new(tokio::sync::Notify::new());
        let release = gate.clone();
        f.dispatcher
            .register_handler(
                crate::events::EventType::Task,
                crate::events::handler_fn("gate", move |_event| {
                    let gate = gate.clone();
                    async move {
                        gate.notified().await;
                        Ok(())
                    }
                }),
            )
            .unwrap();
        f.dispatcher
            .dispatch_event(Event::new(crate::events::EventType::Task, "t"))
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        f.dispatcher
            .dispatch_event(Event::new(crate::events::EventType::Task, "t"))
            .unwrap();

        let result = f.diagnostics.check_event_system().await.unwrap();
        assert!(result.passed);
        assert_eq!(result.warnings.len(), 1);

        release.notify_one();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        release.notify_one();
        f.dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_missing_directory_fails_state_files() {
        let f = fixture();
        std::fs::remove_dir_all(&f.diagnostics.config().runtime_dir).unwrap();

        let result = f.diagnostics.check_state_files().await.unwrap();
        assert!(!result.passed);
        assert!(!result.critical);
        assert!(result.errors[0].contains("missing"));
    }

    #[tokio::test]
    async fn test_probe_files_are_removed() {
        let f = fixture();
        let result = f.diagnostics.check_state_files().await.unwrap();
        assert!(result.passed);
        let leftovers = std::fs::read_dir(&f.diagnostics.config().state_dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(resources::PROBE_PREFIX)
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_stale_temp_file_is_non_critical() {
        let f = fixture();
        std::fs::write(f.diagnostics.config().runtime_dir.join("half.tmp"), "").unwrap();

        let result = f.diagnostics.check_resources().await.unwrap();
        assert!(!result.passed);
        assert!(!result.critical);
    }

    #[tokio::test]
    async fn test_terminated_agent_errors_are_not_critical() {
        let f = fixture();
        f.registry.register_agent("a1", ["x"]).await.unwrap();
        f.registry
            .update_status("a1", AgentStatus::ShutdownReady, None, None)
            .await
            .unwrap();
        f.registry
            .update_status("a1", AgentStatus::Terminated, None, None)
            .await
            .unwrap();
        let agent_dir = f.diagnostics.config().agent_state_dir.join("a1");
        std::fs::create_dir_all(&agent_dir).unwrap();
        std::fs::write(agent_dir.join(agent_state::MAILBOX_FILE), "[]").unwrap();

        let result = f.diagnostics.check_agent_status().await.unwrap();
        assert!(!result.passed);
        assert!(!result.critical);
    }

    #[tokio::test]
    async fn test_report_is_published() {
        let f = fixture();
        let before = f.dispatcher.get_queue_size();
        let report = f.diagnostics.run_pre_shutdown_diagnostics().await;
        assert_eq!(report.checks.len(), 4);
        assert_eq!(f.dispatcher.get_queue_size(), before + 1);
    }
}
