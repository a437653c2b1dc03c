// Pre-shutdown diagnostics against real state directories

use agent_bus::diagnostics::{
    AGENT_STATUS_CHECK, EVENT_SYSTEM_CHECK, RESOURCES_CHECK, STATE_FILES_CHECK,
};
use agent_bus::AgentStatus;
use serde_json::json;
use std::fs;
use tempfile::TempDir;

mod fixtures;
use fixtures::{count, flush, record_system_events, started_bus, test_config};

#[tokio::test]
async fn test_healthy_system_has_no_critical_warnings() {
    let root = TempDir::new().unwrap();
    let (bus, _) = started_bus(test_config(&root)).await;

    let report = bus.run_pre_shutdown_diagnostics().await;

    assert!(report.critical_warnings.is_empty(), "{:?}", report.critical_warnings);
    assert!(!report.blocks_shutdown());
    assert_eq!(report.checks.len(), 4);
    for name in [
        AGENT_STATUS_CHECK,
        STATE_FILES_CHECK,
        RESOURCES_CHECK,
        EVENT_SYSTEM_CHECK,
    ] {
        assert!(report.check(name).unwrap().passed, "{} failed", name);
    }
    assert_eq!(report.total_failed, 0);
    assert_eq!(report.status_label(), "ready_for_shutdown");
    bus.dispatcher().stop().await;
}

#[tokio::test]
async fn test_agent_in_error_blocks_shutdown() {
    let root = TempDir::new().unwrap();
    let (bus, _) = started_bus(test_config(&root)).await;
    bus.register_agent("A1", ["x"]).await.unwrap();
    bus.update_agent_status("A1", AgentStatus::Error, None, Some("boom"))
        .await
        .unwrap();

    let report = bus.run_pre_shutdown_diagnostics().await;

    let agent_status = report.check(AGENT_STATUS_CHECK).unwrap();
    assert!(!agent_status.passed);
    assert!(agent_status.critical);
    assert!(report.blocks_shutdown());
    assert!(report.total_failed >= 1);
    assert!(report
        .critical_warnings
        .iter()
        .any(|warning| warning.contains("A1") && warning.contains("boom")));
    assert_eq!(report.status_label(), "errors_detected");
    bus.dispatcher().stop().await;
}

#[tokio::test]
async fn test_invalid_agent_artifacts_are_reported() {
    let root = TempDir::new().unwrap();
    let config = test_config(&root);
    let agent_dir = config.diagnostics.agent_state_dir.join("A1");
    let (bus, _) = started_bus(config).await;
    bus.register_agent("A1", ["x"]).await.unwrap();

    fs::create_dir_all(&agent_dir).unwrap();
    fs::write(
        agent_dir.join("mailbox.json"),
        json!({"agent_id": "A1", "status": "idle"}).to_string(),
    )
    .unwrap();
    fs::write(
        agent_dir.join("tasks.json"),
        json!([{"task_id": "t1", "status": "queued", "priority": 1}]).to_string(),
    )
    .unwrap();

    let report = bus.run_pre_shutdown_diagnostics().await;

    let agent_status = report.check(AGENT_STATUS_CHECK).unwrap();
    assert!(agent_status.critical);
    assert_eq!(agent_status.errors.len(), 1);
    assert!(agent_status.errors[0].contains("mailbox.json"));
    assert!(agent_status.errors[0].contains("pending_operations"));
    bus.dispatcher().stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_locked_state_file_is_critical() {
    use fd_lock::RwLock;

    let root = TempDir::new().unwrap();
    let config = test_config(&root);
    let agent_dir = config.diagnostics.agent_state_dir.join("A1");
    let runtime_dir = config.diagnostics.runtime_dir.clone();
    let (bus, _) = started_bus(config).await;

    fs::create_dir_all(&runtime_dir).unwrap();
    fs::write(runtime_dir.join("leftover.tmp"), "").unwrap();
    fs::create_dir_all(&agent_dir).unwrap();
    let path = agent_dir.join("journal.log");
    fs::write(&path, "entry\n").unwrap();
    let mut holder = RwLock::new(fs::File::open(&path).unwrap());
    let _guard = holder.try_write().unwrap();

    let report = bus.run_pre_shutdown_diagnostics().await;

    let resources = report.check(RESOURCES_CHECK).unwrap();
    assert!(!resources.passed);
    assert!(resources.critical);
    assert!(report
        .critical_warnings
        .iter()
        .any(|warning| warning.contains("journal.log")));

    // The leftover temp file stays a non-critical warning next to the lock
    assert_eq!(resources.errors.len(), 1);
    assert!(resources
        .warnings
        .iter()
        .any(|warning| warning.contains("leftover.tmp")));
    assert!(!report
        .critical_warnings
        .iter()
        .any(|warning| warning.contains("leftover.tmp")));
    bus.dispatcher().stop().await;
}

#[tokio::test]
async fn test_missing_directory_is_not_critical() {
    let root = TempDir::new().unwrap();
    let mut config = test_config(&root);
    config
        .diagnostics
        .extra_required_dirs
        .push(root.path().join("never-created"));
    let (bus, _) = started_bus(config).await;
    fs::remove_dir_all(root.path().join("never-created")).unwrap();

    let report = bus.run_pre_shutdown_diagnostics().await;

    let state_files = report.check(STATE_FILES_CHECK).unwrap();
    assert!(!state_files.passed);
    assert!(!state_files.critical);
    assert!(state_files.errors[0].contains("never-created"));
    assert!(!report.blocks_shutdown());
    bus.dispatcher().stop().await;
}

#[tokio::test]
async fn test_stopped_dispatcher_blocks_shutdown() {
    let root = TempDir::new().unwrap();
    let (bus, _) = started_bus(test_config(&root)).await;
    bus.dispatcher().stop().await;

    let report = bus.run_pre_shutdown_diagnostics().await;

    let event_system = report.check(EVENT_SYSTEM_CHECK).unwrap();
    assert!(!event_system.passed);
    assert!(event_system.critical);
    assert!(report.blocks_shutdown());
}

#[tokio::test]
async fn test_report_is_announced_on_the_bus() {
    let root = TempDir::new().unwrap();
    let (bus, _) = started_bus(test_config(&root)).await;
    let seen = record_system_events(&bus);

    bus.run_pre_shutdown_diagnostics().await;
    flush(&bus).await;

    assert_eq!(count(&seen, "pre_shutdown_check"), 1);
    bus.dispatcher().stop().await;
}
