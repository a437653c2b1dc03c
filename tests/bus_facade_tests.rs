// Agent bus facade: full lifecycle, signal guard and stop semantics

use agent_bus::{AgentBus, AgentStatus, BusConfig, EventPriority, EventType, ShutdownStage};
use std::time::Duration;
use tempfile::TempDir;

mod fixtures;
use fixtures::{acknowledge_directives, count, flush, record_system_events, started_bus, test_config};

#[tokio::test]
async fn test_full_lifecycle_through_facade() {
    let root = TempDir::new().unwrap();
    let (bus, process) = started_bus(test_config(&root)).await;
    let seen = record_system_events(&bus);
    acknowledge_directives(&bus);

    bus.register_agent("A1", ["x"]).await.unwrap();
    bus.register_agent("A2", ["x", "y"]).await.unwrap();
    assert_eq!(bus.get_available_agents(["x"]).await, vec!["A1", "A2"]);

    bus.update_agent_status("A1", "BUSY", Some("task-7"), None)
        .await
        .unwrap();
    assert_eq!(bus.get_available_agents(["x"]).await, vec!["A2"]);
    bus.update_agent_status("A1", AgentStatus::Idle, None, None)
        .await
        .unwrap();

    let report = bus.run_pre_shutdown_diagnostics().await;
    assert!(!report.blocks_shutdown());

    bus.stop().await;

    assert_eq!(bus.coordinator().stage(), ShutdownStage::Completed);
    assert!(!bus.dispatcher().is_running());
    assert_eq!(count(&seen, "shutdown_completed"), 1);
    let agents = bus.get_all_agents().await;
    assert!(agents
        .iter()
        .all(|agent| agent.status == AgentStatus::ShutdownReady));
    assert_eq!(process.calls(), 0);
}

#[tokio::test]
async fn test_signals_trigger_a_single_shutdown() {
    let root = TempDir::new().unwrap();
    let (bus, _) = started_bus(test_config(&root)).await;
    let seen = record_system_events(&bus);
    acknowledge_directives(&bus);
    bus.register_agent("A1", ["x"]).await.unwrap();

    assert!(bus.on_shutdown_signal("SIGTERM"));
    assert!(!bus.on_shutdown_signal("SIGINT"));
    assert!(!bus.on_shutdown_signal("SIGTERM"));

    tokio::time::timeout(Duration::from_secs(10), bus.wait_for_shutdown())
        .await
        .unwrap();
    flush(&bus).await;

    assert_eq!(count(&seen, "shutdown_initiated"), 1);
    assert_eq!(count(&seen, "shutdown_completed"), 1);

    // stop() does not start a second attempt
    bus.stop().await;
    assert_eq!(count(&seen, "shutdown_initiated"), 1);
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_shutdown() {
    let root = TempDir::new().unwrap();
    let (bus, _) = started_bus(test_config(&root)).await;
    acknowledge_directives(&bus);
    bus.register_agent("A1", ["x"]).await.unwrap();

    let shutdown = {
        let bus = bus.clone();
        tokio::spawn(async move { bus.broadcast_shutdown().await })
    };
    while !bus.coordinator().is_in_progress() && bus.coordinator().stage() == ShutdownStage::Idle {
        tokio::task::yield_now().await;
    }

    tokio::time::timeout(Duration::from_secs(10), bus.stop())
        .await
        .unwrap();
    assert!(!bus.coordinator().is_in_progress());
    assert!(shutdown.await.unwrap().is_ok());
    assert!(!bus.dispatcher().is_running());
}

#[tokio::test]
async fn test_invalid_custom_type_rejected_and_unhandled_event_acknowledged() {
    let root = TempDir::new().unwrap();
    let (bus, _) = started_bus(test_config(&root)).await;

    let handler_registered = bus.register_handler(
        EventType::custom(""),
        agent_bus::handler_fn("nobody", |_event| async { Ok(()) }),
    );
    assert!(handler_registered.is_err());

    let receipt = bus
        .dispatch_and_wait(
            agent_bus::Event::new(EventType::Task, "test").with_priority(EventPriority::Critical),
        )
        .await
        .unwrap();
    assert_eq!(receipt.handlers_invoked, 0);
    assert!(receipt.is_success());
    bus.dispatcher().stop().await;
}

#[tokio::test]
async fn test_default_bus_does_not_run_until_started() {
    let root = TempDir::new().unwrap();
    let mut config = BusConfig::default();
    config.diagnostics = test_config(&root).diagnostics;
    let bus = AgentBus::new(config);

    assert!(!bus.dispatcher().is_running());
    bus.register_agent("A1", ["x"]).await.unwrap();
    assert_eq!(bus.dispatcher().get_queue_size(), 1);
    assert_eq!(bus.config().dispatcher.queue_capacity, None);
}
