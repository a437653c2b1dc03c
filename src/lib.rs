// Agent Bus Library - prioritized events, agent registry, diagnostics and phased shutdown
// This exposes the core components for embedding and integration tests

pub mod agents;
pub mod bus;
pub mod cli;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod priority;
pub mod shutdown;
pub mod telemetry;

// Re-export key types for easy access
pub use agents::{AgentRecord, AgentRegistry, AgentStatus};
pub use bus::AgentBus;
pub use config::{BusConfig, DiagnosticsConfig, DispatcherConfig, OverflowPolicy, ShutdownConfig};
pub use diagnostics::{CheckResult, DiagnosticsReport, SystemDiagnostics};
pub use error::{BusError, Result};
pub use events::{
    handler_fn, DeliveryReceipt, Event, EventDispatcher, EventHandler, EventPublisher, EventType,
};
pub use priority::EventPriority;
pub use shutdown::{
    ProcessControl, ShutdownCoordinator, ShutdownOutcome, ShutdownPhase, ShutdownReport,
    ShutdownStage, StdProcessControl,
};
pub use telemetry::{create_coordination_span, generate_correlation_id, init_telemetry};
