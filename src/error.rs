use std::convert::Infallible;
use thiserror::Error;

/// Errors surfaced by the bus and its components
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Agent already registered: {agent_id}")]
    DuplicateAgent { agent_id: String },

    #[error("Unknown agent: {agent_id}")]
    UnknownAgent { agent_id: String },

    #[error("Invalid agent status: {value}")]
    InvalidStatus { value: String },

    #[error("Agent {agent_id} cannot move from {from} to {to}")]
    InvalidTransition {
        agent_id: String,
        from: String,
        to: String,
    },

    #[error("Invalid event type: {value}")]
    InvalidEventType { value: String },

    #[error("Event queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Event {sequence} was dropped before delivery")]
    EventUndelivered { sequence: u64 },

    #[error("Diagnostic check '{check}' failed: {reason}")]
    DiagnosticCheckFailure { check: String, reason: String },

    #[error("Shutdown halted by critical diagnostics: {}", critical_warnings.join("; "))]
    ShutdownHalted { critical_warnings: Vec<String> },

    #[error("Shutdown incomplete, missing agents: {}", missing_agents.join(", "))]
    ShutdownIncomplete { missing_agents: Vec<String> },

    #[error("Emergency shutdown: {reason}")]
    EmergencyShutdown { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<Infallible> for BusError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

pub type Result<T, E = BusError> = std::result::Result<T, E>;
