// Core types for agent presence and status

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::BusError;

/// Agent status as reported to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    /// Registered and free to accept work
    Idle,
    /// Working on a task
    Busy,
    /// Reported a failure
    Error,
    /// Acknowledged shutdown
    ShutdownReady,
    /// Gone for good
    Terminated,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Idle => "IDLE",
            AgentStatus::Busy => "BUSY",
            AgentStatus::Error => "ERROR",
            AgentStatus::ShutdownReady => "SHUTDOWN_READY",
            AgentStatus::Terminated => "TERMINATED",
        }
    }

    /// Whether the status machine allows moving from `self` to `next`
    ///
    /// Re-asserting the current status is allowed so agents can update their task or
    /// error message. TERMINATED is final.
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        use AgentStatus::*;

        if self == next {
            return self != Terminated;
        }
        matches!(
            (self, next),
            (Idle, Busy)
                | (Busy, Idle)
                | (Idle | Busy, Error)
                | (Error, Idle)
                | (Idle | Busy | Error, ShutdownReady)
                | (ShutdownReady, Terminated)
        )
    }

    /// Agents that still take part in shutdown and diagnostics
    pub fn is_active(self) -> bool {
        self != AgentStatus::Terminated
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "IDLE" => Ok(AgentStatus::Idle),
            "BUSY" => Ok(AgentStatus::Busy),
            "ERROR" => Ok(AgentStatus::Error),
            "SHUTDOWN_READY" => Ok(AgentStatus::ShutdownReady),
            "TERMINATED" => Ok(AgentStatus::Terminated),
            _ => Err(BusError::InvalidStatus {
                value: s.to_string(),
            }),
        }
    }
}

impl TryFrom<&str> for AgentStatus {
    type Error = BusError;

    fn try_from(value: &str) -> Result<Self, BusError> {
        value.parse()
    }
}

impl TryFrom<String> for AgentStatus {
    type Error = BusError;

    fn try_from(value: String) -> Result<Self, BusError> {
        value.parse()
    }
}

/// Registry entry for one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub status: AgentStatus,
    pub capabilities: BTreeSet<String>,
    pub current_task: Option<String>,
    pub error_message: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(agent_id: &str, capabilities: BTreeSet<String>) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.to_string(),
            status: AgentStatus::Idle,
            capabilities,
            current_task: None,
            error_message: None,
            registered_at: now,
            updated_at: now,
        }
    }

    /// Idle and advertising every required capability
    pub fn is_available_for(&self, required: &BTreeSet<String>) -> bool {
        self.status == AgentStatus::Idle && required.is_subset(&self.capabilities)
    }
}
