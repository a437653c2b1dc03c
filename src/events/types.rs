use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use uuid::Uuid;

use crate::error::BusError;
use crate::priority::EventPriority;

static CUSTOM_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_.-]*$").expect("static regex"));

/// Event type tag used to route events to handlers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum EventType {
    /// Bus-level notifications: shutdown directives, diagnostics, emergencies
    System,
    /// Work items exchanged between agents
    Task,
    /// Agent lifecycle: registration and status changes
    Agent,
    /// Domain-specific tag, written `CUSTOM:<name>`
    Custom(String),
}

impl EventType {
    pub fn custom(name: impl Into<String>) -> Self {
        EventType::Custom(name.into())
    }

    /// Check that the tag is one the dispatcher will route
    pub fn validate(&self) -> Result<(), BusError> {
        match self {
            EventType::Custom(name) if !CUSTOM_TAG.is_match(name) => {
                Err(BusError::InvalidEventType {
                    value: self.to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::System => write!(f, "SYSTEM"),
            EventType::Task => write!(f, "TASK"),
            EventType::Agent => write!(f, "AGENT"),
            EventType::Custom(name) => write!(f, "CUSTOM:{}", name),
        }
    }
}

impl FromStr for EventType {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let event_type = match s.to_ascii_uppercase().as_str() {
            "SYSTEM" => EventType::System,
            "TASK" => EventType::Task,
            "AGENT" => EventType::Agent,
            upper if upper.starts_with("CUSTOM:") => EventType::Custom(s["CUSTOM:".len()..].to_string()),
            _ => {
                return Err(BusError::InvalidEventType {
                    value: s.to_string(),
                })
            }
        };
        event_type.validate()?;
        Ok(event_type)
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        event_type.to_string()
    }
}

impl TryFrom<String> for EventType {
    type Error = BusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A prioritized message carried by the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub data: Map<String, Value>,
    pub source_id: String,
    pub target_id: Option<String>,
    pub priority: i32,
    sequence: u64,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: EventType, source_id: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            data: Map::new(),
            source_id: source_id.into(),
            target_id: None,
            priority: EventPriority::Normal.value(),
            sequence: 0,
            timestamp: Utc::now(),
        }
    }

    /// SYSTEM event whose payload `type` is `kind`
    pub fn system(kind: &str, source_id: impl Into<String>) -> Self {
        Self::new(EventType::System, source_id).with_field("type", kind)
    }

    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    pub fn with_priority(mut self, priority: impl Into<i32>) -> Self {
        self.priority = priority.into();
        self
    }

    /// Named level this event's numeric priority falls into
    pub fn priority_level(&self) -> EventPriority {
        EventPriority::from_value(self.priority)
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// Replace the payload with the fields of a JSON object; non-objects land under `value`
    pub fn with_data(mut self, data: Value) -> Self {
        match data {
            Value::Object(map) => self.data = map,
            other => {
                self.data.insert("value".to_string(), other);
            }
        }
        self
    }

    /// Payload `type` key, if present
    pub fn kind(&self) -> Option<&str> {
        self.data.get("type").and_then(Value::as_str)
    }

    /// Enqueue order assigned by the dispatcher; 0 until dispatched
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn assign_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// True when the event is broadcast or addressed to `agent_id`
    pub fn is_for(&self, agent_id: &str) -> bool {
        self.target_id.as_deref().map_or(true, |target| target == agent_id)
    }
}
