use std::fmt;

/// Named priority levels for bus events
/// Lower values = more urgent, dequeued first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventPriority {
    /// Shutdown and emergency notifications (0)
    Critical = 0,
    /// Shutdown directives (1)
    High = 1,
    /// Lifecycle and status events (5)
    Normal = 5,
    /// Background chatter (10)
    Low = 10,
}

impl EventPriority {
    /// Get the numeric priority value
    pub fn value(self) -> i32 {
        self as i32
    }

    /// Map an arbitrary numeric priority to the closest named level at or below its urgency
    pub fn from_value(value: i32) -> Self {
        match value {
            i32::MIN..=0 => EventPriority::Critical,
            1..=4 => EventPriority::High,
            5..=9 => EventPriority::Normal,
            _ => EventPriority::Low,
        }
    }
}

impl From<EventPriority> for i32 {
    fn from(priority: EventPriority) -> Self {
        priority.value()
    }
}

impl Default for EventPriority {
    fn default() -> Self {
        EventPriority::Normal
    }
}

impl fmt::Display for EventPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EventPriority::Critical => "CRITICAL",
            EventPriority::High => "HIGH",
            EventPriority::Normal => "NORMAL",
            EventPriority::Low => "LOW",
        };
        write!(f, "{}", label)
    }
}
