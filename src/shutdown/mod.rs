// Shutdown Module - phased, verified shutdown with an emergency fallback

pub mod coordinator;
pub mod directive;
pub mod emergency;
pub mod progress;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use coordinator::{
    PhaseResult, ShutdownCoordinator, ShutdownOutcome, ShutdownReport, VerificationResult,
};
pub use directive::{DirectiveTemplate, PhaseDirectiveConfig, ShutdownPhaseDirective};
pub use emergency::{EmergencySnapshot, ProcessControl, StdProcessControl};
pub use progress::{ShutdownProgress, ShutdownStage};

#[cfg(any(test, feature = "testing"))]
pub use emergency::MockProcessControl;

/// Shutdown phases, run in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPhase {
    Prep,
    Persist,
    Cleanup,
    Broadcast,
}

impl ShutdownPhase {
    pub const ALL: [ShutdownPhase; 4] = [
        ShutdownPhase::Prep,
        ShutdownPhase::Persist,
        ShutdownPhase::Cleanup,
        ShutdownPhase::Broadcast,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ShutdownPhase::Prep => "prep",
            ShutdownPhase::Persist => "persist",
            ShutdownPhase::Cleanup => "cleanup",
            ShutdownPhase::Broadcast => "broadcast",
        }
    }

    pub fn next(self) -> Option<ShutdownPhase> {
        match self {
            ShutdownPhase::Prep => Some(ShutdownPhase::Persist),
            ShutdownPhase::Persist => Some(ShutdownPhase::Cleanup),
            ShutdownPhase::Cleanup => Some(ShutdownPhase::Broadcast),
            ShutdownPhase::Broadcast => None,
        }
    }
}

impl fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShutdownPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ShutdownPhase::ALL
            .into_iter()
            .find(|phase| phase.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown shutdown phase: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        let mut phase = ShutdownPhase::Prep;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            seen.push(next);
            phase = next;
        }
        assert_eq!(seen, ShutdownPhase::ALL);
    }

    #[test]
    fn test_phase_names() {
        assert_eq!("Cleanup".parse::<ShutdownPhase>().unwrap(), ShutdownPhase::Cleanup);
        assert!("teardown".parse::<ShutdownPhase>().is_err());
        assert_eq!(
            serde_json::to_value(ShutdownPhase::Persist).unwrap(),
            serde_json::json!("persist")
        );
    }
}
