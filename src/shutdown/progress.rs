use serde::{Deserialize, Serialize};
use statig::prelude::*;
use tracing::{info, warn};

use super::ShutdownPhase;

/// Where a shutdown attempt currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownStage {
    Idle,
    Diagnosing,
    Halted,
    Phase(ShutdownPhase),
    Verifying,
    Completed,
    Incomplete,
    Emergency,
}

impl ShutdownStage {
    /// A new attempt may start from here
    pub fn accepts_attempt(self) -> bool {
        matches!(
            self,
            ShutdownStage::Idle | ShutdownStage::Halted | ShutdownStage::Incomplete
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Begin,
    DiagnosticsBlocked,
    DiagnosticsPassed,
    PhaseStarted(ShutdownPhase),
    VerificationStarted,
    Finished { complete: bool },
    Fatal,
}

/// Shutdown progress tracked as a statig state machine
///
/// The current stage is mirrored in `stage` so callers can read it without matching on
/// the generated state type.
pub struct ShutdownProgress {
    stage: ShutdownStage,
}

impl Default for ShutdownProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownProgress {
    pub fn new() -> Self {
        Self {
            stage: ShutdownStage::Idle,
        }
    }

    pub fn stage(&self) -> ShutdownStage {
        self.stage
    }

    fn enter(&mut self, stage: ShutdownStage) {
        info!(from = ?self.stage, to = ?stage, "Shutdown stage changed");
        self.stage = stage;
    }

    fn phase(&mut self, event: &ProgressEvent, expected: ShutdownPhase) -> Option<State> {
        match event {
            ProgressEvent::PhaseStarted(phase) if *phase == expected => {
                self.enter(ShutdownStage::Phase(expected));
                Some(match expected {
                    ShutdownPhase::Prep => State::phase_prep(),
                    ShutdownPhase::Persist => State::phase_persist(),
                    ShutdownPhase::Cleanup => State::phase_cleanup(),
                    ShutdownPhase::Broadcast => State::phase_broadcast(),
                })
            }
            _ => None,
        }
    }
}

#[state_machine(initial = "State::idle()")]
impl ShutdownProgress {
    #[state]
    fn idle(&mut self, event: &ProgressEvent) -> Outcome<State> {
        match event {
            ProgressEvent::Begin => {
                self.enter(ShutdownStage::Diagnosing);
                Transition(State::diagnosing())
            }
            ProgressEvent::Fatal => self.enter_emergency(),
            _ => self.ignored(event),
        }
    }

    #[state]
    fn diagnosing(&mut self, event: &ProgressEvent) -> Outcome<State> {
        match event {
            ProgressEvent::DiagnosticsBlocked => {
                self.enter(ShutdownStage::Halted);
                Transition(State::halted())
            }
            ProgressEvent::DiagnosticsPassed => {
                self.enter(ShutdownStage::Phase(ShutdownPhase::Prep));
                Transition(State::phase_prep())
            }
            ProgressEvent::Fatal => self.enter_emergency(),
            _ => self.ignored(event),
        }
    }

    #[state]
    fn halted(&mut self, event: &ProgressEvent) -> Outcome<State> {
        match event {
            ProgressEvent::Begin => {
                self.enter(ShutdownStage::Diagnosing);
                Transition(State::diagnosing())
            }
            ProgressEvent::Fatal => self.enter_emergency(),
            _ => self.ignored(event),
        }
    }

    #[state]
    fn phase_prep(&mut self, event: &ProgressEvent) -> Outcome<State> {
        self.in_phase(event, ShutdownPhase::Persist)
    }

    #[state]
    fn phase_persist(&mut self, event: &ProgressEvent) -> Outcome<State> {
        self.in_phase(event, ShutdownPhase::Cleanup)
    }

    #[state]
    fn phase_cleanup(&mut self, event: &ProgressEvent) -> Outcome<State> {
        self.in_phase(event, ShutdownPhase::Broadcast)
    }

    #[state]
    fn phase_broadcast(&mut self, event: &ProgressEvent) -> Outcome<State> {
        match event {
            ProgressEvent::VerificationStarted => {
                self.enter(ShutdownStage::Verifying);
                Transition(State::verifying())
            }
            // A failed phase skips verification
            ProgressEvent::Finished { complete: false } => {
                self.enter(ShutdownStage::Incomplete);
                Transition(State::incomplete())
            }
            ProgressEvent::Fatal => self.enter_emergency(),
            _ => self.ignored(event),
        }
    }

    #[state]
    fn verifying(&mut self, event: &ProgressEvent) -> Outcome<State> {
        match event {
            ProgressEvent::Finished { complete: true } => {
                self.enter(ShutdownStage::Completed);
                Transition(State::completed())
            }
            ProgressEvent::Finished { complete: false } => {
                self.enter(ShutdownStage::Incomplete);
                Transition(State::incomplete())
            }
            ProgressEvent::Fatal => self.enter_emergency(),
            _ => self.ignored(event),
        }
    }

    #[state]
    fn completed(&mut self, event: &ProgressEvent) -> Outcome<State> {
        self.ignored(event)
    }

    #[state]
    fn incomplete(&mut self, event: &ProgressEvent) -> Outcome<State> {
        match event {
            ProgressEvent::Begin => {
                self.enter(ShutdownStage::Diagnosing);
                Transition(State::diagnosing())
            }
            ProgressEvent::Fatal => self.enter_emergency(),
            _ => self.ignored(event),
        }
    }

    #[state]
    fn emergency(&mut self, event: &ProgressEvent) -> Outcome<State> {
        self.ignored(event)
    }
}

impl ShutdownProgress {
    fn in_phase(&mut self, event: &ProgressEvent, next: ShutdownPhase) -> Outcome<State> {
        if let Some(state) = self.phase(event, next) {
            return Transition(state);
        }
        match event {
            ProgressEvent::Fatal => self.enter_emergency(),
            _ => self.ignored(event),
        }
    }

    fn enter_emergency(&mut self) -> Outcome<State> {
        self.enter(ShutdownStage::Emergency);
        Transition(State::emergency())
    }

    fn ignored(&self, event: &ProgressEvent) -> Outcome<State> {
        warn!(stage = ?self.stage, event = ?event, "Ignoring out-of-order shutdown event");
        Handled
    }
}
