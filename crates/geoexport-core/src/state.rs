//! The step's lifecycle state machine.
//!
//! `NEW -> PREPARED -> RUNNING -> COMPLETED`, with `FAILED` reachable as a
//! terminal state from anywhere.

use std::fmt;

/// Lifecycle state of a tasked step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    New,
    Prepared,
    Running,
    Completed,
    Failed,
}

impl StepState {
    /// Whether `to` is a legal transition from `self`.
    pub fn can_transition_to(self, to: StepState) -> bool {
        use StepState::*;
        match (self, to) {
            (New, Prepared) => true,
            (Prepared, Running) => true,
            (Running, Completed) => true,
            // execute(resume=true) re-enters Running from Running itself.
            (Running, Running) => true,
            (_, Failed) => self != Failed,
            _ => false,
        }
    }

    /// Terminal states accept no further transitions (other than no-ops).
    pub fn is_terminal(self) -> bool {
        matches!(self, StepState::Completed | StepState::Failed)
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Prepared => "prepared",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}
