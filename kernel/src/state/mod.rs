// Instant Lifecycle State Machine
//
// Validates transitions of a single instant through its lifecycle.
// This module is pure, deterministic, and side-effect free.

use crate::timeline::{Action, InstantState};

/// Errors produced during instant state transitions.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("illegal state transition: {0}")]
    IllegalTransition(String),
}

/// Stateful reducer for the lifecycle of one instant.
///
/// NOTE:
/// A completed instant is terminal. The only backwards edge is
/// INFLIGHT -> REQUESTED for compactions, which are re-executed from
/// their plan after a failed attempt is rolled back.
#[derive(Debug, Clone)]
pub struct InstantStateMachine {
    action: Action,
    state: Option<InstantState>,
}

impl InstantStateMachine {
    /// Create a state machine for an instant that does not exist yet.
    pub fn new(action: Action) -> Self {
        Self {
            action,
            state: None,
        }
    }

    /// Resume from a state already recorded on the timeline.
    pub fn resume(action: Action, state: InstantState) -> Self {
        Self {
            action,
            state: Some(state),
        }
    }

    /// Apply a single transition to the state machine.
    pub fn apply(&mut self, next: InstantState) -> Result<(), StateError> {
        use InstantState::*;

        let allowed = match (self.state, next) {
            // Creation
            (None, Requested) => true,

            // Execution starts, then completes
            (Some(Requested), Inflight) => true,
            (Some(Inflight), Completed) => true,

            // A failed compaction attempt goes back to its plan
            (Some(Inflight), Requested) => self.action == Action::Compaction,

            _ => false,
        };

        if !allowed {
            return Err(StateError::IllegalTransition(format!(
                "cannot move {} instant from {:?} to {:?}",
                self.action.as_str(),
                self.state,
                next
            )));
        }

        self.state = Some(next);
        Ok(())
    }

    /// Get the current state, if the instant exists.
    pub fn current_state(&self) -> Option<InstantState> {
        self.state
    }
}
