use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    WorkerAcquired,
    Streaming,
    Done,
    Interrupted,
    Errored,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Interrupted | RunState::Errored)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunState::Created => "Created",
            RunState::WorkerAcquired => "WorkerAcquired",
            RunState::Streaming => "Streaming",
            RunState::Done => "Done",
            RunState::Interrupted => "Interrupted",
            RunState::Errored => "Errored",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// RunEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEvent {
    /// A worker was handed to the run.
    Acquire,
    /// The engine sequence was opened.
    Open,
    /// The engine sequence finished and post-processing succeeded.
    Complete,
    Interrupt,
    Fail,
}

impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunEvent::Acquire => "Acquire",
            RunEvent::Open => "Open",
            RunEvent::Complete => "Complete",
            RunEvent::Interrupt => "Interrupt",
            RunEvent::Fail => "Fail",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition: cannot apply {event} in state {state}")]
    InvalidTransition { state: RunState, event: RunEvent },
}

// ---------------------------------------------------------------------------
// RunStateMachine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunStateMachine {
    current: RunState,
    history: Vec<(RunState, RunEvent, RunState)>,
}

impl RunStateMachine {
    /// Start in `Created`.
    pub fn new() -> Self {
        Self {
            current: RunState::Created,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.current
    }

    pub fn history(&self) -> &[(RunState, RunEvent, RunState)] {
        &self.history
    }

    /// Apply `event`.
    ///
    /// Valid transitions:
    /// - Created        + Acquire   -> WorkerAcquired
    /// - Created        + Interrupt -> Interrupted
    /// - Created        + Fail      -> Errored
    /// - WorkerAcquired + Open      -> Streaming
    /// - WorkerAcquired + Interrupt -> Interrupted
    /// - WorkerAcquired + Fail      -> Errored
    /// - Streaming      + Complete  -> Done
    /// - Streaming      + Interrupt -> Interrupted
    /// - Streaming      + Fail      -> Errored
    pub fn transition(&mut self, event: RunEvent) -> Result<RunState, StateMachineError> {
        let next = match (self.current, event) {
            (RunState::Created, RunEvent::Acquire) => RunState::WorkerAcquired,
            (RunState::WorkerAcquired, RunEvent::Open) => RunState::Streaming,
            (RunState::Streaming, RunEvent::Complete) => RunState::Done,
            (state, RunEvent::Interrupt) if !state.is_terminal() => RunState::Interrupted,
            (state, RunEvent::Fail) if !state.is_terminal() => RunState::Errored,
            _ => {
                return Err(StateMachineError::InvalidTransition {
                    state: self.current,
                    event,
                });
            }
        };

        let from = self.current;
        self.current = next;
        self.history.push((from, event, next));
        tracing::debug!(from = %from, event = %event, to = %next, "run state transition");
        Ok(next)
    }

    pub fn can_transition(&self, event: RunEvent) -> bool {
        matches!(
            (self.current, event),
            (RunState::Created, RunEvent::Acquire)
                | (RunState::WorkerAcquired, RunEvent::Open)
                | (RunState::Streaming, RunEvent::Complete)
                | (
                    RunState::Created | RunState::WorkerAcquired | RunState::Streaming,
                    RunEvent::Interrupt | RunEvent::Fail
                )
        )
    }
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut sm = RunStateMachine::new();
        assert_eq!(sm.transition(RunEvent::Acquire).unwrap(), RunState::WorkerAcquired);
        assert_eq!(sm.transition(RunEvent::Open).unwrap(), RunState::Streaming);
        assert_eq!(sm.transition(RunEvent::Complete).unwrap(), RunState::Done);
        assert!(sm.state().is_terminal());
        assert_eq!(sm.history().len(), 3);
    }

    #[test]
    fn interrupt_while_waiting_for_worker() {
        let mut sm = RunStateMachine::new();
        assert_eq!(sm.transition(RunEvent::Interrupt).unwrap(), RunState::Interrupted);
    }

    #[test]
    fn fail_from_every_live_state() {
        for steps in [vec![], vec![RunEvent::Acquire], vec![RunEvent::Acquire, RunEvent::Open]] {
            let mut sm = RunStateMachine::new();
            for step in steps {
                sm.transition(step).unwrap();
            }
            assert!(sm.can_transition(RunEvent::Fail));
            assert_eq!(sm.transition(RunEvent::Fail).unwrap(), RunState::Errored);
        }
    }

    #[test]
    fn terminal_states_reject_everything() {
        let mut sm = RunStateMachine::new();
        sm.transition(RunEvent::Interrupt).unwrap();
        for event in [
            RunEvent::Acquire,
            RunEvent::Open,
            RunEvent::Complete,
            RunEvent::Interrupt,
            RunEvent::Fail,
        ] {
            assert!(!sm.can_transition(event));
            assert!(sm.transition(event).is_err());
        }
        assert_eq!(sm.state(), RunState::Interrupted);
    }

    #[test]
    fn cannot_skip_states() {
        let mut sm = RunStateMachine::new();
        assert!(sm.transition(RunEvent::Open).is_err());
        assert!(sm.transition(RunEvent::Complete).is_err());
        sm.transition(RunEvent::Acquire).unwrap();
        assert!(sm.transition(RunEvent::Complete).is_err());
    }

    #[test]
    fn display_labels() {
        assert_eq!(RunState::WorkerAcquired.to_string(), "WorkerAcquired");
        assert_eq!(RunEvent::Interrupt.to_string(), "Interrupt");
    }
}
