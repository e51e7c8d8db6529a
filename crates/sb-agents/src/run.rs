use std::sync::Arc;

use chrono::{DateTime, Utc};
use sb_core::presets::AgentPreset;
use sb_core::types::{ConnectionId, RunId, ThreadId};
use tracing::warn;

use crate::state_machine::{RunEvent, RunState, RunStateMachine};

/// One request/response cycle, owned by its driver task.
#[derive(Debug)]
pub struct Run {
    pub id: RunId,
    pub connection: ConnectionId,
    pub agent: Arc<AgentPreset>,
    pub input: String,
    pub thread: Option<ThreadId>,
    /// Id of the worker while one is held.
    pub worker: Option<usize>,
    pub started_at: DateTime<Utc>,
    /// Bytes of output produced so far.
    pub output_len: usize,
    machine: RunStateMachine,
}

impl Run {
    pub fn new(
        connection: ConnectionId,
        agent: Arc<AgentPreset>,
        input: impl Into<String>,
        thread: Option<ThreadId>,
    ) -> Self {
        Self {
            id: RunId::new(),
            connection,
            agent,
            input: input.into(),
            thread,
            worker: None,
            started_at: Utc::now(),
            output_len: 0,
            machine: RunStateMachine::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.machine.state()
    }

    pub fn history(&self) -> &[(RunState, RunEvent, RunState)] {
        self.machine.history()
    }

    /// Apply a lifecycle event. The driver never issues illegal events, so a
    /// rejection is logged rather than propagated.
    pub fn advance(&mut self, event: RunEvent) {
        if let Err(e) = self.machine.transition(event) {
            warn!(run_id = %self.id, error = %e, "rejected run transition");
        }
        if self.machine.state().is_terminal() {
            self.worker = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_core::types::MemoryPolicy;

    fn run() -> Run {
        Run::new(
            ConnectionId::new(),
            Arc::new(AgentPreset::new("router", MemoryPolicy::None)),
            "hi",
            None,
        )
    }

    #[test]
    fn runs_get_unique_ids() {
        assert_ne!(run().id, run().id);
    }

    #[test]
    fn terminal_transition_clears_worker() {
        let mut r = run();
        r.advance(RunEvent::Acquire);
        r.worker = Some(2);
        r.advance(RunEvent::Open);
        r.advance(RunEvent::Complete);
        assert_eq!(r.state(), RunState::Done);
        assert_eq!(r.worker, None);
    }

    #[test]
    fn illegal_transition_leaves_state() {
        let mut r = run();
        r.advance(RunEvent::Complete);
        assert_eq!(r.state(), RunState::Created);
        assert!(r.history().is_empty());
    }
}
