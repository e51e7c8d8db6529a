use sb_core::types::{ErrorCode, InterruptReason, RunId};

/// Lifecycle events a run sends to its connection, in order.
///
/// A run emits `Started`, zero or more `Chunk`s, then exactly one of `Done`,
/// `Interrupted` or `Error`. A request rejected in pre-flight produces a
/// single `Error` with no run id.
#[derive(Debug, Clone, PartialEq)]
pub enum RunUpdate {
    Started {
        run_id: RunId,
    },
    Chunk {
        run_id: RunId,
        chunk: String,
    },
    Done {
        run_id: RunId,
    },
    Interrupted {
        run_id: RunId,
        reason: InterruptReason,
    },
    Error {
        run_id: Option<RunId>,
        code: ErrorCode,
        message: String,
    },
}

impl RunUpdate {
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            RunUpdate::Started { run_id }
            | RunUpdate::Chunk { run_id, .. }
            | RunUpdate::Done { run_id }
            | RunUpdate::Interrupted { run_id, .. } => Some(*run_id),
            RunUpdate::Error { run_id, .. } => *run_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunUpdate::Done { .. } | RunUpdate::Interrupted { .. } | RunUpdate::Error { .. }
        )
    }
}
