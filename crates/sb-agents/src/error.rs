use sb_core::types::ErrorCode;
use thiserror::Error;

/// Why a run was rejected or failed. Each variant maps to one client-facing
/// [`ErrorCode`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("unknown agent '{0}'")]
    AgentInvalid(String),

    #[error("agent '{agent}' uses memory policy '{policy}', which is not available")]
    MemoryUnavailable { agent: String, policy: String },

    #[error("agent '{0}' requires a thread_id")]
    ThreadRequired(String),

    #[error("text is empty")]
    Empty,

    #[error("a run is already active on this connection")]
    Busy,

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("engine failure: {0}")]
    Engine(String),

    #[error("output field '{field}': {reason}")]
    OutputField { field: String, reason: String },
}

impl RunError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RunError::AgentInvalid(_) | RunError::MemoryUnavailable { .. } => ErrorCode::AgentInvalid,
            RunError::ThreadRequired(_) => ErrorCode::MemThreadRequired,
            RunError::Empty => ErrorCode::Empty,
            RunError::Busy => ErrorCode::Busy,
            RunError::ShuttingDown => ErrorCode::ShuttingDown,
            RunError::Engine(_) => ErrorCode::UpstreamUnavailable,
            RunError::OutputField { .. } => ErrorCode::OutputField,
        }
    }
}
