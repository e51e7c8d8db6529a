//! Run orchestration.
//!
//! A run is one request/response cycle: validate against the agent preset,
//! borrow a worker, build the memory preamble, stream the engine output to
//! the client, then record the exchange and return the worker.
//!
//! - [`state_machine`]: lifecycle states and legal transitions
//! - [`run`]: the per-run record
//! - [`slot`]: one-active-run-per-connection bookkeeping and interrupts
//! - [`orchestrator`]: pre-flight checks and the run driver
//! - [`synthesis`]: the seam through which text reaches speech synthesis

pub mod error;
pub mod events;
pub mod orchestrator;
pub mod run;
pub mod slot;
pub mod state_machine;
pub mod synthesis;

pub use error::RunError;
pub use events::RunUpdate;
pub use orchestrator::{ChatRequest, RunOrchestrator, RunSummary, RunTarget};
pub use run::Run;
pub use slot::RunSlot;
pub use state_machine::{RunEvent, RunState, RunStateMachine};
pub use synthesis::{SynthesisError, SynthesisSink};
