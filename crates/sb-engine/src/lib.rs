//! Inference engines and the worker pool that lends them out.
//!
//! - [`engine`]: the [`Engine`] trait and request types
//! - [`local`]: OpenAI-compatible streaming client for local servers
//! - [`mock`]: scripted engine for tests
//! - [`pool`]: fixed-size, FIFO-fair [`WorkerPool`]

pub mod engine;
pub mod local;
pub mod mock;
pub mod pool;

pub use engine::{ChatMessage, ChatRole, DeltaStream, Engine, EngineError, GenerationRequest};
pub use local::LocalEngine;
pub use mock::MockEngine;
pub use pool::{PoolError, Worker, WorkerGuard, WorkerPool};
