//! Conversation memory strategies.
//!
//! An agent preset names a [`MemoryPolicy`](sb_core::types::MemoryPolicy);
//! the [`MemoryRegistry`] maps it to a shared [`MemoryStrategy`] that builds
//! the history preamble before generation and records the exchange after it.

pub mod estimator;
pub mod none;
pub mod registry;
pub mod strategy;
pub mod thread_window;

pub use estimator::{CharRatioEstimator, TokenEstimator};
pub use none::NoMemory;
pub use registry::MemoryRegistry;
pub use strategy::{MemoryStrategy, TurnRole};
pub use thread_window::{ThreadWindowMemory, Turn};
