//! The switchboard daemon: wires the crates together and serves the bridge.

pub mod daemon;
pub mod shutdown;

pub use daemon::Daemon;
pub use shutdown::ShutdownSignal;
