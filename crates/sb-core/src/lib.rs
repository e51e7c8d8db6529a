//! Shared foundation for the switchboard workspace.
//!
//! Everything the other crates agree on lives here:
//! - [`config`]: the TOML configuration surface, loaded once at startup
//! - [`presets`]: the immutable agent preset table
//! - [`types`]: identifiers, generation parameters, memory policies and
//!   the machine-readable error codes sent to clients

pub mod config;
pub mod presets;
pub mod types;
