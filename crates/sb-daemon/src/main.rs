//! switchboard: agent runs over a WebSocket, with STT/TTS relays.
//!
//! Usage: `switchboard [config.toml]`. Without an argument the path comes
//! from `SWITCHBOARD_CONFIG`, then `switchboard.toml`.

use anyhow::{Context, Result};
use sb_core::config::Config;
use sb_telemetry::logging::{self, LogFormat};
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_CONFIG: &str = "switchboard.toml";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let path = config_path();
    let config = Config::load_from(&path)
        .with_context(|| format!("failed to load config from {path}"))?;

    logging::init(
        "switchboard",
        &config.general.log_level,
        LogFormat::from_config(&config.general.log_format),
    );
    info!(config = %path, version = env!("CARGO_PKG_VERSION"), "switchboard starting");

    let daemon = sb_daemon::Daemon::new(config)?;
    daemon.shutdown_handle().trigger_on_ctrl_c();
    daemon.run().await
}

fn config_path() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SWITCHBOARD_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string())
}
