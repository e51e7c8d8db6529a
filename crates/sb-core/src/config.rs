use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::GenerationParams;

/// Top-level configuration, loaded once at startup from a TOML file.
///
/// Secrets are never stored here. The engine API key is read from the
/// environment variable named by [`EngineConfig::api_key_env`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

impl Config {
    /// Load and validate a config file. Any failure aborts startup.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        let mut cfg = Self::from_toml(&text)?;
        cfg.agents.resolve_relative_to(path.parent().unwrap_or_else(|| Path::new(".")));
        Ok(cfg)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not expressible via types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general.validate()?;
        self.runtime.validate()?;
        self.engine.validate()?;
        self.memory.validate()?;
        self.relay.validate()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl GeneralConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self.log_format.as_str() {
            "pretty" | "json" => Ok(()),
            other => Err(ConfigError::Validation(format!(
                "general.log_format must be \"pretty\" or \"json\", got {other:?}"
            ))),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_host")]
    pub host: String,
    #[serde(default = "default_daemon_port")]
    pub port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_daemon_host(),
            port: default_daemon_port(),
        }
    }
}

fn default_daemon_host() -> String {
    "127.0.0.1".into()
}
fn default_daemon_port() -> u16 {
    8765
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of inference workers created at startup.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Upper bound on worker wait plus generation, per request. 0 disables it.
    #[serde(default)]
    pub per_request_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            per_request_timeout_secs: 0,
        }
    }
}

impl RuntimeConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::Validation(
                "runtime.pool_size must be >= 1".into(),
            ));
        }
        Ok(())
    }

    pub fn per_request_timeout(&self) -> Option<std::time::Duration> {
        (self.per_request_timeout_secs > 0)
            .then(|| std::time::Duration::from_secs(self.per_request_timeout_secs))
    }
}

fn default_pool_size() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// OpenAI-compatible inference server (llama.cpp, vLLM, Ollama, ...).
    #[serde(default = "default_engine_base_url")]
    pub base_url: String,
    #[serde(default = "default_engine_model")]
    pub model: String,
    /// Name of the env var holding the API key, for servers that need one.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_engine_request_timeout")]
    pub request_timeout_secs: u64,
    /// Baseline sampling parameters; agent presets override per field.
    #[serde(default = "default_engine_params")]
    pub params: GenerationParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: default_engine_base_url(),
            model: default_engine_model(),
            api_key_env: None,
            request_timeout_secs: default_engine_request_timeout(),
            params: default_engine_params(),
        }
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let url = self.base_url.trim();
        if url.is_empty() {
            return Err(ConfigError::Validation("engine.base_url must not be empty".into()));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Validation(format!(
                "engine.base_url must be an http(s) URL, got {url:?}"
            )));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::Validation("engine.model must not be empty".into()));
        }
        Ok(())
    }

    /// Resolve the API key from the configured environment variable, if any.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|k| !k.is_empty())
    }
}

fn default_engine_base_url() -> String {
    "http://127.0.0.1:8080".into()
}
fn default_engine_model() -> String {
    "local".into()
}
fn default_engine_request_timeout() -> u64 {
    300
}
fn default_engine_params() -> GenerationParams {
    GenerationParams {
        temperature: Some(0.6),
        top_p: Some(0.9),
        top_k: Some(40),
        min_p: Some(0.0),
        max_tokens: Some(512),
        stop: Some(vec!["</s>".into()]),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MemoryConfig {
    #[serde(default)]
    pub thread_window: ThreadWindowConfig,
}

impl MemoryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let tw = &self.thread_window;
        if tw.max_context_tokens == 0 {
            return Err(ConfigError::Validation(
                "memory.thread_window.max_context_tokens must be >= 1".into(),
            ));
        }
        if !(tw.chars_per_token.is_finite() && tw.chars_per_token > 0.0) {
            return Err(ConfigError::Validation(
                "memory.thread_window.chars_per_token must be a positive number".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadWindowConfig {
    /// Token budget for the rendered preamble.
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    /// Ratio used by the default character-based token estimator.
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: f32,
}

impl Default for ThreadWindowConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: default_max_context_tokens(),
            chars_per_token: default_chars_per_token(),
        }
    }
}

fn default_max_context_tokens() -> usize {
    1024
}
fn default_chars_per_token() -> f32 {
    4.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Directory holding `*.agent.json` presets.
    #[serde(default = "default_agents_dir")]
    pub dir: PathBuf,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            dir: default_agents_dir(),
        }
    }
}

impl AgentsConfig {
    fn resolve_relative_to(&mut self, base: &Path) {
        if self.dir.is_relative() {
            self.dir = base.join(&self.dir);
        }
    }
}

fn default_agents_dir() -> PathBuf {
    PathBuf::from("agents")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Upstream TTS service. When unset, `JoinTTS` is rejected.
    #[serde(default)]
    pub tts_url: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Per-client bound on queued synthesized audio frames.
    #[serde(default = "default_audio_queue")]
    pub audio_queue: usize,
    /// Attempts to re-establish a lost STT upstream before its routes are
    /// dropped. Zero disables reconnecting.
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    /// Delay before the first reconnect attempt; doubles per attempt.
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            tts_url: None,
            connect_timeout_secs: default_connect_timeout(),
            audio_queue: default_audio_queue(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
        }
    }
}

impl RelayConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.tts_url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(ConfigError::Validation(format!(
                    "relay.tts_url must be a ws(s) URL, got {url:?}"
                )));
            }
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "relay.connect_timeout_secs must be >= 1".into(),
            ));
        }
        if self.audio_queue == 0 {
            return Err(ConfigError::Validation("relay.audio_queue must be >= 1".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_backoff(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.reconnect_backoff_ms)
    }
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_audio_queue() -> usize {
    256
}
fn default_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_backoff_ms() -> u64 {
    500
}
