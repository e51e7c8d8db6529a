use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifier of one request/response cycle. Unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one client WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Logical client identifier used by the STT/TTS relay. Several logical
    /// clients may share one WebSocket connection.
    ClientId
);

string_id!(
    /// Caller-supplied conversation identity that scopes memory.
    ThreadId
);

// ---------------------------------------------------------------------------
// MemoryPolicy
// ---------------------------------------------------------------------------

/// Conversation-history policy an agent preset opts into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPolicy {
    #[default]
    None,
    ThreadWindow,
}

impl MemoryPolicy {
    /// Whether requests under this policy must carry a thread id.
    pub fn requires_thread(&self) -> bool {
        matches!(self, MemoryPolicy::ThreadWindow)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryPolicy::None => "none",
            MemoryPolicy::ThreadWindow => "thread_window",
        }
    }
}

impl fmt::Display for MemoryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// GenerationParams
// ---------------------------------------------------------------------------

/// Sampling knobs passed to the engine. Every field is optional so the same
/// type serves as the engine baseline and as a per-agent override.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

impl GenerationParams {
    /// Overlay `overrides` on top of `self`; set fields in `overrides` win.
    pub fn merged_with(&self, overrides: &GenerationParams) -> GenerationParams {
        GenerationParams {
            temperature: overrides.temperature.or(self.temperature),
            top_p: overrides.top_p.or(self.top_p),
            top_k: overrides.top_k.or(self.top_k),
            min_p: overrides.min_p.or(self.min_p),
            max_tokens: overrides.max_tokens.or(self.max_tokens),
            stop: overrides.stop.clone().or_else(|| self.stop.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable code carried by every `Error` event sent to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AgentInvalid,
    MemThreadRequired,
    Empty,
    Busy,
    UpstreamUnavailable,
    OutputField,
    TtsDisabled,
    BadRequest,
    /// The relay client id is held by another connection.
    ClientIdInUse,
    ShuttingDown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AgentInvalid => "AGENT_INVALID",
            ErrorCode::MemThreadRequired => "MEM_THREAD_REQUIRED",
            ErrorCode::Empty => "EMPTY",
            ErrorCode::Busy => "BUSY",
            ErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ErrorCode::OutputField => "OUTPUT_FIELD",
            ErrorCode::TtsDisabled => "TTS_DISABLED",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::ClientIdInUse => "CLIENT_ID_IN_USE",
            ErrorCode::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// InterruptReason
// ---------------------------------------------------------------------------

/// Why a run ended as `Interrupted` rather than completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    /// The client sent `Interrupt` or disconnected.
    Client,
    /// The per-request timeout elapsed.
    Timeout,
    /// The daemon is shutting down.
    Shutdown,
}

impl InterruptReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterruptReason::Client => "client",
            InterruptReason::Timeout => "timeout",
            InterruptReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_win_over_baseline() {
        let base = GenerationParams {
            temperature: Some(0.6),
            top_k: Some(40),
            max_tokens: Some(512),
            stop: Some(vec!["</s>".into()]),
            ..Default::default()
        };
        let overrides = GenerationParams {
            temperature: Some(0.1),
            max_tokens: Some(64),
            ..Default::default()
        };
        let merged = base.merged_with(&overrides);
        assert_eq!(merged.temperature, Some(0.1));
        assert_eq!(merged.max_tokens, Some(64));
        assert_eq!(merged.top_k, Some(40));
        assert_eq!(merged.stop.as_deref(), Some(&["</s>".to_string()][..]));
    }

    #[test]
    fn error_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::MemThreadRequired).unwrap();
        assert_eq!(json, "\"MEM_THREAD_REQUIRED\"");
        assert_eq!(ErrorCode::UpstreamUnavailable.as_str(), "UPSTREAM_UNAVAILABLE");
        assert_eq!(
            serde_json::to_string(&ErrorCode::ClientIdInUse).unwrap(),
            "\"CLIENT_ID_IN_USE\""
        );
    }

    #[test]
    fn memory_policy_parses_snake_case() {
        let p: MemoryPolicy = serde_json::from_str("\"thread_window\"").unwrap();
        assert_eq!(p, MemoryPolicy::ThreadWindow);
        assert!(p.requires_thread());
        assert!(!MemoryPolicy::None.requires_thread());
    }
}
