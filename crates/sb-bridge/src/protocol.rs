use sb_agents::RunUpdate;
use sb_core::types::{ErrorCode, InterruptReason, RunId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// A text frame from the client, `{"type": <Name>, "payload": {...}}`.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Chat(ChatPayload),
    Interrupt,
    JoinStt(JoinSttPayload),
    LeaveStt(LeaveSttPayload),
    JoinTts(JoinTtsPayload),
    LeaveTts(LeaveTtsPayload),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatPayload {
    pub agent: String,
    pub text: String,
    #[serde(default, alias = "threadId")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSttPayload {
    pub stt_url: String,
    pub client_id: String,
    pub agent: String,
    #[serde(default, alias = "thread_id")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveSttPayload {
    pub stt_url: String,
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinTtsPayload {
    pub client_id: String,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub speed: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveTtsPayload {
    pub client_id: String,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("invalid payload for {kind}: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

fn payload<T: DeserializeOwned>(kind: &str, value: serde_json::Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

impl ClientMessage {
    /// Parse one text frame. `Interrupt` may omit its payload.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let kind = envelope.kind.as_str();
        let body = envelope.payload;
        Ok(match kind {
            "Chat" => ClientMessage::Chat(payload(kind, body)?),
            "Interrupt" => ClientMessage::Interrupt,
            "JoinSTT" => ClientMessage::JoinStt(payload(kind, body)?),
            "LeaveSTT" => ClientMessage::LeaveStt(payload(kind, body)?),
            "JoinTTS" => ClientMessage::JoinTts(payload(kind, body)?),
            "LeaveTTS" => ClientMessage::LeaveTts(payload(kind, body)?),
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        })
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    RunStarted {
        run_id: RunId,
    },
    ChatChunk {
        run_id: RunId,
        chunk: String,
    },
    ChatDone {
        run_id: RunId,
    },
    Interrupted {
        run_id: RunId,
        reason: InterruptReason,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<RunId>,
        code: ErrorCode,
        message: String,
    },
    SttJoined {
        stt_url: String,
        client_id: String,
    },
    SttLeft {
        stt_url: String,
        client_id: String,
    },
    TtsJoined {
        client_id: String,
    },
    TtsLeft {
        client_id: String,
    },
    TtsStop {
        client_id: String,
    },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            run_id: None,
            code,
            message: message.into(),
        }
    }
}

impl From<RunUpdate> for ServerMessage {
    fn from(update: RunUpdate) -> Self {
        match update {
            RunUpdate::Started { run_id } => ServerMessage::RunStarted { run_id },
            RunUpdate::Chunk { run_id, chunk } => ServerMessage::ChatChunk { run_id, chunk },
            RunUpdate::Done { run_id } => ServerMessage::ChatDone { run_id },
            RunUpdate::Interrupted { run_id, reason } => {
                ServerMessage::Interrupted { run_id, reason }
            }
            RunUpdate::Error {
                run_id,
                code,
                message,
            } => ServerMessage::Error {
                run_id,
                code,
                message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_accepts_both_thread_spellings() {
        let snake = ClientMessage::parse(
            r#"{"type":"Chat","payload":{"agent":"topic","text":"hi","thread_id":"t1"}}"#,
        )
        .unwrap();
        let camel = ClientMessage::parse(
            r#"{"type":"Chat","payload":{"agent":"topic","text":"hi","threadId":"t1"}}"#,
        )
        .unwrap();
        assert_eq!(snake, camel);
        match snake {
            ClientMessage::Chat(chat) => assert_eq!(chat.thread_id.as_deref(), Some("t1")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn interrupt_payload_is_optional() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"Interrupt"}"#).unwrap(),
            ClientMessage::Interrupt
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"Interrupt","payload":{}}"#).unwrap(),
            ClientMessage::Interrupt
        );
    }

    #[test]
    fn join_stt_uses_camel_case() {
        let msg = ClientMessage::parse(
            r#"{"type":"JoinSTT","payload":{"sttUrl":"ws://stt","clientId":"mic","agent":"router"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::JoinStt(JoinSttPayload {
                stt_url: "ws://stt".into(),
                client_id: "mic".into(),
                agent: "router".into(),
                thread_id: None,
            })
        );
    }

    #[test]
    fn bad_frames_are_classified() {
        assert!(matches!(
            ClientMessage::parse("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"Dance"}"#),
            Err(ProtocolError::UnknownType(_))
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"Chat","payload":{"agent":"x"}}"#),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn server_messages_are_camel_case() {
        let run_id = RunId::new();
        let msg = ServerMessage::Interrupted {
            run_id,
            reason: InterruptReason::Timeout,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "Interrupted", "payload": {"runId": run_id.to_string(), "reason": "timeout"}})
        );

        let err = ServerMessage::error(ErrorCode::Busy, "busy");
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"type": "Error", "payload": {"code": "BUSY", "message": "busy"}})
        );

        let joined = ServerMessage::SttJoined {
            stt_url: "ws://stt".into(),
            client_id: "mic".into(),
        };
        assert_eq!(
            serde_json::to_value(&joined).unwrap(),
            json!({"type": "SttJoined", "payload": {"sttUrl": "ws://stt", "clientId": "mic"}})
        );
    }
}
