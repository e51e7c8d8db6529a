//! Multiplexing relay between many logical clients and a few upstream
//! speech services.
//!
//! - [`codec`]: client-id tagged binary audio frames
//! - [`transport`]: upstream wire events and the connector seam
//! - [`stt`]: shared transcription upstreams and transcript routing
//! - [`tts`]: the synthesis upstream and per-client audio queues

pub mod codec;
pub mod error;
pub mod stt;
pub mod transport;
pub mod tts;

pub use codec::{AudioFrame, CodecError};
pub use error::{RelayError, Result};
pub use stt::{ReconnectPolicy, Route, SttRelay, Transcript, TranscriptHandler};
pub use transport::{
    InProcessConnector, Inbound, Outbound, UpstreamCommand, UpstreamConnector, UpstreamEvent,
    UpstreamLink, UpstreamPeer, WsConnector,
};
pub use tts::{TtsOutput, TtsRelay};
