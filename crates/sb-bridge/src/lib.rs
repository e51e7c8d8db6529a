//! Client-facing surface: the `/ws` session protocol and the HTTP status
//! endpoints.

pub mod http_api;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transcripts;
pub mod ws;

pub use http_api::api_router;
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use session::{Outgoing, Session, Sessions};
pub use state::AppState;
pub use transcripts::SessionTranscripts;
