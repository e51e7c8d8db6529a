use sb_core::types::ErrorCode;
use thiserror::Error;

use crate::codec::CodecError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("cannot reach upstream {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("timed out connecting to upstream {0}")]
    ConnectTimeout(String),

    #[error("upstream {0} disconnected")]
    Disconnected(String),

    #[error("client '{client_id}' is not subscribed on {url}")]
    NotSubscribed { url: String, client_id: String },

    #[error("speech synthesis is not configured")]
    TtsDisabled,

    #[error("client '{0}' is not joined to speech synthesis")]
    NotJoined(String),

    #[error("client id '{0}' belongs to another connection")]
    ClientIdInUse(String),

    #[error("relay is shut down")]
    Closed,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::Connect { .. }
            | RelayError::ConnectTimeout(_)
            | RelayError::Disconnected(_) => ErrorCode::UpstreamUnavailable,
            RelayError::ClientIdInUse(_) => ErrorCode::ClientIdInUse,
            RelayError::Closed => ErrorCode::ShuttingDown,
            RelayError::TtsDisabled => ErrorCode::TtsDisabled,
            RelayError::NotSubscribed { .. } | RelayError::NotJoined(_) | RelayError::Codec(_) => {
                ErrorCode::BadRequest
            }
        }
    }
}
