use sb_core::types::ClientId;
use thiserror::Error;

/// Length of the big-endian client-id length prefix.
const HEADER_LEN: usize = 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("audio frame has an empty client id")]
    EmptyClientId,

    #[error("client id is {0} bytes, longer than a frame header allows")]
    ClientIdTooLong(usize),

    #[error("audio frame truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("client id is not valid UTF-8")]
    InvalidClientId,
}

/// One binary audio frame: `[u16 BE id length][client id][payload]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub client_id: ClientId,
    pub audio: Vec<u8>,
}

impl AudioFrame {
    pub fn new(client_id: impl Into<ClientId>, audio: impl Into<Vec<u8>>) -> Self {
        Self {
            client_id: client_id.into(),
            audio: audio.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let id = self.client_id.as_str().as_bytes();
        if id.is_empty() {
            return Err(CodecError::EmptyClientId);
        }
        let len = u16::try_from(id.len()).map_err(|_| CodecError::ClientIdTooLong(id.len()))?;

        let mut out = Vec::with_capacity(HEADER_LEN + id.len() + self.audio.len());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(id);
        out.extend_from_slice(&self.audio);
        Ok(out)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        let Some((header, rest)) = frame.split_first_chunk::<HEADER_LEN>() else {
            return Err(CodecError::Truncated {
                needed: HEADER_LEN,
                got: frame.len(),
            });
        };
        let id_len = u16::from_be_bytes(*header) as usize;
        if id_len == 0 {
            return Err(CodecError::EmptyClientId);
        }
        if rest.len() < id_len {
            return Err(CodecError::Truncated {
                needed: HEADER_LEN + id_len,
                got: frame.len(),
            });
        }
        let (id, audio) = rest.split_at(id_len);
        let id = std::str::from_utf8(id).map_err(|_| CodecError::InvalidClientId)?;
        Ok(Self {
            client_id: ClientId::from(id),
            audio: audio.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_length_prefixed() {
        let bytes = AudioFrame::new("ab", vec![9, 8, 7]).encode().unwrap();
        assert_eq!(bytes, vec![0, 2, b'a', b'b', 9, 8, 7]);

        let frame = AudioFrame::decode(&bytes).unwrap();
        assert_eq!(frame.client_id.as_str(), "ab");
        assert_eq!(frame.audio, vec![9, 8, 7]);
    }

    #[test]
    fn empty_payload_is_allowed() {
        let frame = AudioFrame::decode(&[0, 1, b'x']).unwrap();
        assert!(frame.audio.is_empty());
    }

    #[test]
    fn empty_client_id_is_rejected() {
        assert_eq!(
            AudioFrame::new("", vec![1]).encode(),
            Err(CodecError::EmptyClientId)
        );
        assert_eq!(AudioFrame::decode(&[0, 0, 1, 2]), Err(CodecError::EmptyClientId));
    }

    #[test]
    fn truncated_frames_are_rejected() {
        assert_eq!(
            AudioFrame::decode(&[0]),
            Err(CodecError::Truncated { needed: 2, got: 1 })
        );
        assert_eq!(
            AudioFrame::decode(&[0, 5, b'a', b'b']),
            Err(CodecError::Truncated { needed: 7, got: 4 })
        );
    }

    #[test]
    fn non_utf8_id_is_rejected() {
        assert_eq!(
            AudioFrame::decode(&[0, 1, 0xff, 1]),
            Err(CodecError::InvalidClientId)
        );
    }
}
