use async_trait::async_trait;
use sb_core::types::ClientId;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SynthesisError {
    #[error("client '{0}' is not joined to synthesis")]
    NotJoined(String),

    #[error("synthesis upstream unavailable: {0}")]
    Unavailable(String),
}

/// Destination for text that should be spoken.
///
/// Failures are reported but never fail the run that produced the text.
#[async_trait]
pub trait SynthesisSink: Send + Sync {
    /// Forward one text chunk for `client`. `is_final` marks the end of the
    /// utterance.
    async fn speak(&self, client: &ClientId, chunk: &str, is_final: bool)
        -> Result<(), SynthesisError>;

    /// Abort synthesis for `client` and discard its queued audio.
    async fn stop(&self, client: &ClientId) -> Result<(), SynthesisError>;
}
