use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use sb_core::types::ClientId;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

use crate::codec::AudioFrame;
use crate::error::{RelayError, Result};

// ---------------------------------------------------------------------------
// Wire events
// ---------------------------------------------------------------------------

/// Text events the relay sends upstream, as `{"event": ..., "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum UpstreamCommand {
    SubscribeTranscripts {
        #[serde(rename = "clientId")]
        client_id: ClientId,
    },
    UnsubscribeTranscripts {
        #[serde(rename = "clientId")]
        client_id: ClientId,
    },
    TtsTextChunk {
        chunk: String,
        target_client_id: ClientId,
        #[serde(rename = "final")]
        is_final: bool,
    },
    StopGeneration {
        client_id: ClientId,
    },
    TtsConfigureClient {
        client_id: ClientId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        voice: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speed: Option<f32>,
    },
}

/// Text events received from an upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum UpstreamEvent {
    Transcription {
        text: String,
        #[serde(default)]
        duration: f64,
        client_id: ClientId,
    },
}

/// Relay → upstream traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Command(UpstreamCommand),
    Audio(AudioFrame),
}

/// Upstream → relay traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(UpstreamEvent),
    Audio(AudioFrame),
}

// ---------------------------------------------------------------------------
// Connector seam
// ---------------------------------------------------------------------------

/// A live upstream connection seen as a pair of channels.
///
/// Dropping `tx` closes the connection. `rx` disconnects once the upstream
/// goes away.
#[derive(Debug)]
pub struct UpstreamLink {
    pub tx: flume::Sender<Outbound>,
    pub rx: flume::Receiver<Inbound>,
}

/// Opens upstream connections. Returns only once the connection is live.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<UpstreamLink>;
}

// ---------------------------------------------------------------------------
// WsConnector
// ---------------------------------------------------------------------------

/// Connects to real upstreams over WebSocket.
///
/// Each link runs a writer task (channel → socket) and a reader task
/// (socket → channel). The writer sends a close frame once the relay drops
/// its sender.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl UpstreamConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<UpstreamLink> {
        let (socket, _) =
            tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| RelayError::Connect {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
        let (mut sink, mut stream) = socket.split();
        let (out_tx, out_rx) = flume::unbounded::<Outbound>();
        let (in_tx, in_rx) = flume::unbounded::<Inbound>();

        let writer_url = url.to_string();
        tokio::spawn(async move {
            while let Ok(outbound) = out_rx.recv_async().await {
                let message = match outbound {
                    Outbound::Command(cmd) => match serde_json::to_string(&cmd) {
                        Ok(json) => Message::Text(json.into()),
                        Err(e) => {
                            warn!(url = %writer_url, error = %e, "failed to encode upstream command");
                            continue;
                        }
                    },
                    Outbound::Audio(frame) => match frame.encode() {
                        Ok(bytes) => Message::Binary(bytes.into()),
                        Err(e) => {
                            warn!(url = %writer_url, error = %e, "dropping unencodable audio frame");
                            continue;
                        }
                    },
                };
                if sink.send(message).await.is_err() {
                    debug!(url = %writer_url, "upstream write failed");
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            debug!(url = %writer_url, "upstream writer finished");
        });

        let reader_url = url.to_string();
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let inbound = match msg {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<UpstreamEvent>(text.as_str()) {
                            Ok(event) => Inbound::Event(event),
                            Err(e) => {
                                debug!(url = %reader_url, error = %e, "ignoring upstream event");
                                continue;
                            }
                        }
                    }
                    Ok(Message::Binary(data)) => match AudioFrame::decode(&data) {
                        Ok(frame) => Inbound::Audio(frame),
                        Err(e) => {
                            warn!(url = %reader_url, error = %e, "dropping malformed audio frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                if in_tx.send(inbound).is_err() {
                    break;
                }
            }
            debug!(url = %reader_url, "upstream reader finished");
        });

        Ok(UpstreamLink {
            tx: out_tx,
            rx: in_rx,
        })
    }
}

// ---------------------------------------------------------------------------
// InProcessConnector
// ---------------------------------------------------------------------------

/// The far side of an in-process link: what the relay sent, and a way to
/// push events back. Dropping `events` simulates connection loss.
#[derive(Debug)]
pub struct UpstreamPeer {
    pub url: String,
    pub commands: flume::Receiver<Outbound>,
    pub events: flume::Sender<Inbound>,
}

impl UpstreamPeer {
    /// `true` once the relay has dropped its side of the link.
    pub fn is_closed(&self) -> bool {
        self.commands.is_disconnected() && self.commands.is_empty()
    }
}

/// Connector backed by channels instead of sockets, for tests and local
/// wiring. Every successful connect hands an [`UpstreamPeer`] to the
/// receiver returned from [`new`](Self::new).
pub struct InProcessConnector {
    peers: flume::Sender<UpstreamPeer>,
    refused: Mutex<HashSet<String>>,
    connects: AtomicUsize,
}

impl InProcessConnector {
    pub fn new() -> (Self, flume::Receiver<UpstreamPeer>) {
        let (peers, rx) = flume::unbounded();
        (
            Self {
                peers,
                refused: Mutex::new(HashSet::new()),
                connects: AtomicUsize::new(0),
            },
            rx,
        )
    }

    /// Make future connects to `url` fail.
    pub fn refuse(&self, url: impl Into<String>) {
        self.refused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.into());
    }

    pub fn allow(&self, url: &str) {
        self.refused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(url);
    }

    /// Successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamConnector for InProcessConnector {
    async fn connect(&self, url: &str) -> Result<UpstreamLink> {
        let refused = self
            .refused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(url);
        if refused {
            return Err(RelayError::Connect {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        let (out_tx, out_rx) = flume::unbounded();
        let (in_tx, in_rx) = flume::unbounded();
        self.peers
            .send(UpstreamPeer {
                url: url.to_string(),
                commands: out_rx,
                events: in_tx,
            })
            .map_err(|_| RelayError::Connect {
                url: url.to_string(),
                reason: "no listener".to_string(),
            })?;
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(UpstreamLink {
            tx: out_tx,
            rx: in_rx,
        })
    }
}
