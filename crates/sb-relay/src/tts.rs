use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use sb_agents::{SynthesisError, SynthesisSink};
use sb_core::types::{ClientId, ConnectionId};
use sb_telemetry::metrics::{names, MetricsCollector};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::transport::{Inbound, Outbound, UpstreamCommand, UpstreamConnector};

/// What a joined client receives from synthesis, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum TtsOutput {
    Audio(Vec<u8>),
    /// Synthesis was stopped; queued audio has been discarded.
    Stop,
}

struct TtsClient {
    owner: ConnectionId,
    tx: flume::Sender<TtsOutput>,
    // Kept to drain undelivered audio on stop.
    rx: flume::Receiver<TtsOutput>,
}

struct TtsLink {
    generation: u64,
    tx: flume::Sender<Outbound>,
    pump: JoinHandle<()>,
}

#[derive(Default)]
struct TtsState {
    link: Option<TtsLink>,
    clients: HashMap<ClientId, TtsClient>,
    next_generation: u64,
    closed: bool,
}

/// Fans text from many runs into one synthesis upstream and routes the
/// resulting audio back to exactly the client it was made for.
///
/// The upstream connection lives while at least one client is joined. Each
/// client gets a bounded audio queue; a full queue drops audio for that
/// client only. The connect itself runs outside the state lock, so audio
/// keeps flowing to joined clients while a first join is connecting.
pub struct TtsRelay {
    url: Option<String>,
    connector: Arc<dyn UpstreamConnector>,
    connect_timeout: Duration,
    audio_queue: usize,
    metrics: Arc<MetricsCollector>,
    state: Arc<Mutex<TtsState>>,
    connect_gate: Mutex<()>,
}

impl TtsRelay {
    /// `url` of `None` disables synthesis; every join then fails with
    /// `TTS_DISABLED`.
    pub fn new(
        url: Option<String>,
        connector: Arc<dyn UpstreamConnector>,
        connect_timeout: Duration,
        audio_queue: usize,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            url,
            connector,
            connect_timeout,
            audio_queue: audio_queue.max(1),
            metrics,
            state: Arc::new(Mutex::new(TtsState::default())),
            connect_gate: Mutex::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    /// Join `client_id` to synthesis and return its audio queue. The owner
    /// may rejoin to replace its queue; any other connection gets
    /// [`RelayError::ClientIdInUse`].
    pub async fn join(
        &self,
        client_id: ClientId,
        owner: ConnectionId,
        voice: Option<String>,
        speed: Option<f32>,
    ) -> Result<flume::Receiver<TtsOutput>> {
        let url = self.url.as_deref().ok_or(RelayError::TtsDisabled)?;
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(RelayError::Closed);
            }
            if state.link.is_some() {
                return self.add_client(&mut state, url, client_id, owner, voice, speed);
            }
        }

        let _connecting = self.connect_gate.lock().await;
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(RelayError::Closed);
            }
            // Another join connected while this one waited.
            if state.link.is_some() {
                return self.add_client(&mut state, url, client_id, owner, voice, speed);
            }
        }

        let link = tokio::time::timeout(self.connect_timeout, self.connector.connect(url))
            .await
            .map_err(|_| RelayError::ConnectTimeout(url.to_string()))??;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.closed {
            return Err(RelayError::Closed);
        }
        if state.link.is_none() {
            state.next_generation += 1;
            let generation = state.next_generation;
            let pump = tokio::spawn(pump(
                url.to_string(),
                generation,
                link.rx,
                Arc::downgrade(&self.state),
                Arc::clone(&self.metrics),
            ));
            info!(url, generation, "tts upstream connected");
            state.link = Some(TtsLink {
                generation,
                tx: link.tx,
                pump,
            });
        }
        self.add_client(state, url, client_id, owner, voice, speed)
    }

    fn add_client(
        &self,
        state: &mut TtsState,
        url: &str,
        client_id: ClientId,
        owner: ConnectionId,
        voice: Option<String>,
        speed: Option<f32>,
    ) -> Result<flume::Receiver<TtsOutput>> {
        if state
            .clients
            .get(&client_id)
            .is_some_and(|existing| existing.owner != owner)
        {
            return Err(RelayError::ClientIdInUse(client_id.to_string()));
        }

        if voice.is_some() || speed.is_some() {
            let configure = UpstreamCommand::TtsConfigureClient {
                client_id: client_id.clone(),
                voice,
                speed,
            };
            let sent = state
                .link
                .as_ref()
                .is_some_and(|l| l.tx.send(Outbound::Command(configure)).is_ok());
            if !sent {
                if state.clients.is_empty() {
                    if let Some(link) = state.link.take() {
                        link.pump.abort();
                    }
                }
                return Err(RelayError::Disconnected(url.to_string()));
            }
        }

        let (tx, rx) = flume::bounded(self.audio_queue);
        let replaced = state
            .clients
            .insert(
                client_id.clone(),
                TtsClient {
                    owner,
                    tx,
                    rx: rx.clone(),
                },
            )
            .is_some();
        debug!(client_id = %client_id, replaced, "tts client joined");
        self.metrics
            .set_gauge(names::TTS_SUBSCRIBERS, state.clients.len() as i64);
        Ok(rx)
    }

    /// Remove `owner`'s `client_id`; the upstream closes with the last
    /// client.
    pub async fn leave(&self, client_id: &ClientId, owner: ConnectionId) -> Result<()> {
        let mut state = self.state.lock().await;
        let client = state
            .clients
            .get(client_id)
            .ok_or_else(|| RelayError::NotJoined(client_id.to_string()))?;
        if client.owner != owner {
            return Err(RelayError::ClientIdInUse(client_id.to_string()));
        }
        state.clients.remove(client_id);
        debug!(client_id = %client_id, "tts client left");
        self.after_leave(&mut state);
        Ok(())
    }

    /// Remove every client joined by `owner`. Returns the removed ids.
    pub async fn leave_owner(&self, owner: ConnectionId) -> Vec<ClientId> {
        let mut state = self.state.lock().await;
        let ids: Vec<ClientId> = state
            .clients
            .iter()
            .filter(|(_, c)| c.owner == owner)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            state.clients.remove(id);
        }
        if !ids.is_empty() {
            debug!(owner = %owner, clients = ids.len(), "tts clients released");
            self.after_leave(&mut state);
        }
        ids
    }

    fn after_leave(&self, state: &mut TtsState) {
        if state.clients.is_empty() {
            if let Some(link) = state.link.take() {
                link.pump.abort();
                info!("tts upstream closed");
            }
        }
        self.metrics
            .set_gauge(names::TTS_SUBSCRIBERS, state.clients.len() as i64);
    }

    /// Forward a text chunk for `client_id` to the synthesis upstream.
    pub async fn speak(&self, client_id: &ClientId, chunk: &str, is_final: bool) -> Result<()> {
        let state = self.state.lock().await;
        if !state.clients.contains_key(client_id) {
            return Err(RelayError::NotJoined(client_id.to_string()));
        }
        let link = state.link.as_ref().ok_or_else(|| self.disconnected())?;
        link.tx
            .send(Outbound::Command(UpstreamCommand::TtsTextChunk {
                chunk: chunk.to_string(),
                target_client_id: client_id.clone(),
                is_final,
            }))
            .map_err(|_| self.disconnected())
    }

    /// Stop synthesis for `client_id`: tell the upstream, discard audio not
    /// yet delivered, then queue a [`TtsOutput::Stop`].
    pub async fn stop(&self, client_id: &ClientId) -> Result<()> {
        let state = self.state.lock().await;
        let client = state
            .clients
            .get(client_id)
            .ok_or_else(|| RelayError::NotJoined(client_id.to_string()))?;
        if let Some(link) = &state.link {
            let _ = link
                .tx
                .send(Outbound::Command(UpstreamCommand::StopGeneration {
                    client_id: client_id.clone(),
                }));
        }
        let dropped = client.rx.drain().count();
        // Cannot be full right after the drain.
        let _ = client.tx.try_send(TtsOutput::Stop);
        debug!(client_id = %client_id, dropped, "tts stopped");
        Ok(())
    }

    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.link.is_some()
    }

    /// Drop every client and close the upstream.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.clients.clear();
        self.after_leave(&mut state);
    }

    fn disconnected(&self) -> RelayError {
        RelayError::Disconnected(self.url.clone().unwrap_or_default())
    }
}

#[async_trait]
impl SynthesisSink for TtsRelay {
    async fn speak(
        &self,
        client: &ClientId,
        chunk: &str,
        is_final: bool,
    ) -> std::result::Result<(), SynthesisError> {
        TtsRelay::speak(self, client, chunk, is_final)
            .await
            .map_err(into_synthesis_error)
    }

    async fn stop(&self, client: &ClientId) -> std::result::Result<(), SynthesisError> {
        TtsRelay::stop(self, client)
            .await
            .map_err(into_synthesis_error)
    }
}

fn into_synthesis_error(err: RelayError) -> SynthesisError {
    match err {
        RelayError::NotJoined(client) => SynthesisError::NotJoined(client),
        other => SynthesisError::Unavailable(other.to_string()),
    }
}

/// Reader loop for the synthesis upstream: audio frames go to the queue of
/// the client they are tagged with.
async fn pump(
    url: String,
    generation: u64,
    rx: flume::Receiver<Inbound>,
    state: Weak<Mutex<TtsState>>,
    metrics: Arc<MetricsCollector>,
) {
    while let Ok(inbound) = rx.recv_async().await {
        let frame = match inbound {
            Inbound::Audio(frame) => frame,
            Inbound::Event(event) => {
                debug!(url = %url, ?event, "ignoring event from tts upstream");
                continue;
            }
        };
        let Some(shared) = state.upgrade() else {
            return;
        };
        let guard = shared.lock().await;
        match guard.clients.get(&frame.client_id) {
            Some(client) => match client.tx.try_send(TtsOutput::Audio(frame.audio)) {
                Ok(()) => metrics.increment_counter(
                    names::RELAY_AUDIO_FRAMES_TOTAL,
                    &[("direction", "downstream")],
                ),
                Err(flume::TrySendError::Full(_)) => {
                    warn!(client_id = %frame.client_id, "tts audio queue full, dropping frame");
                }
                Err(flume::TrySendError::Disconnected(_)) => {
                    debug!(client_id = %frame.client_id, "tts client queue closed");
                }
            },
            None => {
                warn!(url = %url, client_id = %frame.client_id, "no tts client for audio, dropping");
            }
        }
    }

    let Some(shared) = state.upgrade() else {
        return;
    };
    let mut guard = shared.lock().await;
    if guard
        .link
        .as_ref()
        .is_some_and(|l| l.generation == generation)
    {
        guard.link = None;
        let clients = guard.clients.len();
        guard.clients.clear();
        metrics.set_gauge(names::TTS_SUBSCRIBERS, 0);
        warn!(url = %url, clients, "tts upstream lost");
    }
}
