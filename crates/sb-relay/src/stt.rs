use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use sb_core::types::{ClientId, ConnectionId, ThreadId};
use sb_telemetry::metrics::{names, MetricsCollector};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::AudioFrame;
use crate::error::{RelayError, Result};
use crate::transport::{Inbound, Outbound, UpstreamCommand, UpstreamConnector, UpstreamEvent};

/// What a transcription for a client id should trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub agent: String,
    pub thread_id: Option<ThreadId>,
    /// Connection that registered the route and receives the resulting run.
    pub owner: ConnectionId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub client_id: ClientId,
    pub text: String,
    pub duration: f64,
}

/// Receives routed transcriptions. Called from the upstream's reader task,
/// one transcript at a time in arrival order.
pub trait TranscriptHandler: Send + Sync {
    fn on_transcript(&self, url: &str, route: &Route, transcript: Transcript);

    /// The upstream at `url` went away and took these routes with it.
    fn on_upstream_lost(&self, _url: &str, _routes: Vec<(ClientId, Route)>) {}
}

struct Upstream {
    generation: u64,
    tx: flume::Sender<Outbound>,
    routes: HashMap<ClientId, Route>,
    pump: JoinHandle<()>,
    /// Set while the pump is re-establishing a lost link.
    reconnecting: bool,
}

impl Upstream {
    /// Dropping `tx` closes the link.
    fn close(self, url: &str) {
        self.pump.abort();
        info!(url, "stt upstream closed");
    }
}

#[derive(Default)]
struct SttState {
    upstreams: HashMap<String, Upstream>,
    /// Per-URL gates so concurrent subscribers wait on a single connect.
    connecting: HashMap<String, Arc<Mutex<()>>>,
    next_generation: u64,
    closed: bool,
}

/// How a lost upstream is re-established before its routes are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub attempts: u32,
    /// Delay before the first attempt; doubles for each further attempt.
    pub backoff: Duration,
}

impl ReconnectPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 0,
            backoff: Duration::ZERO,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(6))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Shares one transcription upstream per URL among every client id routed
/// through it.
///
/// A connection exists exactly while at least one route references it.
/// Connects happen outside the bookkeeping lock, so a slow upstream only
/// delays the subscribers of its own URL. A lost link is re-established
/// per [`ReconnectPolicy`] and every live route is subscribed again.
pub struct SttRelay {
    connector: Arc<dyn UpstreamConnector>,
    handler: Arc<dyn TranscriptHandler>,
    connect_timeout: Duration,
    reconnect: ReconnectPolicy,
    metrics: Arc<MetricsCollector>,
    state: Arc<Mutex<SttState>>,
}

impl SttRelay {
    pub fn new(
        connector: Arc<dyn UpstreamConnector>,
        handler: Arc<dyn TranscriptHandler>,
        connect_timeout: Duration,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            connector,
            handler,
            connect_timeout,
            reconnect: ReconnectPolicy::default(),
            metrics,
            state: Arc::new(Mutex::new(SttState::default())),
        }
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Route transcriptions for `client_id` on `url` to `route`, connecting
    /// first if needed. The owner of an already-routed client id may rebind
    /// it; any other connection gets [`RelayError::ClientIdInUse`].
    pub async fn subscribe(&self, url: &str, client_id: ClientId, route: Route) -> Result<()> {
        let gate = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(RelayError::Closed);
            }
            if state.upstreams.contains_key(url) {
                return self.add_route(&mut state, url, client_id, route);
            }
            Arc::clone(state.connecting.entry(url.to_string()).or_default())
        };

        let connecting = gate.lock().await;
        let result = self.connect_and_add(url, client_id, route).await;
        drop(connecting);

        let mut state = self.state.lock().await;
        // Map plus this handle: nobody else is waiting on the gate.
        if Arc::strong_count(&gate) <= 2 {
            state.connecting.remove(url);
        }
        result
    }

    async fn connect_and_add(&self, url: &str, client_id: ClientId, route: Route) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(RelayError::Closed);
            }
            // Another subscriber connected while this one waited.
            if state.upstreams.contains_key(url) {
                return self.add_route(&mut state, url, client_id, route);
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
        if !state.upstreams.contains_key(url) {
            state.next_generation += 1;
            let generation = state.next_generation;
            let pump = tokio::spawn(pump(
                Pump {
                    url: url.to_string(),
                    generation,
                    state: Arc::downgrade(&self.state),
                    handler: Arc::clone(&self.handler),
                    connector: Arc::clone(&self.connector),
                    connect_timeout: self.connect_timeout,
                    reconnect: self.reconnect,
                    metrics: Arc::clone(&self.metrics),
                },
                link.rx,
            ));
            info!(url, generation, "stt upstream connected");
            state.upstreams.insert(
                url.to_string(),
                Upstream {
                    generation,
                    tx: link.tx,
                    routes: HashMap::new(),
                    pump,
                    reconnecting: false,
                },
            );
        }
        self.add_route(state, url, client_id, route)
    }

    /// Register the route on the live upstream for `url`. An upstream left
    /// without routes by a failure here is closed.
    fn add_route(
        &self,
        state: &mut SttState,
        url: &str,
        client_id: ClientId,
        route: Route,
    ) -> Result<()> {
        let upstream = state
            .upstreams
            .get_mut(url)
            .ok_or_else(|| RelayError::Disconnected(url.to_string()))?;
        if upstream
            .routes
            .get(&client_id)
            .is_some_and(|existing| existing.owner != route.owner)
        {
            return Err(RelayError::ClientIdInUse(client_id.to_string()));
        }

        let sent = upstream
            .tx
            .send(Outbound::Command(UpstreamCommand::SubscribeTranscripts {
                client_id: client_id.clone(),
            }))
            .is_ok();
        // While reconnecting, the route is replayed on the new link.
        if !sent && !upstream.reconnecting {
            if upstream.routes.is_empty() {
                if let Some(dead) = state.upstreams.remove(url) {
                    dead.pump.abort();
                }
            }
            self.metrics
                .set_gauge(names::STT_UPSTREAMS, state.upstreams.len() as i64);
            return Err(RelayError::Disconnected(url.to_string()));
        }

        if upstream.routes.insert(client_id.clone(), route).is_some() {
            debug!(url, client_id = %client_id, "stt route rebound");
        } else {
            debug!(url, client_id = %client_id, routes = upstream.routes.len(), "stt route added");
        }
        self.metrics
            .set_gauge(names::STT_UPSTREAMS, state.upstreams.len() as i64);
        Ok(())
    }

    /// Drop `owner`'s route for `client_id` on `url`; the upstream closes
    /// with its last route.
    pub async fn unsubscribe(
        &self,
        url: &str,
        client_id: &ClientId,
        owner: ConnectionId,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let not_subscribed = || RelayError::NotSubscribed {
            url: url.to_string(),
            client_id: client_id.to_string(),
        };
        let upstream = state.upstreams.get_mut(url).ok_or_else(not_subscribed)?;
        let route = upstream.routes.get(client_id).ok_or_else(not_subscribed)?;
        if route.owner != owner {
            return Err(RelayError::ClientIdInUse(client_id.to_string()));
        }
        upstream.routes.remove(client_id);
        let _ = upstream
            .tx
            .send(Outbound::Command(UpstreamCommand::UnsubscribeTranscripts {
                client_id: client_id.clone(),
            }));
        debug!(url, client_id = %client_id, "stt route removed");

        if upstream.routes.is_empty() {
            if let Some(upstream) = state.upstreams.remove(url) {
                upstream.close(url);
            }
            self.metrics
                .set_gauge(names::STT_UPSTREAMS, state.upstreams.len() as i64);
        }
        Ok(())
    }

    /// Remove every route owned by `owner`. Returns what was removed.
    pub async fn unsubscribe_owner(&self, owner: ConnectionId) -> Vec<(String, ClientId)> {
        let mut state = self.state.lock().await;
        let mut removed = Vec::new();
        for (url, upstream) in state.upstreams.iter_mut() {
            upstream.routes.retain(|client_id, route| {
                if route.owner != owner {
                    return true;
                }
                let _ = upstream
                    .tx
                    .send(Outbound::Command(UpstreamCommand::UnsubscribeTranscripts {
                        client_id: client_id.clone(),
                    }));
                removed.push((url.clone(), client_id.clone()));
                false
            });
        }

        let empty: Vec<String> = state
            .upstreams
            .iter()
            .filter(|(_, u)| u.routes.is_empty())
            .map(|(url, _)| url.clone())
            .collect();
        for url in empty {
            if let Some(upstream) = state.upstreams.remove(&url) {
                upstream.close(&url);
            }
        }
        self.metrics
            .set_gauge(names::STT_UPSTREAMS, state.upstreams.len() as i64);
        if !removed.is_empty() {
            debug!(owner = %owner, routes = removed.len(), "stt routes released");
        }
        removed
    }

    /// Forward audio to every upstream `frame.client_id` is routed through
    /// for `owner`. Returns the number of upstreams reached.
    pub async fn relay_audio(&self, owner: ConnectionId, frame: AudioFrame) -> usize {
        let state = self.state.lock().await;
        let mut sent = 0usize;
        for upstream in state.upstreams.values() {
            let owned = upstream
                .routes
                .get(&frame.client_id)
                .is_some_and(|r| r.owner == owner);
            if owned && upstream.tx.send(Outbound::Audio(frame.clone())).is_ok() {
                sent += 1;
            }
        }
        if sent == 0 {
            debug!(client_id = %frame.client_id, "dropping audio for unsubscribed client");
        } else {
            self.metrics.increment_counter_by(
                names::RELAY_AUDIO_FRAMES_TOTAL,
                &[("direction", "upstream")],
                sent as u64,
            );
        }
        sent
    }

    pub async fn upstream_count(&self) -> usize {
        self.state.lock().await.upstreams.len()
    }

    /// Routes registered on `url`; zero when there is no connection.
    pub async fn route_count(&self, url: &str) -> usize {
        self.state
            .lock()
            .await
            .upstreams
            .get(url)
            .map_or(0, |u| u.routes.len())
    }

    pub async fn is_subscribed(&self, url: &str, client_id: &ClientId) -> bool {
        self.state
            .lock()
            .await
            .upstreams
            .get(url)
            .is_some_and(|u| u.routes.contains_key(client_id))
    }

    /// Close every upstream.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.connecting.clear();
        for (url, upstream) in state.upstreams.drain() {
            upstream.close(&url);
        }
        self.metrics.set_gauge(names::STT_UPSTREAMS, 0);
    }
}

struct Pump {
    url: String,
    generation: u64,
    state: Weak<Mutex<SttState>>,
    handler: Arc<dyn TranscriptHandler>,
    connector: Arc<dyn UpstreamConnector>,
    connect_timeout: Duration,
    reconnect: ReconnectPolicy,
    metrics: Arc<MetricsCollector>,
}

/// Reader task for one upstream: routes transcripts, re-establishes the
/// link when it drops, and gives the routes up once reconnecting fails.
async fn pump(ctx: Pump, mut rx: flume::Receiver<Inbound>) {
    loop {
        if !ctx.route_transcripts(&rx).await {
            return;
        }
        match ctx.reconnect().await {
            Some(next) => rx = next,
            None => break,
        }
    }
    ctx.give_up().await;
}

impl Pump {
    /// Returns `false` once the relay itself is gone.
    async fn route_transcripts(&self, rx: &flume::Receiver<Inbound>) -> bool {
        let url = &self.url;
        while let Ok(inbound) = rx.recv_async().await {
            let (text, duration, client_id) = match inbound {
                Inbound::Event(UpstreamEvent::Transcription {
                    text,
                    duration,
                    client_id,
                }) => (text, duration, client_id),
                Inbound::Audio(frame) => {
                    debug!(url = %url, client_id = %frame.client_id, "ignoring audio from stt upstream");
                    continue;
                }
            };

            let Some(shared) = self.state.upgrade() else {
                return false;
            };
            let route = {
                let state = shared.lock().await;
                state
                    .upstreams
                    .get(url)
                    .filter(|u| u.generation == self.generation)
                    .and_then(|u| u.routes.get(&client_id).cloned())
            };
            match route {
                Some(route) => {
                    self.metrics
                        .increment_counter(names::RELAY_TRANSCRIPTS_TOTAL, &[("routed", "true")]);
                    debug!(url = %url, client_id = %client_id, agent = %route.agent, "routing transcript");
                    self.handler.on_transcript(
                        url,
                        &route,
                        Transcript {
                            client_id,
                            text,
                            duration,
                        },
                    );
                }
                None => {
                    self.metrics
                        .increment_counter(names::RELAY_TRANSCRIPTS_TOTAL, &[("routed", "false")]);
                    warn!(url = %url, client_id = %client_id, "no route for transcript, dropping");
                }
            }
        }
        true
    }

    /// Reconnect with exponential backoff and resubscribe every live route.
    /// `None` when attempts run out or the upstream was closed meanwhile.
    async fn reconnect(&self) -> Option<flume::Receiver<Inbound>> {
        let url = self.url.as_str();
        for attempt in 1..=self.reconnect.attempts {
            {
                let shared = self.state.upgrade()?;
                let mut state = shared.lock().await;
                let upstream = state
                    .upstreams
                    .get_mut(url)
                    .filter(|u| u.generation == self.generation)?;
                upstream.reconnecting = true;
            }
            let delay = self.reconnect.delay(attempt);
            warn!(
                url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "stt upstream lost, reconnecting"
            );
            tokio::time::sleep(delay).await;

            let attempt_connect =
                tokio::time::timeout(self.connect_timeout, self.connector.connect(url));
            let link = match attempt_connect.await {
                Ok(Ok(link)) => link,
                Ok(Err(e)) => {
                    warn!(url, attempt, error = %e, "stt reconnect failed");
                    self.metrics
                        .increment_counter(names::STT_RECONNECTS_TOTAL, &[("result", "failed")]);
                    continue;
                }
                Err(_) => {
                    warn!(url, attempt, "stt reconnect timed out");
                    self.metrics
                        .increment_counter(names::STT_RECONNECTS_TOTAL, &[("result", "failed")]);
                    continue;
                }
            };

            let shared = self.state.upgrade()?;
            let mut state = shared.lock().await;
            let upstream = state
                .upstreams
                .get_mut(url)
                .filter(|u| u.generation == self.generation)?;
            for client_id in upstream.routes.keys() {
                let _ = link
                    .tx
                    .send(Outbound::Command(UpstreamCommand::SubscribeTranscripts {
                        client_id: client_id.clone(),
                    }));
            }
            upstream.tx = link.tx;
            upstream.reconnecting = false;
            self.metrics
                .increment_counter(names::STT_RECONNECTS_TOTAL, &[("result", "ok")]);
            info!(url, attempt, routes = upstream.routes.len(), "stt upstream reconnected");
            return Some(link.rx);
        }
        None
    }

    /// Remove the upstream and report its routes as lost.
    async fn give_up(&self) {
        let Some(shared) = self.state.upgrade() else {
            return;
        };
        let mut state = shared.lock().await;
        let current = state
            .upstreams
            .get(&self.url)
            .is_some_and(|u| u.generation == self.generation);
        if !current {
            return;
        }
        if let Some(upstream) = state.upstreams.remove(&self.url) {
            warn!(url = %self.url, routes = upstream.routes.len(), "stt upstream lost");
            self.metrics
                .set_gauge(names::STT_UPSTREAMS, state.upstreams.len() as i64);
            drop(state);
            self.handler
                .on_upstream_lost(&self.url, upstream.routes.into_iter().collect());
        }
    }
}
