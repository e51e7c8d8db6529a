use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use sb_agents::{RunSlot, RunTarget, RunUpdate};
use sb_core::types::{ClientId, ConnectionId};
use tracing::warn;

use crate::protocol::ServerMessage;

/// Non-run traffic queued for a client socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Message(ServerMessage),
    /// An encoded audio frame.
    Audio(Vec<u8>),
}

/// One client WebSocket connection.
///
/// Run events and everything else travel on separate channels so the
/// orchestrator can hold a plain `RunUpdate` sender.
pub struct Session {
    pub id: ConnectionId,
    pub slot: RunSlot,
    updates: flume::Sender<RunUpdate>,
    outgoing: flume::Sender<Outgoing>,
    tts_client: Mutex<Option<ClientId>>,
}

impl Session {
    pub fn new(updates: flume::Sender<RunUpdate>, outgoing: flume::Sender<Outgoing>) -> Self {
        Self {
            id: ConnectionId::new(),
            slot: RunSlot::new(),
            updates,
            outgoing,
            tts_client: Mutex::new(None),
        }
    }

    /// Where runs started on behalf of this connection report.
    pub fn run_target(&self) -> RunTarget {
        RunTarget {
            connection: self.id,
            slot: self.slot.clone(),
            updates: self.updates.clone(),
            synthesis_target: self.tts_client(),
        }
    }

    pub fn send(&self, message: ServerMessage) {
        if self.outgoing.send(Outgoing::Message(message)).is_err() {
            tracing::debug!(connection = %self.id, "session closed, dropping message");
        }
    }

    pub fn send_audio(&self, frame: Vec<u8>) -> bool {
        self.outgoing.send(Outgoing::Audio(frame)).is_ok()
    }

    /// Client id this connection has joined to synthesis, if any.
    pub fn tts_client(&self) -> Option<ClientId> {
        self.tts_lock().clone()
    }

    pub fn set_tts_client(&self, client: ClientId) {
        *self.tts_lock() = Some(client);
    }

    /// Forget `client` if it is the current synthesis target.
    pub fn clear_tts_client(&self, client: &ClientId) {
        let mut current = self.tts_lock();
        if current.as_ref() == Some(client) {
            *current = None;
        }
    }

    fn tts_lock(&self) -> MutexGuard<'_, Option<ClientId>> {
        self.tts_client.lock().unwrap_or_else(|e| {
            warn!("session lock was poisoned, recovering");
            e.into_inner()
        })
    }
}

/// Live sessions by connection id, shared between the socket handlers and
/// the transcript router.
#[derive(Clone, Default)]
pub struct Sessions {
    inner: Arc<DashMap<ConnectionId, Arc<Session>>>,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.inner.insert(session.id, session);
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Session>> {
        self.inner.get(id).map(|s| Arc::clone(s.value()))
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Session>> {
        self.inner.remove(id).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
