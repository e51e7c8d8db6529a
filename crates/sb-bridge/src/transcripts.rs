use std::sync::Arc;

use sb_agents::{ChatRequest, RunOrchestrator};
use sb_core::types::ClientId;
use sb_relay::{Route, Transcript, TranscriptHandler};
use tracing::{debug, warn};

use crate::protocol::ServerMessage;
use crate::session::Sessions;

/// Turns routed transcriptions into runs on the owning connection.
pub struct SessionTranscripts {
    sessions: Sessions,
    orchestrator: Arc<RunOrchestrator>,
}

impl SessionTranscripts {
    pub fn new(sessions: Sessions, orchestrator: Arc<RunOrchestrator>) -> Self {
        Self {
            sessions,
            orchestrator,
        }
    }
}

impl TranscriptHandler for SessionTranscripts {
    fn on_transcript(&self, url: &str, route: &Route, transcript: Transcript) {
        let Some(session) = self.sessions.get(&route.owner) else {
            warn!(url, client_id = %transcript.client_id, "transcript for closed connection, dropping");
            return;
        };
        debug!(
            url,
            client_id = %transcript.client_id,
            agent = %route.agent,
            duration = transcript.duration,
            "transcript triggers run"
        );
        let request = ChatRequest {
            agent: route.agent.clone(),
            text: transcript.text,
            thread_id: route.thread_id.clone(),
        };
        // Rejections are reported to the session by the orchestrator.
        let _ = self.orchestrator.submit(session.run_target(), request);
    }

    fn on_upstream_lost(&self, url: &str, routes: Vec<(ClientId, Route)>) {
        for (client_id, route) in routes {
            if let Some(session) = self.sessions.get(&route.owner) {
                session.send(ServerMessage::SttLeft {
                    stt_url: url.to_string(),
                    client_id: client_id.to_string(),
                });
            }
        }
    }
}
