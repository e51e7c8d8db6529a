use std::sync::Arc;
use std::time::Instant;

use sb_agents::RunOrchestrator;
use sb_relay::{SttRelay, TtsRelay};
use sb_telemetry::metrics::MetricsCollector;

use crate::session::Sessions;

/// Shared state behind every route.
pub struct AppState {
    pub orchestrator: Arc<RunOrchestrator>,
    pub stt: Arc<SttRelay>,
    pub tts: Arc<TtsRelay>,
    pub sessions: Sessions,
    pub metrics: Arc<MetricsCollector>,
    pub started: Instant,
}

impl AppState {
    /// `sessions` must be the same registry the STT relay's transcript
    /// handler looks connections up in.
    pub fn new(
        orchestrator: Arc<RunOrchestrator>,
        stt: Arc<SttRelay>,
        tts: Arc<TtsRelay>,
        sessions: Sessions,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            orchestrator,
            stt,
            tts,
            sessions,
            metrics,
            started: Instant::now(),
        }
    }
}
