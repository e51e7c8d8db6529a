use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sb_agents::RunOrchestrator;
use sb_bridge::{api_router, AppState, SessionTranscripts, Sessions};
use sb_core::config::Config;
use sb_core::presets::PresetTable;
use sb_engine::{Engine, LocalEngine, WorkerPool};
use sb_memory::MemoryRegistry;
use sb_relay::{ReconnectPolicy, SttRelay, TtsRelay, UpstreamConnector, WsConnector};
use sb_telemetry::metrics::MetricsCollector;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::shutdown::ShutdownSignal;

/// The switchboard server.
///
/// Owns every long-lived component and serves the bridge router until the
/// [`ShutdownSignal`] fires.
pub struct Daemon {
    config: Config,
    shutdown: ShutdownSignal,
    state: Arc<AppState>,
}

impl Daemon {
    /// Wire the daemon from config, with upstreams reached over WebSocket.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_connector(config, Arc::new(WsConnector::new()))
    }

    /// Wire the daemon with a custom upstream connector.
    ///
    /// Fails if presets cannot be loaded or the pool cannot be built.
    pub fn with_connector(config: Config, connector: Arc<dyn UpstreamConnector>) -> Result<Self> {
        let presets = PresetTable::load_dir(&config.agents.dir).with_context(|| {
            format!(
                "failed to load agent presets from {}",
                config.agents.dir.display()
            )
        })?;
        info!(agents = ?presets.names(), "agent presets loaded");

        let memory = MemoryRegistry::from_config(&config.memory);
        let engine_cfg = &config.engine;
        let api_key = engine_cfg.api_key();
        let request_timeout = Duration::from_secs(engine_cfg.request_timeout_secs);
        // Workers share one HTTP client; each still runs one generation at a time.
        let engine: Arc<dyn Engine> = Arc::new(
            LocalEngine::new(
                engine_cfg.base_url.clone(),
                engine_cfg.model.clone(),
                api_key,
                request_timeout,
            )
            .context("failed to build inference client")?,
        );
        let pool = WorkerPool::new(config.runtime.pool_size, |_| Arc::clone(&engine))
            .context("failed to build worker pool")?;

        let metrics = Arc::new(MetricsCollector::with_defaults());
        let sessions = Sessions::new();

        let tts = Arc::new(TtsRelay::new(
            config.relay.tts_url.clone(),
            Arc::clone(&connector),
            config.relay.connect_timeout(),
            config.relay.audio_queue,
            Arc::clone(&metrics),
        ));
        let orchestrator = Arc::new(
            RunOrchestrator::new(presets, pool, memory, Arc::clone(&metrics))
                .with_baseline_params(engine_cfg.params.clone())
                .with_timeout(config.runtime.per_request_timeout())
                .with_synthesis(tts.clone()),
        );
        let transcripts = Arc::new(SessionTranscripts::new(
            sessions.clone(),
            Arc::clone(&orchestrator),
        ));
        let stt = Arc::new(
            SttRelay::new(
                connector,
                transcripts,
                config.relay.connect_timeout(),
                Arc::clone(&metrics),
            )
            .with_reconnect(ReconnectPolicy {
                attempts: config.relay.reconnect_attempts,
                backoff: config.relay.reconnect_backoff(),
            }),
        );

        let state = Arc::new(AppState::new(orchestrator, stt, tts, sessions, metrics));
        Ok(Self {
            config,
            shutdown: ShutdownSignal::new(),
            state,
        })
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bind `daemon.host:daemon.port` and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.daemon.host, self.config.daemon.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already-bound listener until shutdown.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr().context("listener has no local address")?;
        let router = api_router(Arc::clone(&self.state));
        let mut server = tokio::spawn(async move { axum::serve(listener, router).await });
        info!(
            %addr,
            pool_size = self.config.runtime.pool_size,
            tts_enabled = self.state.tts.is_enabled(),
            "switchboard listening"
        );

        let outcome = tokio::select! {
            _ = self.shutdown.wait() => Ok(()),
            joined = &mut server => match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::Error::new(e).context("API server error")),
                Err(e) => Err(anyhow::Error::new(e).context("API server task failed")),
            },
        };
        if let Err(e) = &outcome {
            error!(error = %e, "server stopped unexpectedly");
        }

        self.drain().await;
        server.abort();
        info!("daemon stopped");
        outcome
    }

    /// Interrupt active runs, close the pool and drop every upstream.
    async fn drain(&self) {
        info!(active_runs = self.state.orchestrator.active_count(), "draining");
        self.state.orchestrator.shutdown();
        self.state.stt.shutdown().await;
        self.state.tts.shutdown().await;
    }
}
