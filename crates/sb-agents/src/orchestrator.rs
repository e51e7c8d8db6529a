use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::StreamExt;
use sb_core::presets::{AgentPreset, PresetTable};
use sb_core::types::{ClientId, ConnectionId, GenerationParams, InterruptReason, RunId, ThreadId};
use sb_engine::{ChatMessage, GenerationRequest, PoolError, WorkerPool};
use sb_memory::{MemoryRegistry, MemoryStrategy};
use sb_telemetry::metrics::{names, MetricsCollector};
use serde::Serialize;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::RunError;
use crate::events::RunUpdate;
use crate::run::Run;
use crate::slot::{CancelRx, RunSlot};
use crate::state_machine::RunEvent;
use crate::synthesis::SynthesisSink;

// ---------------------------------------------------------------------------
// Request / target types
// ---------------------------------------------------------------------------

/// A conversational request as received from a client or the STT relay.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub agent: String,
    pub text: String,
    pub thread_id: Option<ThreadId>,
}

impl ChatRequest {
    pub fn new(agent: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            text: text.into(),
            thread_id: None,
        }
    }

    pub fn with_thread(mut self, thread: impl Into<ThreadId>) -> Self {
        self.thread_id = Some(thread.into());
        self
    }
}

/// Where a run's events go and which slot it occupies.
#[derive(Debug, Clone)]
pub struct RunTarget {
    pub connection: ConnectionId,
    pub slot: RunSlot,
    pub updates: flume::Sender<RunUpdate>,
    /// Client id joined to speech synthesis on this connection, if any.
    pub synthesis_target: Option<ClientId>,
}

/// Snapshot of an active run for status reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: RunId,
    pub connection: ConnectionId,
    pub agent: String,
    pub started_at: DateTime<Utc>,
}

struct ActiveEntry {
    slot: RunSlot,
    summary: RunSummary,
}

enum RunOutcome {
    Done,
    Interrupted(InterruptReason),
    Failed(RunError),
}

impl RunOutcome {
    fn label(&self) -> &'static str {
        match self {
            RunOutcome::Done => "done",
            RunOutcome::Interrupted(_) => "interrupted",
            RunOutcome::Failed(_) => "error",
        }
    }
}

/// What a driver waits on at each suspension point.
enum Step<T> {
    Ready(T),
    Stop(InterruptReason),
}

// ---------------------------------------------------------------------------
// RunOrchestrator
// ---------------------------------------------------------------------------

/// Binds requests to workers under each agent's policy.
///
/// [`submit`](Self::submit) validates synchronously and spawns one driver
/// task per accepted run. All outcomes, including pre-flight rejections, are
/// reported on the target's update channel.
pub struct RunOrchestrator {
    presets: PresetTable,
    pool: WorkerPool,
    memory: MemoryRegistry,
    baseline: GenerationParams,
    timeout: Option<Duration>,
    synthesis: Option<Arc<dyn SynthesisSink>>,
    metrics: Arc<MetricsCollector>,
    active: DashMap<RunId, ActiveEntry>,
    closed: AtomicBool,
}

impl RunOrchestrator {
    pub fn new(
        presets: PresetTable,
        pool: WorkerPool,
        memory: MemoryRegistry,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            presets,
            pool,
            memory,
            baseline: GenerationParams::default(),
            timeout: None,
            synthesis: None,
            metrics,
            active: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Engine-wide sampling defaults; presets override per field.
    pub fn with_baseline_params(mut self, params: GenerationParams) -> Self {
        self.baseline = params;
        self
    }

    /// Bound on worker wait plus generation. `None` disables it.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn with_synthesis(mut self, sink: Arc<dyn SynthesisSink>) -> Self {
        self.synthesis = Some(sink);
        self
    }

    pub fn presets(&self) -> &PresetTable {
        &self.presets
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn active_runs(&self) -> Vec<RunSummary> {
        self.active.iter().map(|e| e.summary.clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Interrupt every active run with reason `shutdown`, then close the pool.
    /// New submissions are rejected from here on.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut interrupted = 0usize;
        for entry in self.active.iter() {
            if entry.slot.interrupt(InterruptReason::Shutdown).is_some() {
                interrupted += 1;
            }
        }
        self.pool.close();
        info!(interrupted, "orchestrator shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // -- Submission ---------------------------------------------------------

    /// Validate `request` and start a run on `target`.
    ///
    /// Pre-flight checks, in order: agent exists, thread id present when the
    /// agent's memory policy needs one, text non-empty, connection idle. A
    /// rejection sends one `Error` without a run id and touches nothing else.
    pub fn submit(
        self: &Arc<Self>,
        target: RunTarget,
        request: ChatRequest,
    ) -> Result<RunId, RunError> {
        match self.preflight(&target, request) {
            Ok((run, strategy, cancel)) => {
                let run_id = run.id;
                let span = tracing::info_span!("run", run_id = %run_id, agent = %run.agent.name);
                let this = Arc::clone(self);
                tokio::spawn(this.drive(run, strategy, target, cancel).instrument(span));
                Ok(run_id)
            }
            Err(err) => {
                debug!(code = %err.code(), error = %err, "request rejected");
                self.metrics
                    .increment_counter(names::RUN_ERRORS_TOTAL, &[("code", err.code().as_str())]);
                let _ = target.updates.send(RunUpdate::Error {
                    run_id: None,
                    code: err.code(),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn preflight(
        &self,
        target: &RunTarget,
        request: ChatRequest,
    ) -> Result<(Run, Arc<dyn MemoryStrategy>, CancelRx), RunError> {
        if self.is_shut_down() {
            return Err(RunError::ShuttingDown);
        }

        let preset = self
            .presets
            .get(&request.agent)
            .ok_or_else(|| RunError::AgentInvalid(request.agent.trim().to_string()))?;

        let strategy =
            self.memory
                .get(preset.memory_policy)
                .ok_or_else(|| RunError::MemoryUnavailable {
                    agent: preset.name.clone(),
                    policy: preset.memory_policy.to_string(),
                })?;

        let thread = request
            .thread_id
            .filter(|t| !t.as_str().trim().is_empty());
        if strategy.requires_thread() && thread.is_none() {
            return Err(RunError::ThreadRequired(preset.name.clone()));
        }

        let text = request.text.trim();
        if text.is_empty() {
            return Err(RunError::Empty);
        }

        let run = Run::new(target.connection, preset, text, thread);
        let cancel = target.slot.try_claim(run.id).ok_or(RunError::Busy)?;
        self.active.insert(
            run.id,
            ActiveEntry {
                slot: target.slot.clone(),
                summary: RunSummary {
                    run_id: run.id,
                    connection: run.connection,
                    agent: run.agent.name.clone(),
                    started_at: run.started_at,
                },
            },
        );
        // A shutdown that raced past the check above must still reach this run.
        if self.is_shut_down() {
            target.slot.interrupt(InterruptReason::Shutdown);
        }
        Ok((run, strategy, cancel))
    }

    // -- Driver -------------------------------------------------------------

    async fn drive(
        self: Arc<Self>,
        mut run: Run,
        strategy: Arc<dyn MemoryStrategy>,
        target: RunTarget,
        mut cancel: CancelRx,
    ) {
        let started = Instant::now();
        info!(thread = ?run.thread.as_ref().map(|t| t.as_str()), "run accepted");

        let outcome = self.execute(&mut run, &strategy, &target, &mut cancel).await;
        // The worker guard is gone by now.
        self.metrics
            .set_gauge(names::WORKERS_BUSY, self.pool.busy_count() as i64);

        // Synthesis is stopped while the slot is still held, so the stop can
        // never land on audio of the connection's next run.
        let terminal = match &outcome {
            RunOutcome::Done => {
                run.advance(RunEvent::Complete);
                info!(output_len = run.output_len, "run done");
                RunUpdate::Done { run_id: run.id }
            }
            RunOutcome::Interrupted(reason) => {
                run.advance(RunEvent::Interrupt);
                info!(reason = %reason, output_len = run.output_len, "run interrupted");
                self.stop_synthesis(&target).await;
                RunUpdate::Interrupted {
                    run_id: run.id,
                    reason: *reason,
                }
            }
            RunOutcome::Failed(err) => {
                run.advance(RunEvent::Fail);
                error!(code = %err.code(), error = %err, "run failed");
                self.metrics
                    .increment_counter(names::RUN_ERRORS_TOTAL, &[("code", err.code().as_str())]);
                self.stop_synthesis(&target).await;
                RunUpdate::Error {
                    run_id: Some(run.id),
                    code: err.code(),
                    message: err.to_string(),
                }
            }
        };

        self.metrics
            .increment_counter(names::RUNS_TOTAL, &[("outcome", outcome.label())]);
        self.metrics
            .record_histogram(names::RUN_DURATION_SECONDS, started.elapsed().as_secs_f64());

        // Free the connection, then queue the terminal event with no await in
        // between: the client can send its next request as soon as it sees
        // the event, and a successor's events always come after it.
        target.slot.release(run.id);
        self.active.remove(&run.id);
        if target.updates.send(terminal).is_err() {
            debug!("connection gone before terminal event");
        }
    }

    async fn execute(
        &self,
        run: &mut Run,
        strategy: &Arc<dyn MemoryStrategy>,
        target: &RunTarget,
        cancel: &mut CancelRx,
    ) -> RunOutcome {
        let deadline = self.timeout.map(|t| tokio::time::Instant::now() + t);

        // Created -> WorkerAcquired
        let guard = match guarded(cancel, deadline, self.pool.acquire()).await {
            Step::Stop(reason) => return RunOutcome::Interrupted(reason),
            Step::Ready(Err(PoolError::Closed)) => return RunOutcome::Failed(RunError::ShuttingDown),
            Step::Ready(Err(e)) => return RunOutcome::Failed(RunError::Engine(e.to_string())),
            Step::Ready(Ok(guard)) => guard,
        };
        run.worker = Some(guard.id());
        run.advance(RunEvent::Acquire);
        self.metrics
            .set_gauge(names::WORKERS_BUSY, self.pool.busy_count() as i64);
        debug!(worker = guard.id(), "worker acquired");
        let _ = target.updates.send(RunUpdate::Started { run_id: run.id });

        let preset = Arc::clone(&run.agent);
        let request = self.build_request(run, &preset, strategy).await;

        // WorkerAcquired -> Streaming
        let mut stream = match guarded(cancel, deadline, guard.engine().stream(&request)).await {
            Step::Stop(reason) => return RunOutcome::Interrupted(reason),
            Step::Ready(Err(e)) => return RunOutcome::Failed(RunError::Engine(e.to_string())),
            Step::Ready(Ok(stream)) => stream,
        };
        run.advance(RunEvent::Open);

        let buffered = preset.output_field.is_some();
        let speak_to = target
            .synthesis_target
            .as_ref()
            .zip(self.synthesis.as_ref());
        let mut output = String::new();

        loop {
            let next = match guarded(cancel, deadline, stream.next()).await {
                Step::Stop(reason) => return RunOutcome::Interrupted(reason),
                Step::Ready(next) => next,
            };
            match next {
                Some(Ok(delta)) => {
                    output.push_str(&delta);
                    run.output_len = output.len();
                    if buffered {
                        continue;
                    }
                    let _ = target.updates.send(RunUpdate::Chunk {
                        run_id: run.id,
                        chunk: delta.clone(),
                    });
                    if let Some((client, sink)) = speak_to {
                        if let Err(e) = sink.speak(client, &delta, false).await {
                            warn!(client_id = %client, error = %e, "synthesis chunk dropped");
                        }
                    }
                }
                Some(Err(e)) => return RunOutcome::Failed(RunError::Engine(e.to_string())),
                None => break,
            }
        }
        drop(stream);

        if let Some(field) = &preset.output_field {
            let value = match extract_output_field(&output, field) {
                Ok(value) => value,
                Err(e) => return RunOutcome::Failed(e),
            };
            if let Some((client, sink)) = speak_to {
                if let Err(e) = sink.speak(client, &value, true).await {
                    warn!(client_id = %client, error = %e, "synthesis chunk dropped");
                }
            }
            let _ = target.updates.send(RunUpdate::Chunk {
                run_id: run.id,
                chunk: output.clone(),
            });
        } else if let Some((client, sink)) = speak_to {
            if let Err(e) = sink.speak(client, "", true).await {
                warn!(client_id = %client, error = %e, "synthesis end marker dropped");
            }
        }

        if let Some(thread) = &run.thread {
            strategy.append_exchange(thread, &run.input, &output).await;
        }
        drop(guard);
        RunOutcome::Done
    }

    async fn build_request(
        &self,
        run: &Run,
        preset: &AgentPreset,
        strategy: &Arc<dyn MemoryStrategy>,
    ) -> GenerationRequest {
        let preamble = match &run.thread {
            Some(thread) => strategy.build_preamble(thread, strategy.token_budget()).await,
            None => String::new(),
        };
        let user_text = if preamble.is_empty() {
            run.input.clone()
        } else {
            format!("{preamble}\n\n{}", run.input)
        };
        GenerationRequest {
            system_prompt: preset.system_prompt.clone(),
            messages: vec![ChatMessage::user(user_text)],
            params: self.baseline.merged_with(&preset.params_override),
        }
    }

    async fn stop_synthesis(&self, target: &RunTarget) {
        if let (Some(client), Some(sink)) = (&target.synthesis_target, &self.synthesis) {
            if let Err(e) = sink.stop(client).await {
                warn!(client_id = %client, error = %e, "synthesis stop failed");
            }
        }
    }
}

/// Run `fut` unless the run is interrupted or its deadline passes first.
/// Cancellation is checked before progress, so an interrupt that is already
/// pending always wins.
async fn guarded<F: Future>(
    cancel: &mut CancelRx,
    deadline: Option<tokio::time::Instant>,
    fut: F,
) -> Step<F::Output> {
    let timeout = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        biased;
        reason = cancelled(cancel) => Step::Stop(reason),
        _ = timeout => Step::Stop(InterruptReason::Timeout),
        out = fut => Step::Ready(out),
    }
}

async fn cancelled(cancel: &mut CancelRx) -> InterruptReason {
    loop {
        let current = *cancel.borrow_and_update();
        if let Some(reason) = current {
            return reason;
        }
        if cancel.changed().await.is_err() {
            // Sender lives in the slot until this run releases it.
            std::future::pending::<()>().await;
        }
    }
}

/// Parse a buffered response as a JSON object and pull out `field`. Strings
/// come back verbatim, other values as their JSON text.
pub fn extract_output_field(buffer: &str, field: &str) -> Result<String, RunError> {
    let value: serde_json::Value =
        serde_json::from_str(buffer.trim()).map_err(|e| RunError::OutputField {
            field: field.to_string(),
            reason: format!("response is not valid JSON: {e}"),
        })?;
    let object = value.as_object().ok_or_else(|| RunError::OutputField {
        field: field.to_string(),
        reason: "response is not a JSON object".to_string(),
    })?;
    match object.get(field) {
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(other.to_string()),
        None => Err(RunError::OutputField {
            field: field.to_string(),
            reason: "field missing from response".to_string(),
        }),
    }
}
