use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sb_agents::{
    ChatRequest, RunError, RunOrchestrator, RunSlot, RunTarget, RunUpdate, SynthesisError,
    SynthesisSink,
};
use sb_core::config::MemoryConfig;
use sb_core::presets::{AgentPreset, PresetTable};
use sb_core::types::{
    ClientId, ConnectionId, ErrorCode, GenerationParams, InterruptReason, MemoryPolicy, RunId,
    ThreadId,
};
use sb_engine::{Engine, EngineError, MockEngine, WorkerPool};
use sb_memory::{MemoryRegistry, MemoryStrategy};
use sb_telemetry::metrics::{names, MetricsCollector};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn presets() -> PresetTable {
    PresetTable::from_presets([
        AgentPreset::new("router", MemoryPolicy::None).with_system_prompt("You route requests."),
        AgentPreset::new("topic", MemoryPolicy::ThreadWindow)
            .with_system_prompt("You track the topic.")
            .with_params(GenerationParams {
                temperature: Some(0.1),
                ..Default::default()
            }),
        AgentPreset::new("extractor", MemoryPolicy::None).with_output_field("topic"),
    ])
    .unwrap()
}

struct Harness {
    orch: Arc<RunOrchestrator>,
    engine: Arc<MockEngine>,
    memory: MemoryRegistry,
    metrics: Arc<MetricsCollector>,
    pool: WorkerPool,
}

fn harness_with(
    engine: MockEngine,
    pool_size: usize,
    configure: impl FnOnce(RunOrchestrator) -> RunOrchestrator,
) -> Harness {
    let engine = Arc::new(engine);
    let shared: Arc<dyn Engine> = engine.clone();
    let pool = WorkerPool::new(pool_size, |_| shared.clone()).unwrap();
    let memory = MemoryRegistry::from_config(&MemoryConfig::default());
    let metrics = Arc::new(MetricsCollector::new());
    let orch = RunOrchestrator::new(presets(), pool.clone(), memory.clone(), metrics.clone())
        .with_baseline_params(GenerationParams {
            temperature: Some(0.7),
            max_tokens: Some(256),
            ..Default::default()
        });
    Harness {
        orch: Arc::new(configure(orch)),
        engine,
        memory,
        metrics,
        pool,
    }
}

fn harness(engine: MockEngine) -> Harness {
    harness_with(engine, 2, |o| o)
}

fn target() -> (RunTarget, flume::Receiver<RunUpdate>) {
    let (tx, rx) = flume::unbounded();
    (
        RunTarget {
            connection: ConnectionId::new(),
            slot: RunSlot::new(),
            updates: tx,
            synthesis_target: None,
        },
        rx,
    )
}

/// Every update received until `run_id` reaches a terminal event.
async fn until_terminal(rx: &flume::Receiver<RunUpdate>, run_id: RunId) -> Vec<RunUpdate> {
    let mut seen = Vec::new();
    loop {
        let update = tokio::time::timeout(Duration::from_secs(5), rx.recv_async())
            .await
            .expect("run did not finish in time")
            .expect("update channel closed");
        let done = update.is_terminal() && update.run_id() == Some(run_id);
        seen.push(update);
        if done {
            return seen;
        }
    }
}

async fn next_update(rx: &flume::Receiver<RunUpdate>) -> RunUpdate {
    tokio::time::timeout(Duration::from_secs(5), rx.recv_async())
        .await
        .expect("no update in time")
        .expect("update channel closed")
}

fn chunks(updates: &[RunUpdate]) -> Vec<String> {
    updates
        .iter()
        .filter_map(|u| match u {
            RunUpdate::Chunk { chunk, .. } => Some(chunk.clone()),
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
enum SinkCall {
    Speak(String, String, bool),
    Stop(String),
}

#[derive(Default)]
struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
    stop_delay: Duration,
}

impl RecordingSink {
    fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SynthesisSink for RecordingSink {
    async fn speak(
        &self,
        client: &ClientId,
        chunk: &str,
        is_final: bool,
    ) -> Result<(), SynthesisError> {
        self.calls.lock().unwrap().push(SinkCall::Speak(
            client.to_string(),
            chunk.to_string(),
            is_final,
        ));
        Ok(())
    }

    async fn stop(&self, client: &ClientId) -> Result<(), SynthesisError> {
        tokio::time::sleep(self.stop_delay).await;
        self.calls
            .lock()
            .unwrap()
            .push(SinkCall::Stop(client.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stateless_run_streams_and_completes() {
    let h = harness(MockEngine::new());
    let (target, rx) = target();
    let slot = target.slot.clone();

    let run_id = h
        .orch
        .submit(target, ChatRequest::new("router", "  hello there "))
        .unwrap();
    let updates = until_terminal(&rx, run_id).await;

    assert_eq!(updates.first(), Some(&RunUpdate::Started { run_id }));
    assert_eq!(chunks(&updates), vec!["Mock ", "response"]);
    assert_eq!(updates.last(), Some(&RunUpdate::Done { run_id }));

    let req = &h.engine.captured_requests()[0];
    assert_eq!(req.system_prompt, "You route requests.");
    assert_eq!(req.last_user_text(), Some("hello there"));
    assert_eq!(req.params.temperature, Some(0.7));
    assert_eq!(req.params.max_tokens, Some(256));

    // The slot and worker are free by the time Done arrives.
    assert!(!slot.is_busy());
    assert_eq!(h.pool.free_count(), 2);
    assert_eq!(h.orch.active_count(), 0);
    assert_eq!(
        h.metrics.get_counter(names::RUNS_TOTAL, &[("outcome", "done")]),
        1
    );
}

#[tokio::test]
async fn connection_can_run_again_after_done() {
    let h = harness(MockEngine::new());
    let (target, rx) = target();

    for _ in 0..3 {
        let id = h
            .orch
            .submit(target.clone(), ChatRequest::new("router", "again"))
            .unwrap();
        let updates = until_terminal(&rx, id).await;
        assert_eq!(updates.last(), Some(&RunUpdate::Done { run_id: id }));
    }
    assert_eq!(h.engine.call_count(), 3);
}

#[tokio::test]
async fn active_runs_reports_in_flight_work() {
    let h = harness(MockEngine::new().with_delay(Duration::from_millis(100)));
    let (target, rx) = target();
    let run_id = h
        .orch
        .submit(target, ChatRequest::new("router", "slow"))
        .unwrap();

    let active = h.orch.active_runs();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].run_id, run_id);
    assert_eq!(active[0].agent, "router");

    until_terminal(&rx, run_id).await;
    assert!(h.orch.active_runs().is_empty());
}

// ---------------------------------------------------------------------------
// Pre-flight rejections
// ---------------------------------------------------------------------------

#[tokio::test]
async fn memory_agent_without_thread_is_rejected() {
    let h = harness(MockEngine::new());
    let (target, rx) = target();

    let err = h
        .orch
        .submit(target.clone(), ChatRequest::new("topic", "What changed?"))
        .unwrap_err();
    assert!(matches!(err, RunError::ThreadRequired(_)));

    let blank = h
        .orch
        .submit(target, ChatRequest::new("topic", "What changed?").with_thread(""))
        .unwrap_err();
    assert_eq!(blank.code(), ErrorCode::MemThreadRequired);

    for _ in 0..2 {
        match next_update(&rx).await {
            RunUpdate::Error { run_id, code, .. } => {
                assert_eq!(run_id, None);
                assert_eq!(code, ErrorCode::MemThreadRequired);
            }
            other => panic!("expected error, got {other:?}"),
        }
    }
    assert!(rx.is_empty());
    assert_eq!(h.engine.call_count(), 0);
    assert_eq!(
        h.metrics.get_counter(
            names::RUN_ERRORS_TOTAL,
            &[("code", "MEM_THREAD_REQUIRED")]
        ),
        2
    );
}

#[tokio::test]
async fn unknown_agent_and_empty_text_are_rejected() {
    let h = harness(MockEngine::new());
    let (target, rx) = target();

    let err = h
        .orch
        .submit(target.clone(), ChatRequest::new("nobody", "hi"))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::AgentInvalid);

    let err = h
        .orch
        .submit(target.clone(), ChatRequest::new("router", "   \n"))
        .unwrap_err();
    assert_eq!(err, RunError::Empty);

    assert!(matches!(
        next_update(&rx).await,
        RunUpdate::Error { code: ErrorCode::AgentInvalid, run_id: None, .. }
    ));
    assert!(matches!(
        next_update(&rx).await,
        RunUpdate::Error { code: ErrorCode::Empty, run_id: None, .. }
    ));
    assert!(!target.slot.is_busy());
}

#[tokio::test]
async fn agent_names_are_case_insensitive() {
    let h = harness(MockEngine::new());
    let (target, rx) = target();
    let id = h
        .orch
        .submit(target, ChatRequest::new(" Router ", "hi"))
        .unwrap();
    let updates = until_terminal(&rx, id).await;
    assert_eq!(updates.last(), Some(&RunUpdate::Done { run_id: id }));
}

#[tokio::test]
async fn second_request_on_busy_connection_is_rejected() {
    let h = harness(MockEngine::new().with_delay(Duration::from_millis(50)));
    let (target, rx) = target();

    let first = h
        .orch
        .submit(target.clone(), ChatRequest::new("router", "one"))
        .unwrap();
    let err = h
        .orch
        .submit(target, ChatRequest::new("router", "two"))
        .unwrap_err();
    assert_eq!(err, RunError::Busy);

    let updates = until_terminal(&rx, first).await;
    assert!(updates.iter().any(|u| matches!(
        u,
        RunUpdate::Error { run_id: None, code: ErrorCode::Busy, .. }
    )));
    assert_eq!(updates.last(), Some(&RunUpdate::Done { run_id: first }));
    assert_eq!(h.engine.call_count(), 1);
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_turn_sees_first_exchange() {
    let h = harness(MockEngine::new().with_deltas(["Par", "is"]));
    let (target, rx) = target();

    let first = h
        .orch
        .submit(
            target.clone(),
            ChatRequest::new("topic", "Capital of France?").with_thread("t1"),
        )
        .unwrap();
    until_terminal(&rx, first).await;

    let second = h
        .orch
        .submit(
            target.clone(),
            ChatRequest::new("topic", "And Spain?").with_thread("t1"),
        )
        .unwrap();
    until_terminal(&rx, second).await;

    let other = h
        .orch
        .submit(target, ChatRequest::new("topic", "Hello").with_thread("t2"))
        .unwrap();
    until_terminal(&rx, other).await;

    let requests = h.engine.captured_requests();
    assert_eq!(requests[0].last_user_text(), Some("Capital of France?"));
    assert_eq!(
        requests[1].last_user_text(),
        Some("USER: Capital of France?\nASSISTANT: Paris\n\nAnd Spain?")
    );
    assert_eq!(requests[1].system_prompt, "You track the topic.");
    assert_eq!(requests[1].params.temperature, Some(0.1));
    assert_eq!(requests[1].params.max_tokens, Some(256));
    // Threads do not leak into each other.
    assert_eq!(requests[2].last_user_text(), Some("Hello"));
}

// ---------------------------------------------------------------------------
// Interrupts, timeouts, failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn interrupt_before_first_delta_leaves_thread_untouched() {
    let h = harness(MockEngine::new().with_delay(Duration::from_millis(300)));
    let (target, rx) = target();
    let slot = target.slot.clone();

    let id = h
        .orch
        .submit(target, ChatRequest::new("topic", "Long one").with_thread("t"))
        .unwrap();
    assert_eq!(next_update(&rx).await, RunUpdate::Started { run_id: id });
    assert_eq!(slot.interrupt(InterruptReason::Client), Some(id));

    let updates = until_terminal(&rx, id).await;
    assert_eq!(
        updates,
        vec![RunUpdate::Interrupted {
            run_id: id,
            reason: InterruptReason::Client
        }]
    );

    let strategy = h.memory.get(MemoryPolicy::ThreadWindow).unwrap();
    assert_eq!(strategy.build_preamble(&ThreadId::from("t"), 1024).await, "");
    assert_eq!(h.pool.free_count(), 2);
    assert!(!slot.is_busy());
}

#[tokio::test]
async fn interrupt_while_waiting_for_worker() {
    let h = harness_with(
        MockEngine::new().with_delay(Duration::from_millis(200)),
        1,
        |o| o,
    );
    let (busy, busy_rx) = target();
    let (waiting, waiting_rx) = target();
    let waiting_slot = waiting.slot.clone();

    let holder = h
        .orch
        .submit(busy, ChatRequest::new("router", "hold"))
        .unwrap();
    let queued = h
        .orch
        .submit(waiting, ChatRequest::new("router", "queued"))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.pool.waiting(), 1);
    waiting_slot.interrupt(InterruptReason::Client);

    let updates = until_terminal(&waiting_rx, queued).await;
    assert_eq!(
        updates,
        vec![RunUpdate::Interrupted {
            run_id: queued,
            reason: InterruptReason::Client
        }]
    );
    assert_eq!(h.pool.waiting(), 0);

    let held = until_terminal(&busy_rx, holder).await;
    assert_eq!(held.last(), Some(&RunUpdate::Done { run_id: holder }));
    assert_eq!(h.engine.call_count(), 1);
    assert_eq!(h.pool.free_count(), 1);
}

#[tokio::test]
async fn timeout_surfaces_as_interrupted() {
    let h = harness_with(
        MockEngine::new().with_delay(Duration::from_millis(500)),
        1,
        |o| o.with_timeout(Some(Duration::from_millis(80))),
    );
    let (target, rx) = target();

    // Times out while the only worker is lent elsewhere.
    let held = h.pool.acquire().await.unwrap();
    let queued = h
        .orch
        .submit(target.clone(), ChatRequest::new("router", "waiting"))
        .unwrap();
    let waited = until_terminal(&rx, queued).await;
    assert_eq!(
        waited,
        vec![RunUpdate::Interrupted {
            run_id: queued,
            reason: InterruptReason::Timeout
        }]
    );
    assert_eq!(h.engine.call_count(), 0);
    drop(held);

    // Times out mid-stream.
    let streaming = h
        .orch
        .submit(target, ChatRequest::new("router", "slow"))
        .unwrap();
    let streamed = until_terminal(&rx, streaming).await;
    assert_eq!(streamed.first(), Some(&RunUpdate::Started { run_id: streaming }));
    assert_eq!(
        streamed.last(),
        Some(&RunUpdate::Interrupted {
            run_id: streaming,
            reason: InterruptReason::Timeout
        })
    );

    assert_eq!(h.pool.free_count(), 1);
    assert_eq!(
        h.metrics
            .get_counter(names::RUNS_TOTAL, &[("outcome", "interrupted")]),
        2
    );
}

#[tokio::test]
async fn engine_failure_reports_upstream_unavailable() {
    let h = harness(
        MockEngine::new()
            .with_failure_after(["par"], EngineError::Generation("boom".into()))
            .with_open_error(EngineError::Api {
                status: 503,
                message: "loading".into(),
            }),
    );
    let (target, rx) = target();

    let mid = h
        .orch
        .submit(target.clone(), ChatRequest::new("topic", "q").with_thread("t"))
        .unwrap();
    let updates = until_terminal(&rx, mid).await;
    assert_eq!(chunks(&updates), vec!["par"]);
    match updates.last() {
        Some(RunUpdate::Error { run_id, code, .. }) => {
            assert_eq!(*run_id, Some(mid));
            assert_eq!(*code, ErrorCode::UpstreamUnavailable);
        }
        other => panic!("expected error, got {other:?}"),
    }

    let open = h
        .orch
        .submit(target, ChatRequest::new("router", "q"))
        .unwrap();
    let updates = until_terminal(&rx, open).await;
    assert_eq!(updates.first(), Some(&RunUpdate::Started { run_id: open }));
    assert!(matches!(
        updates.last(),
        Some(RunUpdate::Error { code: ErrorCode::UpstreamUnavailable, .. })
    ));

    // Failed runs never reach memory.
    let strategy = h.memory.get(MemoryPolicy::ThreadWindow).unwrap();
    assert_eq!(strategy.build_preamble(&ThreadId::from("t"), 1024).await, "");
    assert_eq!(h.pool.free_count(), 2);
}

#[tokio::test]
async fn shutdown_interrupts_and_rejects() {
    let h = harness(MockEngine::new().with_delay(Duration::from_millis(300)));
    let (target, rx) = target();

    let id = h
        .orch
        .submit(target.clone(), ChatRequest::new("router", "long"))
        .unwrap();
    assert_eq!(next_update(&rx).await, RunUpdate::Started { run_id: id });

    h.orch.shutdown();
    let updates = until_terminal(&rx, id).await;
    assert_eq!(
        updates.last(),
        Some(&RunUpdate::Interrupted {
            run_id: id,
            reason: InterruptReason::Shutdown
        })
    );

    let err = h
        .orch
        .submit(target, ChatRequest::new("router", "more"))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ShuttingDown);
}

// ---------------------------------------------------------------------------
// Output field and synthesis
// ---------------------------------------------------------------------------

#[tokio::test]
async fn output_field_is_extracted_for_synthesis() {
    let sink = Arc::new(RecordingSink::default());
    let sink_dyn: Arc<dyn SynthesisSink> = sink.clone();
    let h = harness_with(
        MockEngine::new().with_deltas([r#"{"topic": "#, r#""weather", "score": 2}"#]),
        1,
        |o| o.with_synthesis(sink_dyn),
    );
    let (mut target, rx) = target();
    target.synthesis_target = Some(ClientId::from("speaker"));

    let id = h
        .orch
        .submit(target, ChatRequest::new("extractor", "classify this"))
        .unwrap();
    let updates = until_terminal(&rx, id).await;

    // Output-field agents deliver the buffered response in one chunk.
    assert_eq!(
        chunks(&updates),
        vec![r#"{"topic": "weather", "score": 2}"#.to_string()]
    );
    assert_eq!(updates.last(), Some(&RunUpdate::Done { run_id: id }));
    assert_eq!(
        sink.calls(),
        vec![SinkCall::Speak("speaker".into(), "weather".into(), true)]
    );
}

#[tokio::test]
async fn output_field_failure_stops_synthesis() {
    let sink = Arc::new(RecordingSink::default());
    let sink_dyn: Arc<dyn SynthesisSink> = sink.clone();
    let h = harness_with(MockEngine::new().with_deltas(["not json"]), 1, |o| {
        o.with_synthesis(sink_dyn)
    });
    let (mut target, rx) = target();
    target.synthesis_target = Some(ClientId::from("speaker"));

    let id = h
        .orch
        .submit(target, ChatRequest::new("extractor", "classify"))
        .unwrap();
    let updates = until_terminal(&rx, id).await;

    assert!(chunks(&updates).is_empty());
    assert!(matches!(
        updates.last(),
        Some(RunUpdate::Error { code: ErrorCode::OutputField, .. })
    ));
    assert_eq!(sink.calls(), vec![SinkCall::Stop("speaker".into())]);
}

#[tokio::test]
async fn streamed_text_is_forwarded_to_synthesis() {
    let sink = Arc::new(RecordingSink::default());
    let sink_dyn: Arc<dyn SynthesisSink> = sink.clone();
    let h = harness_with(MockEngine::new(), 1, |o| o.with_synthesis(sink_dyn));
    let (mut target, rx) = target();
    target.synthesis_target = Some(ClientId::from("c1"));

    let id = h
        .orch
        .submit(target, ChatRequest::new("router", "talk"))
        .unwrap();
    until_terminal(&rx, id).await;

    assert_eq!(
        sink.calls(),
        vec![
            SinkCall::Speak("c1".into(), "Mock ".into(), false),
            SinkCall::Speak("c1".into(), "response".into(), false),
            SinkCall::Speak("c1".into(), "".into(), true),
        ]
    );
}

#[tokio::test]
async fn runs_without_synthesis_target_skip_the_sink() {
    let sink = Arc::new(RecordingSink::default());
    let sink_dyn: Arc<dyn SynthesisSink> = sink.clone();
    let h = harness_with(MockEngine::new(), 1, |o| o.with_synthesis(sink_dyn));
    let (target, rx) = target();

    let id = h
        .orch
        .submit(target, ChatRequest::new("router", "quiet"))
        .unwrap();
    until_terminal(&rx, id).await;
    assert!(sink.calls().is_empty());
}

#[tokio::test]
async fn interrupted_run_stops_synthesis_before_freeing_the_connection() {
    let sink = Arc::new(RecordingSink {
        stop_delay: Duration::from_millis(100),
        ..Default::default()
    });
    let sink_dyn: Arc<dyn SynthesisSink> = sink.clone();
    let h = harness_with(
        MockEngine::new().with_delay(Duration::from_millis(300)),
        2,
        |o| o.with_synthesis(sink_dyn),
    );
    let (mut target, rx) = target();
    target.synthesis_target = Some(ClientId::from("speaker"));
    let slot = target.slot.clone();

    let first = h
        .orch
        .submit(target.clone(), ChatRequest::new("router", "long"))
        .unwrap();
    assert_eq!(next_update(&rx).await, RunUpdate::Started { run_id: first });
    slot.interrupt(InterruptReason::Client);

    // Retry until the connection is free again.
    let second = loop {
        match h.orch.submit(target.clone(), ChatRequest::new("router", "next")) {
            Ok(id) => break id,
            Err(RunError::Busy) => tokio::time::sleep(Duration::from_millis(5)).await,
            Err(e) => panic!("unexpected rejection: {e}"),
        }
    };
    assert_eq!(sink.calls(), vec![SinkCall::Stop("speaker".into())]);

    let updates: Vec<RunUpdate> = until_terminal(&rx, second)
        .await
        .into_iter()
        .filter(|u| !matches!(u, RunUpdate::Error { run_id: None, .. }))
        .collect();
    assert_eq!(
        updates[0],
        RunUpdate::Interrupted {
            run_id: first,
            reason: InterruptReason::Client
        }
    );
    assert_eq!(updates[1], RunUpdate::Started { run_id: second });
    assert_eq!(updates.last(), Some(&RunUpdate::Done { run_id: second }));
    assert!(sink
        .calls()
        .iter()
        .skip(1)
        .all(|c| matches!(c, SinkCall::Speak(..))));
}
