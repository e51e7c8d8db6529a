use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;

use crate::engine::{DeltaStream, Engine, EngineError, GenerationRequest};

/// One scripted generation.
#[derive(Debug, Clone)]
enum MockReply {
    /// Yield the deltas, then optionally fail instead of completing.
    Deltas {
        deltas: Vec<String>,
        fail_with: Option<EngineError>,
    },
    /// Fail before any delta is produced.
    OpenError(EngineError),
}

/// A scripted engine for tests.
///
/// Each `stream` call pops the next queued reply; when the queue is empty the
/// default reply (`["Mock ", "response"]` unless overridden) is used. A
/// per-delta delay makes interrupts and timeouts observable.
pub struct MockEngine {
    replies: Mutex<VecDeque<MockReply>>,
    default_deltas: Mutex<Vec<String>>,
    delay: Mutex<Duration>,
    captured_requests: Arc<Mutex<Vec<GenerationRequest>>>,
    calls: AtomicUsize,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            default_deltas: Mutex::new(vec!["Mock ".into(), "response".into()]),
            delay: Mutex::new(Duration::ZERO),
            captured_requests: Arc::new(Mutex::new(Vec::new())),
            calls: AtomicUsize::new(0),
        }
    }

    /// Queue a reply that yields `deltas` and completes.
    pub fn with_deltas<I, S>(self, deltas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(MockReply::Deltas {
            deltas: deltas.into_iter().map(Into::into).collect(),
            fail_with: None,
        });
        self
    }

    /// Queue a reply that yields `deltas` and then fails mid-stream.
    pub fn with_failure_after<I, S>(self, deltas: I, error: EngineError) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(MockReply::Deltas {
            deltas: deltas.into_iter().map(Into::into).collect(),
            fail_with: Some(error),
        });
        self
    }

    /// Queue a reply whose stream cannot be opened.
    pub fn with_open_error(self, error: EngineError) -> Self {
        self.push(MockReply::OpenError(error));
        self
    }

    /// Replace the reply used once the queue runs dry.
    pub fn with_default_deltas<I, S>(self, deltas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self
            .default_deltas
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = deltas.into_iter().map(Into::into).collect();
        self
    }

    /// Sleep this long before every delta.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
        self
    }

    /// Every request received so far, in call order.
    pub fn captured_requests(&self) -> Vec<GenerationRequest> {
        self.captured_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn push(&self, reply: MockReply) {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reply);
    }

    fn next_reply(&self) -> MockReply {
        let queued = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        queued.unwrap_or_else(|| MockReply::Deltas {
            deltas: self
                .default_deltas
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            fail_with: None,
        })
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Engine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream(&self, request: &GenerationRequest) -> Result<DeltaStream, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.captured_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let (deltas, fail_with) = match self.next_reply() {
            MockReply::OpenError(e) => return Err(e),
            MockReply::Deltas { deltas, fail_with } => (deltas, fail_with),
        };
        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);

        let items: Vec<Result<String, EngineError>> = deltas
            .into_iter()
            .map(Ok)
            .chain(fail_with.map(Err))
            .collect();

        let stream = futures_util::stream::iter(items).then(move |item| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            item
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(engine: &MockEngine) -> Vec<Result<String, EngineError>> {
        match engine.stream(&GenerationRequest::new("", "hi")).await {
            Ok(s) => s.collect().await,
            Err(e) => vec![Err(e)],
        }
    }

    #[tokio::test]
    async fn queued_replies_then_default() {
        let engine = MockEngine::new().with_deltas(["a", "b"]);
        let first: Vec<String> = drain(&engine).await.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(first, vec!["a", "b"]);

        let second: Vec<String> = drain(&engine).await.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(second.concat(), "Mock response");
        assert_eq!(engine.call_count(), 2);
    }

    #[tokio::test]
    async fn failure_after_deltas() {
        let engine = MockEngine::new()
            .with_failure_after(["x"], EngineError::Generation("boom".into()));
        let out = drain(&engine).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap(), "x");
        assert!(matches!(out[1], Err(EngineError::Generation(_))));
    }

    #[tokio::test]
    async fn open_error_and_captured_requests() {
        let engine = MockEngine::new().with_open_error(EngineError::Timeout);
        let result = engine
            .stream(&GenerationRequest::new("sys", "question"))
            .await;
        assert!(matches!(result, Err(EngineError::Timeout)));

        let captured = engine.captured_requests();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].system_prompt, "sys");
        assert_eq!(captured[0].last_user_text(), Some("question"));
    }
}
