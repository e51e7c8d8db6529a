use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use sb_core::types::GenerationParams;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::{ChatRole, DeltaStream, Engine, EngineError, GenerationRequest};

// ---------------------------------------------------------------------------
// LocalEngine: OpenAI-compatible streaming chat completions
// ---------------------------------------------------------------------------

/// Engine for local inference servers exposing `/v1/chat/completions`
/// (llama.cpp server, vLLM, Ollama, text-generation-inference).
///
/// Requests are always sent with `"stream": true` and the server-sent event
/// body is turned into a [`DeltaStream`]. Dropping the stream drops the HTTP
/// response, which closes the connection and lets the server stop generating.
pub struct LocalEngine {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl LocalEngine {
    /// Fails when `base_url` is not an absolute URL or the HTTP client
    /// cannot be built with the given timeout.
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, EngineError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        reqwest::Url::parse(&base_url)
            .map_err(|e| EngineError::Http(format!("invalid base url '{base_url}': {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| EngineError::Http(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            model: model.into(),
            api_key: api_key.filter(|k| !k.is_empty() && k != "none"),
        })
    }

    fn build_body<'a>(&'a self, request: &'a GenerationRequest) -> CompletionBody<'a> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system_prompt.is_empty() {
            messages.push(WireMessage {
                role: ChatRole::System,
                content: &request.system_prompt,
            });
        }
        messages.extend(request.messages.iter().map(|m| WireMessage {
            role: m.role,
            content: &m.content,
        }));
        CompletionBody {
            model: &self.model,
            messages,
            stream: true,
            params: &request.params,
        }
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: ChatRole,
    content: &'a str,
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    #[serde(flatten)]
    params: &'a GenerationParams,
}

#[async_trait]
impl Engine for LocalEngine {
    fn name(&self) -> &str {
        "local"
    }

    async fn stream(&self, request: &GenerationRequest) -> Result<DeltaStream, EngineError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = self.build_body(request);

        let mut req = self
            .client
            .post(&url)
            .header("Accept", "text/event-stream")
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(EngineError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        debug!(url = %url, model = %self.model, "engine stream opened");
        Ok(sse_deltas(resp.bytes_stream()))
    }
}

// ---------------------------------------------------------------------------
// SSE decoding
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ChunkResp {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ChunkErrorBody>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChunkErrorBody {
    #[serde(default)]
    message: String,
}

/// One decoded SSE line.
#[derive(Debug, PartialEq)]
pub(crate) enum SseLine {
    Delta(String),
    Done,
    Skip,
}

/// Decode a single line of a chat-completions event stream.
pub(crate) fn parse_sse_line(line: &str) -> Result<SseLine, EngineError> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        // blank separators, comments, `event:` / `id:` fields
        return Ok(SseLine::Skip);
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    let chunk: ChunkResp =
        serde_json::from_str(data).map_err(|e| EngineError::Parse(e.to_string()))?;
    if let Some(err) = chunk.error {
        return Err(EngineError::Generation(err.message));
    }
    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.and_then(|d| d.content))
        .collect();
    if text.is_empty() {
        Ok(SseLine::Skip)
    } else {
        Ok(SseLine::Delta(text))
    }
}

struct SseState<S> {
    body: S,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String, EngineError>>,
    finished: bool,
}

impl<S> SseState<S> {
    /// Decode every complete line in the buffer. With `flush`, a trailing
    /// unterminated line is decoded too.
    fn drain_lines(&mut self, flush: bool) {
        loop {
            if self.finished {
                return;
            }
            let line: Vec<u8> = match self.buffer.iter().position(|b| *b == b'\n') {
                Some(pos) => self.buffer.drain(..=pos).collect(),
                None if flush && !self.buffer.is_empty() => std::mem::take(&mut self.buffer),
                None => return,
            };
            match parse_sse_line(&String::from_utf8_lossy(&line)) {
                Ok(SseLine::Delta(text)) => self.pending.push_back(Ok(text)),
                Ok(SseLine::Done) => self.finished = true,
                Ok(SseLine::Skip) => {}
                Err(e) => {
                    self.pending.push_back(Err(e));
                    self.finished = true;
                }
            }
        }
    }
}

/// Turn a raw SSE byte stream into ordered text deltas.
///
/// Lines are split on raw bytes so multi-byte characters spanning network
/// chunks decode intact. The stream ends after `[DONE]`, after the first
/// error, or when the body ends.
pub(crate) fn sse_deltas<S, B, E>(body: S) -> DeltaStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<EngineError> + Send + 'static,
{
    let state = SseState {
        body: Box::pin(body),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    let stream = futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => {
                    st.buffer.extend_from_slice(bytes.as_ref());
                    st.drain_lines(false);
                }
                Some(Err(e)) => {
                    st.pending.push_back(Err(e.into()));
                    st.finished = true;
                }
                None => {
                    st.drain_lines(true);
                    st.finished = true;
                }
            }
        }
    });
    Box::pin(stream)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
