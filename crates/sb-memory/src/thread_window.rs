use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sb_core::config::ThreadWindowConfig;
use sb_core::types::ThreadId;
use tracing::{debug, warn};

use crate::estimator::{CharRatioEstimator, TokenEstimator};
use crate::strategy::{MemoryStrategy, TurnRole};

/// One recorded message in a thread.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    /// Estimated cost of the rendered line, fixed at append time.
    pub approx_tokens: usize,
    pub appended_at: DateTime<Utc>,
}

impl Turn {
    fn render(role: TurnRole, content: &str) -> String {
        format!("{}: {}", role.label(), content)
    }
}

/// Rolling per-thread window of recent turns.
///
/// The preamble is the longest suffix of the thread whose estimated token
/// cost fits the budget, rendered as `USER: …` / `ASSISTANT: …` lines, oldest
/// first. Turns are never split.
pub struct ThreadWindowMemory {
    max_context_tokens: usize,
    estimator: Arc<dyn TokenEstimator>,
    threads: Mutex<HashMap<ThreadId, Vec<Turn>>>,
}

impl ThreadWindowMemory {
    pub fn new(max_context_tokens: usize, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self {
            max_context_tokens,
            estimator,
            threads: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &ThreadWindowConfig) -> Self {
        Self::new(
            cfg.max_context_tokens,
            Arc::new(CharRatioEstimator::new(cfg.chars_per_token)),
        )
    }

    /// Snapshot of a thread's turns, oldest first.
    pub fn turns(&self, thread: &ThreadId) -> Vec<Turn> {
        self.lock().get(thread).cloned().unwrap_or_default()
    }

    /// Number of threads with at least one turn.
    pub fn thread_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ThreadId, Vec<Turn>>> {
        self.threads.lock().unwrap_or_else(|e| {
            warn!("thread window lock was poisoned, recovering");
            e.into_inner()
        })
    }

    fn make_turn(&self, role: TurnRole, content: &str) -> Turn {
        Turn {
            role,
            content: content.to_string(),
            approx_tokens: self.estimator.estimate(&Turn::render(role, content)),
            appended_at: Utc::now(),
        }
    }

    fn render_window(turns: &[Turn], token_budget: usize) -> String {
        let mut used = 0usize;
        let mut start = turns.len();
        for (i, turn) in turns.iter().enumerate().rev() {
            if used + turn.approx_tokens > token_budget {
                break;
            }
            used += turn.approx_tokens;
            start = i;
        }
        turns[start..]
            .iter()
            .map(|t| Turn::render(t.role, &t.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl MemoryStrategy for ThreadWindowMemory {
    fn name(&self) -> &'static str {
        "thread_window"
    }

    fn requires_thread(&self) -> bool {
        true
    }

    fn token_budget(&self) -> usize {
        self.max_context_tokens
    }

    async fn build_preamble(&self, thread: &ThreadId, token_budget: usize) -> String {
        let threads = self.lock();
        let Some(turns) = threads.get(thread) else {
            return String::new();
        };
        let preamble = Self::render_window(turns, token_budget);
        debug!(thread = %thread, turns = turns.len(), chars = preamble.len(), "built preamble");
        preamble
    }

    async fn append(&self, thread: &ThreadId, role: TurnRole, content: &str) {
        let mut threads = self.lock();
        let turn = self.make_turn(role, content);
        threads.entry(thread.clone()).or_default().push(turn);
    }

    // Turns are stamped under the lock so `appended_at` follows sequence order.
    async fn append_exchange(&self, thread: &ThreadId, user: &str, assistant: &str) {
        let mut threads = self.lock();
        let user_turn = self.make_turn(TurnRole::User, user);
        let assistant_turn = self.make_turn(TurnRole::Assistant, assistant);
        let turns = threads.entry(thread.clone()).or_default();
        turns.push(user_turn);
        turns.push(assistant_turn);
        debug!(thread = %thread, turns = turns.len(), "exchange recorded");
    }
}
