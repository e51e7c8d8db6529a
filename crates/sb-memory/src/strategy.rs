use std::fmt;

use async_trait::async_trait;
use sb_core::types::ThreadId;

/// Speaker of a recorded turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    /// Prefix used when a turn is rendered into a preamble.
    pub fn label(&self) -> &'static str {
        match self {
            TurnRole::User => "USER",
            TurnRole::Assistant => "ASSISTANT",
        }
    }
}

impl fmt::Display for TurnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A conversation-history policy.
///
/// Implementations keep their own per-thread state and must be safe to share
/// across concurrent runs.
#[async_trait]
pub trait MemoryStrategy: Send + Sync {
    /// Registry key, e.g. `thread_window`.
    fn name(&self) -> &'static str;

    /// Whether requests must carry a thread id under this strategy.
    fn requires_thread(&self) -> bool;

    /// Configured preamble budget in estimated tokens.
    fn token_budget(&self) -> usize;

    /// Render history for `thread` within `token_budget` estimated tokens.
    /// Returns an empty string when there is nothing to render.
    async fn build_preamble(&self, thread: &ThreadId, token_budget: usize) -> String;

    /// Record one turn.
    async fn append(&self, thread: &ThreadId, role: TurnRole, content: &str);

    /// Record a user turn and its reply so they land adjacent in the thread.
    async fn append_exchange(&self, thread: &ThreadId, user: &str, assistant: &str) {
        self.append(thread, TurnRole::User, user).await;
        self.append(thread, TurnRole::Assistant, assistant).await;
    }
}
