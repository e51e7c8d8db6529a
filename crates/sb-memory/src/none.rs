use async_trait::async_trait;
use sb_core::types::ThreadId;

use crate::strategy::{MemoryStrategy, TurnRole};

/// Stateless policy: no preamble, nothing recorded.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMemory;

#[async_trait]
impl MemoryStrategy for NoMemory {
    fn name(&self) -> &'static str {
        "none"
    }

    fn requires_thread(&self) -> bool {
        false
    }

    fn token_budget(&self) -> usize {
        0
    }

    async fn build_preamble(&self, _thread: &ThreadId, _token_budget: usize) -> String {
        String::new()
    }

    async fn append(&self, _thread: &ThreadId, _role: TurnRole, _content: &str) {}
}
