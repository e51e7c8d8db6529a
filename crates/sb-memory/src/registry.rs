use std::collections::HashMap;
use std::sync::Arc;

use sb_core::config::MemoryConfig;
use sb_core::types::MemoryPolicy;
use tracing::info;

use crate::none::NoMemory;
use crate::strategy::MemoryStrategy;
use crate::thread_window::ThreadWindowMemory;

/// Strategies instantiated at startup, keyed by policy.
///
/// `none` is always present. Strategies are shared by every agent that names
/// the policy, so agents on the same policy and thread id see one history.
#[derive(Clone)]
pub struct MemoryRegistry {
    strategies: HashMap<MemoryPolicy, Arc<dyn MemoryStrategy>>,
}

impl MemoryRegistry {
    /// Registry holding only the `none` strategy.
    pub fn new() -> Self {
        let mut strategies: HashMap<MemoryPolicy, Arc<dyn MemoryStrategy>> = HashMap::new();
        strategies.insert(MemoryPolicy::None, Arc::new(NoMemory));
        Self { strategies }
    }

    pub fn from_config(cfg: &MemoryConfig) -> Self {
        let mut registry = Self::new();
        registry.register(
            MemoryPolicy::ThreadWindow,
            Arc::new(ThreadWindowMemory::from_config(&cfg.thread_window)),
        );
        info!(
            strategies = ?registry.available(),
            max_context_tokens = cfg.thread_window.max_context_tokens,
            "memory registry ready"
        );
        registry
    }

    /// Install or replace the strategy for `policy`.
    pub fn register(&mut self, policy: MemoryPolicy, strategy: Arc<dyn MemoryStrategy>) {
        self.strategies.insert(policy, strategy);
    }

    pub fn get(&self, policy: MemoryPolicy) -> Option<Arc<dyn MemoryStrategy>> {
        self.strategies.get(&policy).cloned()
    }

    /// Sorted strategy names.
    pub fn available(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.strategies.keys().map(|p| p.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}
