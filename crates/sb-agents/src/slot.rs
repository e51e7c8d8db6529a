use std::sync::{Arc, Mutex, MutexGuard};

use sb_core::types::{InterruptReason, RunId};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Cancellation flag shared between a run's driver and whoever may interrupt
/// it. Holds the first reason given.
pub(crate) type CancelRx = watch::Receiver<Option<InterruptReason>>;

struct ActiveRun {
    run_id: RunId,
    cancel: watch::Sender<Option<InterruptReason>>,
}

/// Per-connection holder of at most one active run.
///
/// Claiming is atomic, so two requests racing on one connection cannot both
/// start. Clones share the same slot.
#[derive(Clone, Default)]
pub struct RunSlot {
    inner: Arc<Mutex<Option<ActiveRun>>>,
}

impl RunSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.inner.lock().unwrap_or_else(|e| {
            warn!("run slot lock was poisoned, recovering");
            e.into_inner()
        })
    }

    /// Id of the active run, if any.
    pub fn active(&self) -> Option<RunId> {
        self.lock().as_ref().map(|a| a.run_id)
    }

    pub fn is_busy(&self) -> bool {
        self.lock().is_some()
    }

    /// Occupy the slot for `run_id`. Returns `None` when a run is already active.
    pub(crate) fn try_claim(&self, run_id: RunId) -> Option<CancelRx> {
        let mut slot = self.lock();
        if slot.is_some() {
            return None;
        }
        let (cancel, rx) = watch::channel(None);
        *slot = Some(ActiveRun { run_id, cancel });
        Some(rx)
    }

    /// Ask the active run to stop. A no-op when nothing is running or the run
    /// was already asked; returns the run id when a run was signalled.
    pub fn interrupt(&self, reason: InterruptReason) -> Option<RunId> {
        let slot = self.lock();
        let active = slot.as_ref()?;
        let first = active.cancel.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if first {
            debug!(run_id = %active.run_id, reason = %reason, "interrupt requested");
        }
        Some(active.run_id)
    }

    /// Free the slot, but only if it still belongs to `run_id`.
    pub(crate) fn release(&self, run_id: RunId) {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|a| a.run_id == run_id) {
            *slot = None;
        }
    }
}

impl std::fmt::Debug for RunSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunSlot").field("active", &self.active()).finish()
    }
}
