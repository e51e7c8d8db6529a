use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::engine::Engine;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool size must be at least 1")]
    InvalidSize,

    #[error("worker pool is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, PoolError>;

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// An inference-capable worker. Workers are fungible; the id only shows up
/// in logs.
pub struct Worker {
    id: usize,
    engine: Arc<dyn Engine>,
}

impl Worker {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("engine", &self.engine.name())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

struct PoolInner {
    capacity: usize,
    free: Mutex<Vec<Worker>>,
    permits: Arc<Semaphore>,
    waiting: AtomicUsize,
}

impl PoolInner {
    fn free_list(&self) -> MutexGuard<'_, Vec<Worker>> {
        self.free.lock().unwrap_or_else(|e| {
            warn!("worker pool lock was poisoned, recovering");
            e.into_inner()
        })
    }
}

/// Fixed set of workers lent out one at a time.
///
/// A worker is only reachable through the [`WorkerGuard`] returned by
/// [`acquire`](Self::acquire), and goes back to the free list when the guard
/// drops. Waiters are served in arrival order. Cancelling an `acquire` future
/// (dropping it) leaves the pool untouched.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Build a pool of `size` workers, one engine per worker from `factory`.
    pub fn new<F>(size: usize, mut factory: F) -> Result<Self>
    where
        F: FnMut(usize) -> Arc<dyn Engine>,
    {
        if size == 0 {
            return Err(PoolError::InvalidSize);
        }
        let workers = (0..size)
            .map(|id| Worker {
                id,
                engine: factory(id),
            })
            .collect();
        info!(size, "creating WorkerPool");
        Ok(Self {
            inner: Arc::new(PoolInner {
                capacity: size,
                free: Mutex::new(workers),
                permits: Arc::new(Semaphore::new(size)),
                waiting: AtomicUsize::new(0),
            }),
        })
    }

    /// Wait for a free worker.
    ///
    /// Exhaustion is a wait, never an error. Fails only once the pool has
    /// been [closed](Self::close).
    pub async fn acquire(&self) -> Result<WorkerGuard> {
        let permit = {
            let _waiting = WaitingGuard::enter(&self.inner.waiting);
            self.inner
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| PoolError::Closed)?
        };

        // A permit is only ever handed out while a worker sits in the list.
        let worker = self.inner.free_list().pop().ok_or(PoolError::Closed)?;
        debug!(worker = worker.id, "worker acquired");
        Ok(WorkerGuard {
            worker,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Workers not currently lent out.
    pub fn free_count(&self) -> usize {
        self.inner.free_list().len()
    }

    /// Workers currently lent out.
    pub fn busy_count(&self) -> usize {
        self.capacity().saturating_sub(self.free_count())
    }

    /// Callers currently suspended in [`acquire`](Self::acquire).
    pub fn waiting(&self) -> usize {
        self.inner.waiting.load(Ordering::SeqCst)
    }

    /// Fail pending and future acquisitions. Workers already lent out are
    /// still returned normally.
    pub fn close(&self) {
        if !self.inner.permits.is_closed() {
            info!("closing WorkerPool");
            self.inner.permits.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.capacity())
            .field("free", &self.free_count())
            .field("waiting", &self.waiting())
            .finish()
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// WorkerGuard
// ---------------------------------------------------------------------------

/// Exclusive loan of one worker. Dropping it returns the worker exactly once.
pub struct WorkerGuard {
    worker: Worker,
    pool: Arc<PoolInner>,
    // Released after `drop` has pushed the worker back.
    _permit: OwnedSemaphorePermit,
}

impl WorkerGuard {
    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn id(&self) -> usize {
        self.worker.id
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.worker.engine
    }
}

impl std::ops::Deref for WorkerGuard {
    type Target = Worker;

    fn deref(&self) -> &Worker {
        &self.worker
    }
}

impl fmt::Debug for WorkerGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WorkerGuard").field(&self.worker).finish()
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        debug!(worker = self.worker.id, "worker released");
        self.pool.free_list().push(Worker {
            id: self.worker.id,
            engine: Arc::clone(&self.worker.engine),
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEngine;
    use std::collections::HashSet;
    use std::time::Duration;

    fn pool(size: usize) -> WorkerPool {
        let engine: Arc<dyn Engine> = Arc::new(MockEngine::new());
        WorkerPool::new(size, |_| engine.clone()).unwrap()
    }

    #[test]
    fn zero_size_is_rejected() {
        let engine: Arc<dyn Engine> = Arc::new(MockEngine::new());
        assert_eq!(
            WorkerPool::new(0, |_| engine.clone()).unwrap_err(),
            PoolError::InvalidSize
        );
    }

    #[tokio::test]
    async fn guards_hold_distinct_workers() {
        let p = pool(3);
        let a = p.acquire().await.unwrap();
        let b = p.acquire().await.unwrap();
        let c = p.acquire().await.unwrap();
        let ids: HashSet<usize> = [a.id(), b.id(), c.id()].into_iter().collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(p.free_count(), 0);
        assert_eq!(p.busy_count(), 3);

        drop(b);
        assert_eq!(p.free_count(), 1);
        drop(a);
        drop(c);
        assert_eq!(p.free_count(), 3);
    }

    #[tokio::test]
    async fn exhausted_pool_waits_then_serves() {
        let p = pool(1);
        let held = p.acquire().await.unwrap();

        let p2 = p.clone();
        let waiter = tokio::spawn(async move { p2.acquire().await.map(|g| g.id()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(p.waiting(), 1);
        assert!(!waiter.is_finished());

        let held_id = held.id();
        drop(held);
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got, held_id);
        assert_eq!(p.waiting(), 0);
        assert_eq!(p.free_count(), 1);
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let p = pool(1);
        let held = p.acquire().await.unwrap();
        let (tx, rx) = std::sync::mpsc::channel();

        let mut handles = Vec::new();
        for n in 0..3 {
            let p = p.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let guard = p.acquire().await.unwrap();
                tx.send(n).unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(guard);
            }));
            // let each waiter enqueue before spawning the next
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(held);
        for h in handles {
            h.await.unwrap();
        }
        drop(tx);
        let order: Vec<i32> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn cancelled_acquire_has_no_side_effects() {
        let p = pool(1);
        let held = p.acquire().await.unwrap();

        let attempt = tokio::time::timeout(Duration::from_millis(20), p.acquire()).await;
        assert!(attempt.is_err());
        assert_eq!(p.waiting(), 0);

        drop(held);
        assert_eq!(p.free_count(), 1);
        let again = p.acquire().await.unwrap();
        assert_eq!(p.free_count(), 0);
        drop(again);
    }

    #[tokio::test]
    async fn close_fails_pending_and_future_acquires() {
        let p = pool(1);
        let held = p.acquire().await.unwrap();

        let p2 = p.clone();
        let waiter = tokio::spawn(async move { p2.acquire().await.map(|g| g.id()) });
        tokio::time::sleep(Duration::from_millis(20)).await;

        p.close();
        assert_eq!(waiter.await.unwrap(), Err(PoolError::Closed));
        assert_eq!(p.acquire().await.unwrap_err(), PoolError::Closed);

        // Loans outstanding at close still come back.
        drop(held);
        assert_eq!(p.free_count(), 1);
        assert!(p.is_closed());
    }
}
