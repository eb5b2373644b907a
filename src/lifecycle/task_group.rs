//! Tracked task spawning.
//!
//! # Responsibilities
//! - Spawn units of work as independent tokio tasks
//! - Count outstanding tasks, decrementing on every exit path (including panic)
//! - Let a caller wait for the count to reach zero, optionally with a deadline
//! - Abort whatever is still running once a drain deadline has passed

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{oneshot, Notify};
use tokio::task::{AbortHandle, JoinHandle};

struct Inner {
    active: AtomicUsize,
    next_id: AtomicU64,
    handles: DashMap<u64, AbortHandle>,
    idle: Notify,
}

/// A group of spawned tasks that can be joined as a whole.
///
/// Cloning is cheap; clones share the same counter.
#[derive(Clone)]
pub struct TaskGroup {
    inner: Arc<Inner>,
}

impl TaskGroup {
    /// Create an empty group.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                active: AtomicUsize::new(0),
                next_id: AtomicU64::new(0),
                handles: DashMap::new(),
                idle: Notify::new(),
            }),
        }
    }

    /// Register `task` with the group and spawn it onto the runtime.
    ///
    /// The task counts as outstanding until its future completes, panics or
    /// is aborted.
    pub fn wrap<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let guard = self.track();
        let id = guard.id;
        let (registered_tx, registered_rx) = oneshot::channel::<()>();

        // The task holds off until its abort handle is recorded, so the guard
        // can never remove the entry before it exists.
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let _ = registered_rx.await;
            task.await
        });

        self.inner.handles.insert(id, handle.abort_handle());
        let _ = registered_tx.send(());
        handle
    }

    fn track(&self) -> TaskGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        TaskGuard {
            inner: Arc::clone(&self.inner),
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Number of tasks that have not finished yet.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Wait until every task spawned through this group has finished.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Like [`wait`](Self::wait), but give up after `timeout`.
    ///
    /// Returns `true` if the group drained in time.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }

    /// Abort every task still running. Returns how many were signalled.
    pub fn abort_all(&self) -> usize {
        let mut aborted = 0;
        for entry in self.inner.handles.iter() {
            entry.value().abort();
            aborted += 1;
        }
        aborted
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("active", &self.active())
            .finish()
    }
}

/// Marks one task as finished when dropped.
struct TaskGuard {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.inner.handles.remove(&self.id);
        if self.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}
