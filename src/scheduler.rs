//! Coalesced, delayed publication.
//!
//! `schedule` keeps at most one pending task per key: a new call aborts the
//! previous handle and bumps the generation, and a task only runs its action
//! if it still owns the key when its delay expires. `debounce_gate` is a
//! plain rate limiter and never defers anything.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::registry::ControlKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Config,
    Availability,
    DebouncedState,
}

/// Coalescing key: (device, control, kind).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub control: ControlKey,
    pub kind: TaskKind,
}

impl TaskKey {
    pub fn new(control: &ControlKey, kind: TaskKind) -> Self {
        Self {
            control: control.clone(),
            kind,
        }
    }
}

struct PendingTask {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    pending: DashMap<TaskKey, PendingTask>,
    next_generation: AtomicU64,
    last_published: DashMap<TaskKey, Instant>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            next_generation: AtomicU64::new(0),
            last_published: DashMap::new(),
        }
    }

    /// Run `action` after `delay`, replacing whatever was pending under `key`.
    pub fn schedule<F>(self: &Arc<Self>, key: TaskKey, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        // The entry guard is held until the new task is installed, so the
        // task cannot claim the key before it is recorded.
        match self.pending.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let handle = self.spawn(key, delay, generation, action);
                let old = entry.insert(PendingTask { generation, handle });
                old.handle.abort();
                tracing::trace!("scheduler: superseded task {}", old.generation);
            }
            Entry::Vacant(entry) => {
                let handle = self.spawn(key, delay, generation, action);
                entry.insert(PendingTask { generation, handle });
            }
        }
    }

    fn spawn<F>(self: &Arc<Self>, key: TaskKey, delay: Duration, generation: u64, action: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if scheduler.claim(&key, generation) {
                action.await;
            }
        })
    }

    /// Remove the key if `generation` still owns it.
    fn claim(&self, key: &TaskKey, generation: u64) -> bool {
        self.pending
            .remove_if(key, |_, task| task.generation == generation)
            .is_some()
    }

    /// Rate limiter: false if the last accepted publish under `key` was less
    /// than `interval` ago, otherwise records now and returns true.
    pub fn debounce_gate(&self, key: &TaskKey, interval: Duration) -> bool {
        let now = Instant::now();
        match self.last_published.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) < interval {
                    false
                } else {
                    entry.insert(now);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    pub fn is_pending(&self, key: &TaskKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Abort everything still waiting. Used on shutdown.
    pub fn cancel_all(&self) {
        let count = self.pending.len();
        self.pending.retain(|_, task| {
            task.handle.abort();
            false
        });
        if count > 0 {
            tracing::debug!("scheduler: cancelled {} pending tasks", count);
        }
    }
}
