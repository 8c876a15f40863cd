//! Per-god FIFO queues with a wake signal for the worker.
//!
//! # Ordering
//!
//! - Within a god, events leave in the order they were pushed.
//! - Gods are iterated in first-seen order: the order in which each god
//!   received its first push. This fixes the worker's round-robin
//!   interleaving, so it is deterministic for a given push sequence.
//!
//! Every method takes the store's lock for the duration of the call only.
//! Callers pop, release, and then dispatch.
//!
//! Once [`close`](QueueStore::close) has run, pushes are refused. Closing and
//! pushing serialize on the same lock, so every event is either discarded by
//! `close` or refused by `push`.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::Notify;

use crate::core::{Event, TopicKey};

struct Queues<K, E> {
    by_god: IndexMap<K, VecDeque<E>>,
    closed: bool,
}

/// Unbounded per-god event queues.
pub(crate) struct QueueStore<K, E> {
    queues: Mutex<Queues<K, E>>,
    wake: Notify,
}

impl<K: TopicKey, E: Event> QueueStore<K, E> {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(Queues {
                by_god: IndexMap::new(),
                closed: false,
            }),
            wake: Notify::new(),
        }
    }

    // A panic while holding the lock cannot leave a queue half-modified,
    // so a poisoned lock is safe to keep using.
    fn lock(&self) -> MutexGuard<'_, Queues<K, E>> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append `event` to `god`'s queue, creating it on first use, then wake
    /// the worker.
    ///
    /// Returns false, dropping the event, if the store has been closed.
    pub fn push(&self, god: K, event: E) -> bool {
        {
            let mut queues = self.lock();
            if queues.closed {
                return false;
            }
            queues.by_god.entry(god).or_default().push_back(event);
        }
        self.wake.notify_one();
        true
    }

    /// Remove and return the oldest event queued for `god`.
    pub fn try_pop(&self, god: &K) -> Option<E> {
        self.lock()
            .by_god
            .get_mut(god)
            .and_then(|queue| queue.pop_front())
    }

    /// True iff no god has a queued event.
    pub fn is_empty(&self) -> bool {
        self.lock().by_god.values().all(|queue| queue.is_empty())
    }

    /// Total number of queued events across all gods.
    pub fn len(&self) -> usize {
        self.lock().by_god.values().map(|queue| queue.len()).sum()
    }

    /// Every god that has ever been pushed to, in first-seen order.
    pub fn gods(&self) -> Vec<K> {
        self.lock().by_god.keys().cloned().collect()
    }

    /// Refuse further pushes and discard every queued event, returning how
    /// many were dropped.
    ///
    /// Gods stay known, so first-seen order survives.
    pub fn close(&self) -> usize {
        let mut queues = self.lock();
        queues.closed = true;
        let mut dropped = 0;
        for queue in queues.by_god.values_mut() {
            dropped += queue.len();
            queue.clear();
        }
        dropped
    }

    /// Wait until work may be available, for at most `bound`.
    ///
    /// Returns early if `should_return` already holds or a wake arrives. A
    /// push between the check and the wait leaves a stored permit, so the
    /// wait returns immediately. The bound still guarantees a re-check.
    pub async fn wait_for_work(&self, bound: Duration, should_return: impl Fn() -> bool) {
        if should_return() || !self.is_empty() {
            return;
        }
        let _ = tokio::time::timeout(bound, self.wake.notified()).await;
    }
}

impl<K, E> QueueStore<K, E> {
    /// Wake a waiting worker without queuing anything (used on shutdown).
    pub fn wake(&self) {
        self.wake.notify_one();
    }
}

impl<K, E> std::fmt::Debug for QueueStore<K, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStore").finish_non_exhaustive()
    }
}
