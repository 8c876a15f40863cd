//! Counters describing what the engine has done so far.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters shared by the facade, the dispatcher, and the worker.
#[derive(Debug, Default)]
pub(crate) struct EngineStats {
    events_pushed: AtomicU64,
    events_dispatched: AtomicU64,
    events_dropped: AtomicU64,
    handler_deliveries: AtomicU64,
    handler_failures: AtomicU64,
    handler_timeouts: AtomicU64,
    pool_saturations: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_push(&self) {
        self.events_pushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, n: u64) {
        self.events_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_delivery(&self) {
        self.handler_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.handler_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pool_saturation(&self) {
        self.pool_saturations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_pushed: self.events_pushed.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            handler_deliveries: self.handler_deliveries.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            handler_timeouts: self.handler_timeouts.load(Ordering::Relaxed),
            pool_saturations: self.pool_saturations.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the engine's counters.
///
/// Counters are read independently, so a snapshot taken while the engine is
/// busy may be slightly inconsistent across fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Events accepted by `push`.
    pub events_pushed: u64,
    /// Events dequeued and handed to the dispatcher.
    pub events_dispatched: u64,
    /// Events discarded at or after shutdown.
    pub events_dropped: u64,
    /// Handler invocations that completed successfully within the deadline.
    pub handler_deliveries: u64,
    /// Handler invocations that returned an error or panicked.
    pub handler_failures: u64,
    /// Handler invocations abandoned at the deadline.
    pub handler_timeouts: u64,
    /// Handler invocations skipped because no pool slot freed up in time.
    pub pool_saturations: u64,
}
