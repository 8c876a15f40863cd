//! Pantheon Engine - registration, push, and worker lifecycle.
//!
//! ```text
//! push(god, event) ──► QueueStore ──► worker pass ──► Dispatcher ──► handlers
//!                      (per-god FIFO)  (round robin)   (bounded wait)
//! register(god, h) ──► HandlerRegistry ─────────────────────┘ (snapshot)
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! Created ──start──► Running ──shutdown──► Stopping ──worker joined──► Stopped
//! ```
//!
//! - `push` during `Stopping` is accepted until the worker has been joined,
//!   then the queues are closed: queued events are discarded and later
//!   pushes are dropped at once.
//! - Shutdown does not flush: events still queued are dropped.
//! - Shutdown never waits on a handler past its deadline; abandoned
//!   handlers keep running on their own.
//!
//! # Usage
//!
//! ```ignore
//! use pantheon::Engine;
//!
//! let engine: Engine<Offering> = Engine::start();
//!
//! engine.register("God_1", |offering: &Offering| {
//!     tracing::info!(id = offering.id, "offering received");
//!     Ok(())
//! });
//!
//! engine.push("God_1", Offering { id: 1, message: "bread".into() });
//!
//! engine.shutdown().await;
//! ```

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::core::{Event, GodId, TopicKey};
use crate::dispatch::{DispatchReport, Dispatcher};
use crate::error::EngineError;
use crate::queue::QueueStore;
use crate::registry::{Handler, HandlerEntry, HandlerRegistry};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::worker;

// =============================================================================
// Engine State
// =============================================================================

/// Where an engine is in its lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    /// Constructed, worker not yet started.
    Created = 0,
    /// Accepting registrations and pushes.
    Running = 1,
    /// Shutdown requested, worker being joined.
    Stopping = 2,
    /// Worker joined and queues discarded.
    Stopped = 3,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EngineState::Created,
            1 => EngineState::Running,
            2 => EngineState::Stopping,
            _ => EngineState::Stopped,
        }
    }
}

// =============================================================================
// Shared State
// =============================================================================

/// Everything the facade and the worker task both need.
pub(crate) struct Shared<K, E> {
    pub(crate) registry: Arc<HandlerRegistry<K, E>>,
    pub(crate) queues: QueueStore<K, E>,
    pub(crate) dispatcher: Dispatcher<K, E>,
    /// Held for a whole worker pass or a whole `process_events` call, so the
    /// two never pop from the same god concurrently.
    pub(crate) drain_lock: tokio::sync::Mutex<()>,
    pub(crate) config: EngineConfig,
    stopping: AtomicBool,
    state: AtomicU8,
    stats: Arc<EngineStats>,
}

impl<K: TopicKey, E: Event> Shared<K, E> {
    fn new(config: EngineConfig) -> Self {
        let registry = Arc::new(HandlerRegistry::new());
        let stats = Arc::new(EngineStats::new());
        let dispatcher = Dispatcher::new(
            registry.clone(),
            config.handler_timeout,
            config.max_inflight_handlers,
            stats.clone(),
        );

        Self {
            registry,
            queues: QueueStore::new(),
            dispatcher,
            drain_lock: tokio::sync::Mutex::new(()),
            config,
            stopping: AtomicBool::new(false),
            state: AtomicU8::new(EngineState::Created as u8),
            stats,
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Raise the stop flag and wake the worker. Returns false if shutdown
    /// was already requested.
    fn request_stop(&self) -> bool {
        let transitioned = self
            .state
            .compare_exchange(
                EngineState::Running as u8,
                EngineState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if transitioned {
            self.stopping.store(true, Ordering::Release);
            self.queues.wake();
        }
        transitioned
    }
}

// =============================================================================
// Engine
// =============================================================================

/// In-process dispatch engine fanning events out to per-god handlers.
///
/// `E` is the event type, `K` the topic key (a god's name by default).
/// The engine exclusively owns its registry and queues; there is no global
/// state, so several engines can coexist.
pub struct Engine<E, K = GodId> {
    shared: Arc<Shared<K, E>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<E: Event, K: TopicKey> Engine<E, K> {
    /// Start an engine with the default configuration.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime. Use
    /// [`EngineBuilder::start`] to get an error instead.
    pub fn start() -> Self {
        Self::launch(EngineConfig::default(), true)
    }

    /// Create an engine builder.
    pub fn builder() -> EngineBuilder<E, K> {
        EngineBuilder::new()
    }

    fn launch(config: EngineConfig, spawn_worker: bool) -> Self {
        let shared = Arc::new(Shared::new(config));

        let worker = if spawn_worker {
            Some(tokio::spawn(worker::run(shared.clone())))
        } else {
            None
        };
        shared.set_state(EngineState::Running);

        info!(
            handler_timeout_ms = shared.config.handler_timeout.as_millis() as u64,
            manual = !spawn_worker,
            "pantheon engine started"
        );

        Self {
            shared,
            worker: Mutex::new(worker),
        }
    }

    /// Register a blocking handler for `god`.
    ///
    /// Each invocation runs on the blocking thread pool, so the handler may
    /// block or spin. Handlers for a god run in registration order and only
    /// see events dispatched after they were registered.
    pub fn register<F>(&self, god: impl Into<K>, handler: F)
    where
        F: Fn(&E) -> Result<()> + Send + Sync + 'static,
    {
        self.register_entry(god.into(), HandlerEntry::blocking(handler));
    }

    /// Register an async handler for `god`.
    pub fn register_async<H: Handler<E>>(&self, god: impl Into<K>, handler: H) {
        self.register_entry(god.into(), HandlerEntry::from_async(handler));
    }

    fn register_entry(&self, god: K, entry: HandlerEntry<E>) {
        if self.shared.state() != EngineState::Running {
            warn!(god = %god, handler = entry.name(), "handler registered on a stopping engine");
        }
        debug!(god = %god, handler = entry.name(), "handler registered");
        self.shared.registry.register(god, entry);
    }

    /// Queue `event` for `god`.
    ///
    /// Never blocks beyond the queue lock. After shutdown the event is
    /// dropped with a warning; use [`try_push`](Self::try_push) to observe
    /// that.
    pub fn push(&self, god: impl Into<K>, event: E) {
        let god = god.into();
        if !self.enqueue(god.clone(), event) {
            warn!(god = %god, "event pushed after shutdown dropped");
        }
    }

    /// Queue `event` for `god`, failing if the engine is stopped.
    pub fn try_push(&self, god: impl Into<K>, event: E) -> Result<(), EngineError> {
        if self.enqueue(god.into(), event) {
            Ok(())
        } else {
            Err(EngineError::Stopped)
        }
    }

    fn enqueue(&self, god: K, event: E) -> bool {
        let accepted = self.shared.queues.push(god, event);
        if accepted {
            self.shared.stats.record_push();
        } else {
            self.shared.stats.record_dropped(1);
        }
        accepted
    }

    /// Drain everything queued right now on the caller's task.
    ///
    /// Runs round-robin passes in the same order as the worker until the
    /// events queued at the time of the call have been dispatched or the
    /// queues are empty. Waits for an in-progress worker pass first.
    pub async fn process_events(&self) -> DispatchReport {
        let _drain = self.shared.drain_lock.lock().await;

        let budget = self.shared.queues.len();
        let mut report = DispatchReport::default();

        while report.events < budget {
            let pass = self.shared.drain_pass(false).await;
            if pass.events == 0 {
                break;
            }
            report.merge(pass);
        }

        debug!(
            events = report.events,
            delivered = report.delivered,
            timeouts = report.timeouts(),
            failures = report.failures(),
            pool_saturations = report.pool_saturations(),
            "manual drain complete"
        );
        report
    }

    /// Stop the worker and discard queued events.
    ///
    /// Sets the stop flag, wakes the worker, and waits for it to finish its
    /// current dispatch. Calling this again, or concurrently, returns
    /// without doing anything.
    pub async fn shutdown(&self) {
        if !self.shared.request_stop() {
            debug!(state = ?self.shared.state(), "shutdown already requested");
            return;
        }
        info!("pantheon engine shutting down");

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }

        let dropped = self.shared.queues.close();
        self.shared.stats.record_dropped(dropped as u64);
        self.shared.set_state(EngineState::Stopped);

        info!(dropped, "pantheon engine stopped");
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    /// Snapshot of the engine's counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Number of events queued and not yet dispatched.
    pub fn pending(&self) -> usize {
        self.shared.queues.len()
    }

    /// Number of handlers registered for `god`.
    pub fn handler_count(&self, god: impl Into<K>) -> usize {
        self.shared.registry.handler_count(&god.into())
    }

    /// Gods with at least one registered handler, in no particular order.
    pub fn gods(&self) -> Vec<K> {
        self.shared.registry.gods()
    }

    /// The configuration this engine runs with.
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }
}

impl<E, K> Drop for Engine<E, K> {
    fn drop(&mut self) {
        // Can't join from Drop; the worker exits once it sees the flag.
        if !self.shared.stopping.swap(true, Ordering::AcqRel) {
            self.shared
                .state
                .store(EngineState::Stopping as u8, Ordering::Release);
            self.shared.queues.wake();
            debug!("engine dropped without shutdown; worker signalled to stop");
        }
    }
}

impl<E, K> std::fmt::Debug for Engine<E, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field(
                "state",
                &EngineState::from_u8(self.shared.state.load(Ordering::Acquire)),
            )
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Engine Builder
// =============================================================================

/// Builder for an [`Engine`] with custom configuration.
///
/// # Example
///
/// ```ignore
/// let engine: Engine<Offering> = Engine::builder()
///     .handler_timeout(Duration::from_millis(250))
///     .max_inflight_handlers(64)
///     .start()?;
/// ```
pub struct EngineBuilder<E, K = GodId> {
    config: EngineConfig,
    spawn_worker: bool,
    _marker: PhantomData<fn() -> (E, K)>,
}

impl<E: Event, K: TopicKey> EngineBuilder<E, K> {
    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            spawn_worker: true,
            _marker: PhantomData,
        }
    }

    /// Replace the whole configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the per-handler wait budget.
    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.config.handler_timeout = timeout;
        self
    }

    /// Set the worker's idle wait bound.
    pub fn idle_wait(mut self, idle_wait: Duration) -> Self {
        self.config.idle_wait = idle_wait;
        self
    }

    /// Set the cap on concurrently running handler invocations.
    pub fn max_inflight_handlers(mut self, max: usize) -> Self {
        self.config.max_inflight_handlers = max;
        self
    }

    /// Don't spawn the background worker. Events are only delivered by
    /// [`Engine::process_events`].
    pub fn manual(mut self) -> Self {
        self.spawn_worker = false;
        self
    }

    /// Validate the configuration and start the engine.
    pub fn start(self) -> Result<Engine<E, K>, EngineError> {
        self.config.validate()?;
        if self.spawn_worker && tokio::runtime::Handle::try_current().is_err() {
            return Err(EngineError::NoRuntime);
        }
        Ok(Engine::launch(self.config, self.spawn_worker))
    }
}

impl<E: Event, K: TopicKey> Default for EngineBuilder<E, K> {
    fn default() -> Self {
        Self::new()
    }
}
