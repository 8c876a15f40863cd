//! # Pantheon
//!
//! An in-process publish/dispatch engine. Producers push events tagged with
//! a god (a topic key); the engine fans each event out to every handler
//! registered for that god, waiting on each handler for a bounded time so a
//! slow handler cannot stall delivery.
//!
//! ## Architecture
//!
//! ```text
//! producers ──push──► QueueStore (one FIFO per god, first-seen order)
//!                          │
//!                          ▼ one event per god per pass
//!                     worker loop ──► Dispatcher ──► handler 1 ─┐ (≤ deadline)
//!                                        │          handler 2 ─┤
//!                                        │          ...        ─┘
//!                                        └── snapshot ◄── HandlerRegistry ◄──register
//! ```
//!
//! ## Guarantees
//!
//! 1. **Per-god FIFO** - events for one god are delivered in push order
//! 2. **Round-robin fairness** - each non-empty god is serviced once per pass
//! 3. **No replay** - handlers only see events dispatched after registration
//! 4. **Isolation** - a failing, panicking, or slow handler affects neither
//!    the other handlers for the same event nor other gods
//! 5. **Bounded waits** - each handler is waited on for at most
//!    `handler_timeout` (100 ms by default)
//!
//! ## Known Limits
//!
//! - **No cancellation**: a handler that misses its deadline keeps running
//!   in the background. The invocation pool (`max_inflight_handlers`) caps
//!   how many such handlers can accumulate.
//! - **Shared invocation pool**: once `max_inflight_handlers` abandoned
//!   handlers are all still running, no handler for any god can start.
//!   Those invocations are skipped and reported as
//!   [`DispatchError::PoolSaturated`] rather than as timeouts, until a slot
//!   frees up.
//! - **No backpressure**: queues are unbounded.
//! - **Drop-on-shutdown**: events still queued at shutdown are discarded.
//! - **In-memory only**: nothing is persisted.
//!
//! ## Example
//!
//! ```ignore
//! use pantheon::Engine;
//!
//! #[derive(Debug, Clone)]
//! struct Offering {
//!     id: u32,
//!     message: String,
//! }
//!
//! let engine: Engine<Offering> = Engine::start();
//!
//! engine.register("God_1", |offering: &Offering| {
//!     println!("[God_1] {}: {}", offering.id, offering.message);
//!     Ok(())
//! });
//!
//! engine.push("God_1", Offering { id: 0, message: "bread".into() });
//!
//! // Or drain synchronously for deterministic control
//! let report = engine.process_events().await;
//!
//! engine.shutdown().await;
//! ```

mod config;
mod core;
mod dispatch;
mod engine;
mod error;
mod queue;
mod registry;
mod stats;
mod worker;


pub use crate::core::{Event, GodId, TopicKey};

pub use config::{
    EngineConfig, DEFAULT_HANDLER_TIMEOUT, DEFAULT_IDLE_WAIT, DEFAULT_MAX_INFLIGHT_HANDLERS,
};

pub use dispatch::DispatchReport;

pub use engine::{Engine, EngineBuilder, EngineState};

pub use error::{DispatchError, EngineError};

pub use registry::Handler;

pub use stats::StatsSnapshot;

// Re-export commonly used external types
pub use async_trait::async_trait;
