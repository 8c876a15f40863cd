//! Handler registry - append-only handler lists per god.
//!
//! Handlers come in two flavors:
//!
//! | Flavor   | Registered via              | Runs on                   |
//! |----------|-----------------------------|---------------------------|
//! | Blocking | `Engine::register`          | tokio blocking pool       |
//! | Async    | `Engine::register_async`    | a spawned tokio task      |
//!
//! Both are erased into a [`HandlerEntry`] whose launcher spawns the
//! invocation and hands back its `JoinHandle`. Dropping that handle detaches
//! the invocation rather than cancelling it, which is what lets the
//! dispatcher give up waiting without stopping the handler.
//!
//! # Example
//!
//! ```ignore
//! use pantheon::{async_trait, Handler};
//!
//! struct PublishHandler {
//!     client: async_nats::Client,
//! }
//!
//! #[async_trait]
//! impl Handler<Offering> for PublishHandler {
//!     async fn handle(&self, event: &Offering) -> anyhow::Result<()> {
//!         self.client.publish("offerings", event.to_bytes()).await?;
//!         Ok(())
//!     }
//! }
//!
//! engine.register_async("God_1", PublishHandler { client });
//! ```

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;

use crate::core::{Event, TopicKey};

/// Async handler for events of type `E`.
///
/// Errors are logged at the dispatch boundary and never reach the worker
/// loop or other handlers.
#[async_trait]
pub trait Handler<E: Event>: Send + Sync + 'static {
    /// Called once per event delivered to the god this handler is registered on.
    async fn handle(&self, event: &E) -> Result<()>;
}

type LaunchFn<E> = dyn Fn(E, OwnedSemaphorePermit) -> JoinHandle<Result<()>> + Send + Sync;

/// Type-erased handler, cheap to clone into snapshots.
pub(crate) struct HandlerEntry<E> {
    name: &'static str,
    launch: Arc<LaunchFn<E>>,
}

impl<E> Clone for HandlerEntry<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            launch: self.launch.clone(),
        }
    }
}

impl<E: Event> HandlerEntry<E> {
    /// Wrap a blocking closure. Each invocation runs on the blocking pool.
    pub fn blocking<F>(handler: F) -> Self
    where
        F: Fn(&E) -> Result<()> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);

        Self {
            name: std::any::type_name::<F>(),
            launch: Arc::new(move |event: E, permit: OwnedSemaphorePermit| {
                let handler = handler.clone();
                tokio::task::spawn_blocking(move || {
                    // Held until the handler returns, timed out or not.
                    let _permit = permit;
                    handler(&event)
                })
            }),
        }
    }

    /// Wrap an async handler. Each invocation runs as its own task.
    pub fn from_async<H: Handler<E>>(handler: H) -> Self {
        let handler = Arc::new(handler);

        Self {
            name: std::any::type_name::<H>(),
            launch: Arc::new(move |event: E, permit: OwnedSemaphorePermit| {
                let handler = handler.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    handler.handle(&event).await
                })
            }),
        }
    }

    /// Handler type name (for diagnostics).
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Start an invocation. The permit is released when it finishes.
    pub fn launch(&self, event: E, permit: OwnedSemaphorePermit) -> JoinHandle<Result<()>> {
        (self.launch)(event, permit)
    }
}

impl<E> std::fmt::Debug for HandlerEntry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Maps each god to its handlers in registration order.
///
/// Entries are never removed. Reads go through [`snapshot`](Self::snapshot),
/// which clones the list so no shard lock is held while handlers run.
pub(crate) struct HandlerRegistry<K, E> {
    handlers: DashMap<K, Vec<HandlerEntry<E>>>,
}

impl<K: TopicKey, E: Event> HandlerRegistry<K, E> {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Append a handler to `god`'s list.
    pub fn register(&self, god: K, entry: HandlerEntry<E>) {
        self.handlers.entry(god).or_default().push(entry);
    }

    /// Point-in-time copy of `god`'s handlers (empty if none).
    pub fn snapshot(&self, god: &K) -> Vec<HandlerEntry<E>> {
        self.handlers
            .get(god)
            .map(|entries| entries.value().clone())
            .unwrap_or_default()
    }

    /// Number of handlers registered for `god`.
    pub fn handler_count(&self, god: &K) -> usize {
        self.handlers.get(god).map(|entries| entries.len()).unwrap_or(0)
    }

    /// Gods with at least one handler, in no particular order.
    pub fn gods(&self) -> Vec<K> {
        self.handlers.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl<K, E> std::fmt::Debug for HandlerRegistry<K, E>
where
    K: TopicKey,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("god_count", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    fn permit() -> OwnedSemaphorePermit {
        Arc::new(Semaphore::new(1)).try_acquire_owned().unwrap()
    }

    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler<u32> for CountingHandler {
        async fn handle(&self, event: &u32) -> Result<()> {
            self.count.fetch_add(*event as usize, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_snapshot_of_unknown_god_is_empty() {
        let registry: HandlerRegistry<String, u32> = HandlerRegistry::new();
        assert!(registry.snapshot(&"nobody".to_string()).is_empty());
        assert_eq!(registry.handler_count(&"nobody".to_string()), 0);
    }

    #[test]
    fn test_register_preserves_order() {
        let registry: HandlerRegistry<String, u32> = HandlerRegistry::new();
        registry.register("A".to_string(), HandlerEntry::blocking(|_: &u32| Ok(())));
        registry.register(
            "A".to_string(),
            HandlerEntry::from_async(CountingHandler {
                count: Arc::new(AtomicUsize::new(0)),
            }),
        );

        let snapshot = registry.snapshot(&"A".to_string());
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot[0].name().contains("closure"));
        assert!(snapshot[1].name().ends_with("CountingHandler"));
        assert_eq!(registry.gods(), vec!["A".to_string()]);
    }

    #[test]
    fn test_snapshot_is_stable_across_later_registration() {
        let registry: HandlerRegistry<String, u32> = HandlerRegistry::new();
        registry.register("A".to_string(), HandlerEntry::blocking(|_: &u32| Ok(())));

        let snapshot = registry.snapshot(&"A".to_string());
        registry.register("A".to_string(), HandlerEntry::blocking(|_: &u32| Ok(())));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.handler_count(&"A".to_string()), 2);
    }

    #[tokio::test]
    async fn test_blocking_entry_launch_runs_handler() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let entry = HandlerEntry::blocking(move |event: &u32| {
            seen.fetch_add(*event as usize, Ordering::SeqCst);
            Ok(())
        });

        entry.launch(7, permit()).await.unwrap().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn test_async_entry_launch_runs_handler() {
        let count = Arc::new(AtomicUsize::new(0));
        let entry = HandlerEntry::from_async(CountingHandler {
            count: count.clone(),
        });

        entry.launch(3, permit()).await.unwrap().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permit_released_after_invocation() {
        let semaphore = Arc::new(Semaphore::new(1));
        let entry = HandlerEntry::blocking(|_: &u32| Ok(()));

        let permit = semaphore.clone().try_acquire_owned().unwrap();
        assert_eq!(semaphore.available_permits(), 0);

        entry.launch(1, permit).await.unwrap().unwrap();
        assert_eq!(semaphore.available_permits(), 1);
    }
}
