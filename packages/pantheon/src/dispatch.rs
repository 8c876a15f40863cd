//! Bounded dispatcher - fans one event out to a god's handlers.
//!
//! For each handler in registration order the dispatcher:
//! 1. Acquires a slot in the invocation pool
//! 2. Launches the invocation on its own task
//! 3. Waits for it, up to the handler deadline
//!
//! Slot acquisition and completion share one deadline. A handler still
//! running when the deadline passes is abandoned: its `JoinHandle` is
//! dropped, which detaches the task without cancelling it. The handler keeps
//! its pool slot until it actually returns, so the pool bounds how many
//! abandoned handlers can pile up.
//!
//! If no slot frees up before the deadline the handler is never launched.
//! That is reported as [`DispatchError::PoolSaturated`], not as a timeout,
//! since the god being dispatched is not the one holding the slots.
//!
//! Handler errors and panics stop here. They are logged, counted, and
//! returned in the [`DispatchReport`], and the next handler runs regardless.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tracing::{error, trace, warn};

use crate::core::{Event, TopicKey};
use crate::error::DispatchError;
use crate::registry::{HandlerEntry, HandlerRegistry};
use crate::stats::EngineStats;

/// What happened when one or more events were dispatched.
///
/// Purely informational: dispatch never fails as a whole.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Events handed to the dispatcher.
    pub events: usize,
    /// Handler invocations that completed successfully in time.
    pub delivered: usize,
    /// Everything that did not.
    pub errors: Vec<DispatchError>,
}

impl DispatchReport {
    /// Number of handler invocations abandoned at the deadline.
    pub fn timeouts(&self) -> usize {
        self.errors.iter().filter(|e| e.is_timeout()).count()
    }

    /// Number of handler invocations that failed or panicked.
    pub fn failures(&self) -> usize {
        self.errors.iter().filter(|e| e.is_failure()).count()
    }

    /// Number of handlers skipped because the invocation pool was full.
    pub fn pool_saturations(&self) -> usize {
        self.errors.iter().filter(|e| e.is_pool_saturated()).count()
    }

    /// True if every invocation completed successfully.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: DispatchReport) {
        self.events += other.events;
        self.delivered += other.delivered;
        self.errors.extend(other.errors);
    }
}

/// Invokes a god's handlers with a per-handler wait budget.
pub(crate) struct Dispatcher<K, E> {
    registry: Arc<HandlerRegistry<K, E>>,
    permits: Arc<Semaphore>,
    handler_timeout: Duration,
    stats: Arc<EngineStats>,
}

impl<K: TopicKey, E: Event> Dispatcher<K, E> {
    pub fn new(
        registry: Arc<HandlerRegistry<K, E>>,
        handler_timeout: Duration,
        max_inflight_handlers: usize,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            registry,
            permits: Arc::new(Semaphore::new(max_inflight_handlers)),
            handler_timeout,
            stats,
        }
    }

    /// Deliver `event` to every handler registered for `god`.
    ///
    /// Handlers run one after another. The handler list is snapshotted up
    /// front, so registrations racing with this call take effect on the
    /// next event.
    pub async fn dispatch_one(&self, god: &K, event: E) -> DispatchReport {
        self.stats.record_dispatch();

        let handlers = self.registry.snapshot(god);
        let mut report = DispatchReport {
            events: 1,
            ..Default::default()
        };

        if handlers.is_empty() {
            trace!(god = %god, "no handlers registered, event discarded");
            return report;
        }

        for handler in &handlers {
            match self.invoke(god, handler, event.clone()).await {
                Ok(()) => {
                    self.stats.record_delivery();
                    report.delivered += 1;
                }
                Err(err) => {
                    match &err {
                        DispatchError::HandlerTimeout { .. } => {
                            self.stats.record_timeout();
                            warn!(
                                god = %god,
                                handler = handler.name(),
                                timeout_ms = self.handler_timeout.as_millis() as u64,
                                "handler for god \"{}\" timed out",
                                god
                            );
                        }
                        DispatchError::HandlerFailed { message, .. } => {
                            self.stats.record_failure();
                            error!(
                                god = %god,
                                handler = handler.name(),
                                error = %message,
                                "handler failed"
                            );
                        }
                        DispatchError::HandlerPanicked { message, .. } => {
                            self.stats.record_failure();
                            error!(
                                god = %god,
                                handler = handler.name(),
                                panic = %message,
                                "handler panicked"
                            );
                        }
                        DispatchError::PoolSaturated { waited, .. } => {
                            self.stats.record_pool_saturation();
                            warn!(
                                god = %god,
                                handler = handler.name(),
                                waited_ms = waited.as_millis() as u64,
                                "handler for god \"{}\" not started: invocation pool saturated",
                                god
                            );
                        }
                    }
                    report.errors.push(err);
                }
            }
        }

        report
    }

    async fn invoke(
        &self,
        god: &K,
        handler: &HandlerEntry<E>,
        event: E,
    ) -> Result<(), DispatchError> {
        let deadline = Instant::now() + self.handler_timeout;
        let permit = match timeout_at(deadline, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => {
                return Err(DispatchError::HandlerFailed {
                    god: god.to_string(),
                    handler: handler.name(),
                    message: "invocation pool closed".to_string(),
                })
            }
            Err(_elapsed) => {
                return Err(DispatchError::PoolSaturated {
                    god: god.to_string(),
                    handler: handler.name(),
                    waited: self.handler_timeout,
                })
            }
        };

        // Dropping the JoinHandle on timeout detaches the task; it is not aborted.
        match timeout_at(deadline, handler.launch(event, permit)).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(DispatchError::HandlerFailed {
                god: god.to_string(),
                handler: handler.name(),
                message: format!("{e:#}"),
            }),
            Ok(Err(join_err)) if join_err.is_panic() => Err(DispatchError::HandlerPanicked {
                god: god.to_string(),
                handler: handler.name(),
                message: extract_panic_message(&join_err.into_panic()),
            }),
            Ok(Err(join_err)) => Err(DispatchError::HandlerFailed {
                god: god.to_string(),
                handler: handler.name(),
                message: join_err.to_string(),
            }),
            Err(_elapsed) => Err(DispatchError::HandlerTimeout {
                god: god.to_string(),
                handler: handler.name(),
                timeout: self.handler_timeout,
            }),
        }
    }
}

/// Extract a message from a panic payload.
fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<K, E> std::fmt::Debug for Dispatcher<K, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handler_timeout", &self.handler_timeout)
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Handler;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::sync::Mutex;

    const TIMEOUT: Duration = Duration::from_millis(50);

    fn setup(max_inflight: usize) -> (Arc<HandlerRegistry<String, u32>>, Dispatcher<String, u32>) {
        let registry = Arc::new(HandlerRegistry::new());
        let dispatcher = Dispatcher::new(
            registry.clone(),
            TIMEOUT,
            max_inflight,
            Arc::new(EngineStats::new()),
        );
        (registry, dispatcher)
    }

    fn recorder(log: &Arc<Mutex<Vec<(&'static str, u32)>>>, tag: &'static str) -> HandlerEntry<u32> {
        let log = log.clone();
        HandlerEntry::blocking(move |event: &u32| {
            log.lock().unwrap().push((tag, *event));
            Ok(())
        })
    }

    struct NeverReturns;

    #[async_trait]
    impl Handler<u32> for NeverReturns {
        async fn handle(&self, _event: &u32) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_no_handlers_is_not_an_error() {
        let (_registry, dispatcher) = setup(4);
        let report = dispatcher.dispatch_one(&"A".to_string(), 1).await;
        assert_eq!(report.events, 1);
        assert_eq!(report.delivered, 0);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_fans_out_in_registration_order() {
        let (registry, dispatcher) = setup(4);
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register("A".to_string(), recorder(&log, "H1"));
        registry.register("A".to_string(), recorder(&log, "H2"));

        let report = dispatcher.dispatch_one(&"A".to_string(), 9).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(*log.lock().unwrap(), vec![("H1", 9), ("H2", 9)]);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_the_next() {
        let (registry, dispatcher) = setup(4);
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(
            "A".to_string(),
            HandlerEntry::blocking(|event: &u32| Err(anyhow!("rejected offering {}", event))),
        );
        registry.register("A".to_string(), recorder(&log, "H2"));

        let report = dispatcher.dispatch_one(&"A".to_string(), 5).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures(), 1);
        assert!(report.errors[0].to_string().contains("rejected offering 5"));
        assert_eq!(*log.lock().unwrap(), vec![("H2", 5)]);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_caught() {
        let (registry, dispatcher) = setup(4);
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(
            "A".to_string(),
            HandlerEntry::blocking(|_: &u32| -> Result<()> { panic!("handler exploded") }),
        );
        registry.register("A".to_string(), recorder(&log, "H2"));

        let report = dispatcher.dispatch_one(&"A".to_string(), 1).await;

        assert_eq!(report.delivered, 1);
        assert!(matches!(
            &report.errors[0],
            DispatchError::HandlerPanicked { message, .. } if message == "handler exploded"
        ));
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_reported_once_and_dispatch_moves_on() {
        let (registry, dispatcher) = setup(4);
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register("A".to_string(), HandlerEntry::from_async(NeverReturns));
        registry.register("A".to_string(), recorder(&log, "H2"));

        let started = std::time::Instant::now();
        let report = dispatcher.dispatch_one(&"A".to_string(), 1).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.timeouts(), 1);
        assert_eq!(report.errors[0].god(), "A");
        assert_eq!(report.delivered, 1);
        assert_eq!(*log.lock().unwrap(), vec![("H2", 1)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_handler_keeps_running() {
        let (registry, dispatcher) = setup(4);
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = finished.clone();
        registry.register(
            "A".to_string(),
            HandlerEntry::blocking(move |_: &u32| {
                std::thread::sleep(Duration::from_millis(150));
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }),
        );

        let report = dispatcher.dispatch_one(&"A".to_string(), 1).await;
        assert_eq!(report.timeouts(), 1);
        assert!(!finished.load(std::sync::atomic::Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(finished.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_saturated_pool_is_reported_apart_from_timeouts() {
        let stats = Arc::new(EngineStats::new());
        let registry = Arc::new(HandlerRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone(), TIMEOUT, 2, stats.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register("slow".to_string(), HandlerEntry::from_async(NeverReturns));
        registry.register("fast".to_string(), recorder(&log, "H"));

        // Abandoned handlers end up holding every slot.
        for event in 0..2 {
            let report = dispatcher.dispatch_one(&"slow".to_string(), event).await;
            assert_eq!(report.timeouts(), 1);
        }

        let started = std::time::Instant::now();
        let report = dispatcher.dispatch_one(&"fast".to_string(), 7).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.pool_saturations(), 1);
        assert_eq!(report.timeouts(), 0);
        assert_eq!(report.failures(), 0);
        assert!(matches!(
            &report.errors[0],
            DispatchError::PoolSaturated { god, .. } if god == "fast"
        ));
        assert!(log.lock().unwrap().is_empty());

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.handler_timeouts, 2);
        assert_eq!(snapshot.pool_saturations, 1);
        assert_eq!(snapshot.handler_failures, 0);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn lines(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.0.lock().unwrap())
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    #[tokio::test]
    async fn test_diagnostics_name_the_god_once() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (registry, dispatcher) = setup(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register("slow".to_string(), HandlerEntry::from_async(NeverReturns));
        registry.register("fast".to_string(), recorder(&log, "H"));

        dispatcher.dispatch_one(&"slow".to_string(), 1).await;
        // The abandoned handler still holds the only slot.
        dispatcher.dispatch_one(&"fast".to_string(), 2).await;

        let lines = logs.lines();
        let timed_out: Vec<_> = lines.iter().filter(|l| l.contains("timed out")).collect();
        assert_eq!(timed_out.len(), 1, "{lines:?}");
        assert!(timed_out[0].contains("handler for god \"slow\" timed out"));
        assert!(timed_out[0].contains("god=slow"));
        assert!(timed_out[0].contains("timeout_ms=50"));

        let skipped: Vec<_> = lines.iter().filter(|l| l.contains("not started")).collect();
        assert_eq!(skipped.len(), 1, "{lines:?}");
        assert!(skipped[0].contains("handler for god \"fast\" not started"));
        assert!(skipped[0].contains("god=fast"));
    }

    #[test]
    fn test_report_merge_and_counts() {
        let mut report = DispatchReport {
            events: 1,
            delivered: 2,
            errors: vec![DispatchError::HandlerTimeout {
                god: "A".to_string(),
                handler: "h",
                timeout: TIMEOUT,
            }],
        };
        report.merge(DispatchReport {
            events: 1,
            delivered: 1,
            errors: vec![
                DispatchError::HandlerFailed {
                    god: "B".to_string(),
                    handler: "h",
                    message: "nope".to_string(),
                },
                DispatchError::PoolSaturated {
                    god: "C".to_string(),
                    handler: "h",
                    waited: TIMEOUT,
                },
            ],
        });

        assert_eq!(report.events, 2);
        assert_eq!(report.delivered, 3);
        assert_eq!(report.timeouts(), 1);
        assert_eq!(report.failures(), 1);
        assert_eq!(report.pool_saturations(), 1);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_extract_panic_message() {
        let s: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(extract_panic_message(&s), "static");
        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(extract_panic_message(&owned), "owned");
        let other: Box<dyn std::any::Any + Send> = Box::new(42);
        assert_eq!(extract_panic_message(&other), "unknown panic");
    }
}
