//! Fairness worker loop.
//!
//! Each pass takes the list of known gods (first-seen order) and pops at
//! most one event per god, dispatching it before moving to the next god:
//!
//! ```text
//! queues:  A: [A0, A1, A2]   B: [B0]   C: [C0, C1]
//! pass 1:  A0  B0  C0
//! pass 2:  A1  C1
//! pass 3:  A2
//! ```
//!
//! A god with a deep backlog therefore delays a lighter god by at most one
//! pass. Gods first pushed to while a pass is running are picked up on the
//! next pass.

use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::core::{Event, TopicKey};
use crate::dispatch::DispatchReport;
use crate::engine::Shared;

impl<K: TopicKey, E: Event> Shared<K, E> {
    /// Run one round-robin pass over every known god.
    ///
    /// The queue lock is only held inside `gods()` and `try_pop()`, never
    /// across a dispatch. With `honor_stop` set, the pass ends early once
    /// shutdown has been requested.
    pub(crate) async fn drain_pass(&self, honor_stop: bool) -> DispatchReport {
        let mut report = DispatchReport::default();

        for god in self.queues.gods() {
            if honor_stop && self.is_stopping() {
                break;
            }
            if let Some(event) = self.queues.try_pop(&god) {
                report.merge(self.dispatcher.dispatch_one(&god, event).await);
            }
        }

        report
    }
}

/// Background loop draining the queues until shutdown is requested.
pub(crate) async fn run<K: TopicKey, E: Event>(shared: Arc<Shared<K, E>>) {
    info!(
        idle_wait_ms = shared.config.idle_wait.as_millis() as u64,
        handler_timeout_ms = shared.config.handler_timeout.as_millis() as u64,
        "pantheon worker starting"
    );

    while !shared.is_stopping() {
        shared
            .queues
            .wait_for_work(shared.config.idle_wait, || shared.is_stopping())
            .await;

        if shared.is_stopping() {
            break;
        }

        let report = {
            let _drain = shared.drain_lock.lock().await;
            shared.drain_pass(true).await
        };

        if report.events == 0 {
            tokio::task::yield_now().await;
        } else if report.is_clean() {
            trace!(events = report.events, delivered = report.delivered, "pass complete");
        } else {
            debug!(
                events = report.events,
                delivered = report.delivered,
                timeouts = report.timeouts(),
                failures = report.failures(),
                pool_saturations = report.pool_saturations(),
                "pass complete with handler errors"
            );
        }
    }

    info!("pantheon worker stopped");
}
