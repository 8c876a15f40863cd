//! Engine configuration.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::error::EngineError;

/// How long `dispatch_one` waits for each handler.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_millis(100);

/// Upper bound on a single idle wait of the worker loop.
pub const DEFAULT_IDLE_WAIT: Duration = Duration::from_millis(1);

/// Default cap on concurrently running handler invocations.
pub const DEFAULT_MAX_INFLIGHT_HANDLERS: usize = 256;

/// Tunables for an [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Per-handler wait budget. Handlers still running after this are
    /// abandoned, not cancelled.
    pub handler_timeout: Duration,
    /// Longest the worker sleeps before re-checking the queues, guarding
    /// against missed wake-ups.
    pub idle_wait: Duration,
    /// Handler invocations allowed to run at once, timed-out ones included.
    pub max_inflight_handlers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            idle_wait: DEFAULT_IDLE_WAIT,
            max_inflight_handlers: DEFAULT_MAX_INFLIGHT_HANDLERS,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// - `PANTHEON_HANDLER_TIMEOUT_MS`
    /// - `PANTHEON_IDLE_WAIT_MS`
    /// - `PANTHEON_MAX_INFLIGHT_HANDLERS`
    ///
    /// Unset variables fall back to the defaults. Loading `.env` is left to
    /// the binary.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            handler_timeout: match env::var("PANTHEON_HANDLER_TIMEOUT_MS") {
                Ok(raw) => Duration::from_millis(
                    raw.parse()
                        .context("PANTHEON_HANDLER_TIMEOUT_MS must be a valid number")?,
                ),
                Err(_) => defaults.handler_timeout,
            },
            idle_wait: match env::var("PANTHEON_IDLE_WAIT_MS") {
                Ok(raw) => Duration::from_millis(
                    raw.parse()
                        .context("PANTHEON_IDLE_WAIT_MS must be a valid number")?,
                ),
                Err(_) => defaults.idle_wait,
            },
            max_inflight_handlers: match env::var("PANTHEON_MAX_INFLIGHT_HANDLERS") {
                Ok(raw) => raw
                    .parse()
                    .context("PANTHEON_MAX_INFLIGHT_HANDLERS must be a valid number")?,
                Err(_) => defaults.max_inflight_handlers,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Set the per-handler wait budget.
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Set the worker's idle wait bound.
    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    /// Set the cap on concurrently running handler invocations.
    pub fn with_max_inflight_handlers(mut self, max: usize) -> Self {
        self.max_inflight_handlers = max;
        self
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.handler_timeout.is_zero() {
            return Err(EngineError::InvalidConfig {
                message: "handler_timeout must be non-zero".to_string(),
            });
        }
        if self.idle_wait.is_zero() {
            return Err(EngineError::InvalidConfig {
                message: "idle_wait must be non-zero".to_string(),
            });
        }
        if self.max_inflight_handlers == 0 {
            return Err(EngineError::InvalidConfig {
                message: "max_inflight_handlers must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
