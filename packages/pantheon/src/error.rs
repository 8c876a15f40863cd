//! Structured error types for the dispatch engine.
//!
//! None of these errors is fatal. [`DispatchError`] describes what happened
//! to a single handler invocation; it is logged at the dispatch boundary and
//! reported in a [`DispatchReport`](crate::DispatchReport), never propagated
//! into the worker loop. [`EngineError`] covers lifecycle misuse and invalid
//! configuration.
//!
//! # The Error Boundary Rule
//!
//! > **No handler error ever crosses `dispatch_one`.**
//!
//! - `anyhow` is what handlers return (ergonomic for callers)
//! - `DispatchError` is what the engine records (structured, owned strings)

use std::time::Duration;

use thiserror::Error;

/// Outcome of a handler invocation that did not complete successfully.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The handler did not finish within the wait budget.
    ///
    /// The invocation is not cancelled and keeps running in the background.
    #[error("handler {handler} for god \"{god}\" timed out after {timeout:?}")]
    HandlerTimeout {
        /// God the event was pushed to.
        god: String,
        /// Type name of the handler.
        handler: &'static str,
        /// The wait budget that elapsed.
        timeout: Duration,
    },

    /// The handler returned an error.
    #[error("handler {handler} for god \"{god}\" failed: {message}")]
    HandlerFailed {
        /// God the event was pushed to.
        god: String,
        /// Type name of the handler.
        handler: &'static str,
        /// Rendered error chain.
        message: String,
    },

    /// The handler panicked.
    #[error("handler {handler} for god \"{god}\" panicked: {message}")]
    HandlerPanicked {
        /// God the event was pushed to.
        god: String,
        /// Type name of the handler.
        handler: &'static str,
        /// Panic payload, if it was a string.
        message: String,
    },

    /// Every invocation slot stayed taken until the deadline, so the handler
    /// was never started.
    ///
    /// The slots are held by earlier handlers that missed their own deadline,
    /// possibly for other gods. Nothing about this god's handler is implied.
    #[error("handler {handler} for god \"{god}\" not started: invocation pool saturated for {waited:?}")]
    PoolSaturated {
        /// God the event was pushed to.
        god: String,
        /// Type name of the handler that was skipped.
        handler: &'static str,
        /// How long the dispatcher waited for a slot.
        waited: Duration,
    },
}

impl DispatchError {
    /// The god whose handler produced this error.
    pub fn god(&self) -> &str {
        match self {
            DispatchError::HandlerTimeout { god, .. }
            | DispatchError::HandlerFailed { god, .. }
            | DispatchError::HandlerPanicked { god, .. }
            | DispatchError::PoolSaturated { god, .. } => god,
        }
    }

    /// Returns true for [`DispatchError::HandlerTimeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, DispatchError::HandlerTimeout { .. })
    }

    /// Returns true for [`DispatchError::PoolSaturated`].
    pub fn is_pool_saturated(&self) -> bool {
        matches!(self, DispatchError::PoolSaturated { .. })
    }

    /// Returns true if the handler ran and returned an error or panicked.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            DispatchError::HandlerFailed { .. } | DispatchError::HandlerPanicked { .. }
        )
    }
}

/// Errors surfaced by the engine facade and its configuration.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine has been shut down; the operation was not performed.
    #[error("engine is stopped")]
    Stopped,

    /// The engine was started outside a Tokio runtime.
    #[error("no tokio runtime available to run the worker")]
    NoRuntime,

    /// A configuration value is out of range.
    #[error("invalid engine configuration: {message}")]
    InvalidConfig {
        /// What was wrong.
        message: String,
    },
}
