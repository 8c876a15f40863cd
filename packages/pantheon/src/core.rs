//! Core traits for events and topic keys.
//!
//! Both are blanket-implemented: any cloneable, thread-safe value is an
//! [`Event`], and any hashable, displayable, cloneable identifier is a
//! [`TopicKey`]. The engine never inspects either beyond hashing and
//! formatting the key for diagnostics.

use std::fmt::Display;
use std::hash::Hash;

/// Default topic key: a god's name.
pub type GodId = String;

/// A payload pushed through the engine.
///
/// Every handler for a god receives its own clone of the event, so the
/// event must be `Clone`. The engine never looks inside it.
pub trait Event: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Event for T {}

/// Identifier partitioning handlers and queued events into independent
/// delivery streams.
///
/// `Display` is only used to name the god in diagnostics.
pub trait TopicKey: Eq + Hash + Clone + Display + Send + Sync + 'static {}

impl<T: Eq + Hash + Clone + Display + Send + Sync + 'static> TopicKey for T {}
