//! Task envelopes and the options used to build them.
//!
//! An [`Envelope`] is the unit of deferred work that travels through the
//! broker. Producers describe work as a [`NewTask`]; the distributor turns it
//! into an envelope with a fresh [`TaskId`].

pub mod envelope;

pub use envelope::{Envelope, NewTask, TaskId, TaskOptions, DEFAULT_MAX_RETRY};

/// Lane for work that should be picked up ahead of everything else.
pub const QUEUE_CRITICAL: &str = "critical";

/// Lane used when a task does not name one.
pub const QUEUE_DEFAULT: &str = "default";
