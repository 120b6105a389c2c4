//! Task broker: the durable store envelopes wait in between the distributor
//! and the processor.
//!
//! Each named lane holds four disjoint sets:
//!
//! ```text
//! enqueue ──► scheduled ──(process_at reached)──► pending ──lease──► in-flight
//!                 ▲                                  ▲                  │
//!                 └──────── retry (backoff) ─────────┼──────────────────┤
//!                                                    └── lease expired ─┤
//!                                              dead ◄──── kill ─────────┤
//!                                         (removed) ◄──── ack ──────────┘
//! ```
//!
//! A lease gives one worker exclusive ownership of an envelope until it acks,
//! retries or kills it. If the worker disappears the lease expires and the
//! envelope becomes pending again, so delivery is at-least-once.

pub mod amqp;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::task::{Envelope, TaskId};

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

/// Errors reported by a broker backend.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("task {0} is already enqueued")]
    DuplicateTask(TaskId),

    #[error("lease on task {0} is no longer held")]
    LeaseLost(TaskId),

    #[error("malformed envelope: {0}")]
    Codec(String),

    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
}

impl BrokerError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_) | BrokerError::Amqp(_))
    }
}

/// Exclusive, time-limited claim on one envelope.
#[derive(Debug, Clone)]
pub struct Lease {
    pub envelope: Envelope,
    /// Distinguishes this lease from earlier leases of the same envelope
    pub token: u64,
    pub deadline: DateTime<Utc>,
}

impl Lease {
    pub fn task_id(&self) -> TaskId {
        self.envelope.id
    }
}

/// An envelope that will not be delivered again automatically.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub envelope: Envelope,
    pub reason: String,
    pub died_at: DateTime<Utc>,
}

/// Size of each set in one lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LaneStats {
    pub pending: usize,
    pub scheduled: usize,
    pub in_flight: usize,
    pub dead: usize,
}

impl LaneStats {
    /// Envelopes that may still be delivered.
    pub fn live(&self) -> usize {
        self.pending + self.scheduled + self.in_flight
    }
}

/// Multi-producer, multi-consumer task store with lease semantics.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Durably record a new envelope. Returns once the backend has accepted it.
    async fn enqueue(&self, envelope: Envelope) -> Result<TaskId, BrokerError>;

    /// Lease one eligible envelope, trying lanes in the given order.
    ///
    /// Waits up to `wait` when nothing is eligible and returns `None` if the
    /// wait runs out.
    async fn lease(&self, queues: &[String], wait: Duration) -> Result<Option<Lease>, BrokerError>;

    /// Remove a successfully processed envelope.
    async fn ack(&self, lease: &Lease) -> Result<(), BrokerError>;

    /// Record a failed execution and schedule the envelope again at `retry_at`.
    async fn retry(&self, lease: &Lease, error: &str, retry_at: DateTime<Utc>) -> Result<(), BrokerError>;

    /// Move the envelope to the dead-letter set.
    async fn kill(&self, lease: &Lease, reason: &str) -> Result<(), BrokerError>;

    async fn stats(&self, queue: &str) -> Result<LaneStats, BrokerError>;

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, BrokerError>;

    /// Release backend connections.
    async fn close(&self) {}
}

/// Open the broker named by a `BROKER_URL` value.
///
/// `memory://` selects the in-process broker; `amqp://` and `amqps://` select
/// RabbitMQ.
pub fn connect(url: &str, lease_timeout: Duration) -> Result<Arc<dyn Broker>, BrokerError> {
    if url.starts_with("memory://") {
        return Ok(Arc::new(MemoryBroker::with_lease_timeout(lease_timeout)));
    }
    if url.starts_with("amqp://") || url.starts_with("amqps://") {
        return Ok(Arc::new(AmqpBroker::with_lease_timeout(
            url.to_string(),
            lease_timeout,
        )));
    }
    Err(BrokerError::Unavailable(format!(
        "unsupported broker url scheme: {}",
        url.split("://").next().unwrap_or(url)
    )))
}
