//! Producer-side API for enqueueing background tasks.
//!
//! The distributor returns as soon as the broker has durably accepted an
//! envelope. It never executes anything and is not coupled to the caller's
//! database transaction: a caller may commit its own work and still fail to
//! enqueue, and must choose what to do about that.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{error, info};

use crate::broker::{Broker, BrokerError};
use crate::task::{NewTask, TaskId};

#[derive(Debug, Error)]
pub enum DistributeError {
    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("failed to encode payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Hands tasks to the broker.
#[async_trait]
pub trait TaskDistributor: Send + Sync {
    async fn distribute(&self, task: NewTask) -> Result<TaskId, DistributeError>;
}

/// Distributor that writes straight to a [`Broker`].
#[derive(Clone)]
pub struct BrokerTaskDistributor {
    broker: Arc<dyn Broker>,
}

impl BrokerTaskDistributor {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl TaskDistributor for BrokerTaskDistributor {
    async fn distribute(&self, task: NewTask) -> Result<TaskId, DistributeError> {
        if task.task_type.trim().is_empty() {
            return Err(DistributeError::InvalidTask(
                "task_type must not be empty".to_string(),
            ));
        }

        let envelope = task.into_envelope(Utc::now());
        let task_type = envelope.task_type.clone();
        let queue = envelope.queue.clone();
        let max_retry = envelope.max_retry;
        let process_at = envelope.process_at;
        let payload_length = envelope.payload.len();

        let id = self.broker.enqueue(envelope).await.map_err(|e| {
            error!(task_type = %task_type, queue = %queue, error = %e, "task_enqueue_failed");
            e
        })?;

        info!(
            task_id = %id,
            task_type = %task_type,
            queue = %queue,
            max_retry = max_retry,
            process_at = %process_at,
            payload_length = payload_length,
            "task_enqueued"
        );

        Ok(id)
    }
}
