//! Routing from task type to handler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::task::Envelope;

/// Failure reported by a handler.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Retried with backoff while the envelope has retry budget left
    #[error("{0}")]
    Failed(#[from] anyhow::Error),

    /// Dead-lettered immediately; retrying cannot help (e.g. a malformed payload)
    #[error("skip retry: {0}")]
    SkipRetry(anyhow::Error),
}

impl TaskError {
    pub fn skip_retry(error: impl Into<anyhow::Error>) -> Self {
        TaskError::SkipRetry(error.into())
    }
}

/// Executes envelopes of one task type.
///
/// Delivery is at-least-once, so handlers must tolerate running more than
/// once for the same envelope.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> Result<(), TaskError>;
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate handler for task_type={0}")]
    DuplicateHandler(String),

    #[error("task_type must not be empty")]
    EmptyTaskType,
}

/// Registry of handlers (task_type -> handler).
///
/// Built once during startup, then shared read-only by every worker.
#[derive(Default, Clone)]
pub struct HandlerMux {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RegistryError> {
        let task_type = task_type.into();
        if task_type.is_empty() {
            return Err(RegistryError::EmptyTaskType);
        }
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::DuplicateHandler(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(task_type)
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
