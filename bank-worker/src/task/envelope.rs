//! Envelope types shared by producers, the broker and the processor.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::QUEUE_DEFAULT;

/// Retry budget applied when a task does not set one.
pub const DEFAULT_MAX_RETRY: u32 = 25;

/// Unique identifier assigned to an envelope when it is enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Delivery options for a task.
///
/// Every field is optional; unset fields fall back to the default lane,
/// [`DEFAULT_MAX_RETRY`] and immediate eligibility.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    queue: Option<String>,
    max_retry: Option<u32>,
    process_at: Option<DateTime<Utc>>,
    process_in: Option<Duration>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route the task to a named lane.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Cap the number of redeliveries after failed executions.
    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    /// Make the task eligible no earlier than `at`.
    pub fn process_at(mut self, at: DateTime<Utc>) -> Self {
        self.process_at = Some(at);
        self.process_in = None;
        self
    }

    /// Make the task eligible `delay` after it is enqueued.
    pub fn process_in(mut self, delay: Duration) -> Self {
        self.process_in = Some(delay);
        self.process_at = None;
        self
    }
}

/// A task as described by its producer, before the broker has seen it.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: String,
    pub payload: Vec<u8>,
    pub options: TaskOptions,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            task_type: task_type.into(),
            payload: payload.into(),
            options: TaskOptions::default(),
        }
    }

    /// Build a task whose payload is the JSON encoding of `payload`.
    pub fn json<T: Serialize>(task_type: impl Into<String>, payload: &T) -> serde_json::Result<Self> {
        Ok(Self::new(task_type, serde_json::to_vec(payload)?))
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }

    /// Assign an id and resolve the options against `now`.
    pub fn into_envelope(self, now: DateTime<Utc>) -> Envelope {
        let TaskOptions {
            queue,
            max_retry,
            process_at,
            process_in,
        } = self.options;

        let process_at = match (process_at, process_in) {
            (Some(at), _) => at,
            (None, Some(delay)) => add_duration(now, delay),
            (None, None) => now,
        };

        Envelope {
            id: TaskId::new(),
            task_type: self.task_type,
            payload: self.payload,
            queue: queue
                .filter(|q| !q.is_empty())
                .unwrap_or_else(|| QUEUE_DEFAULT.to_string()),
            max_retry: max_retry.unwrap_or(DEFAULT_MAX_RETRY),
            retry_count: 0,
            process_at,
            enqueued_at: now,
            last_error: None,
        }
    }
}

/// One unit of deferred work as stored by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: TaskId,
    /// Selects the handler that executes this envelope
    pub task_type: String,
    /// Handler-specific bytes, never interpreted by the broker
    pub payload: Vec<u8>,
    /// Lane the envelope is routed to
    pub queue: String,
    pub max_retry: u32,
    /// Failed executions so far
    pub retry_count: u32,
    /// Earliest time the envelope may be leased
    pub process_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    /// Error reported by the most recent failed execution
    pub last_error: Option<String>,
}

impl Envelope {
    /// Decode the payload as JSON.
    pub fn payload_json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }

    /// Whether another failure would exceed the retry budget.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retry
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.process_at <= now
    }
}

/// `now + delay`, saturating at the largest representable time.
pub(crate) fn add_duration(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let millis = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    chrono::Duration::try_milliseconds(millis)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::QUEUE_CRITICAL;

    #[test]
    fn test_defaults_applied() {
        let now = Utc::now();
        let envelope = NewTask::new("task:noop", b"{}".to_vec()).into_envelope(now);

        assert_eq!(envelope.queue, QUEUE_DEFAULT);
        assert_eq!(envelope.max_retry, DEFAULT_MAX_RETRY);
        assert_eq!(envelope.retry_count, 0);
        assert_eq!(envelope.process_at, now);
        assert!(envelope.is_due(now));
    }

    #[test]
    fn test_options_applied() {
        let now = Utc::now();
        let envelope = NewTask::new("task:noop", Vec::new())
            .with_options(
                TaskOptions::new()
                    .queue(QUEUE_CRITICAL)
                    .max_retry(3)
                    .process_in(Duration::from_secs(10)),
            )
            .into_envelope(now);

        assert_eq!(envelope.queue, QUEUE_CRITICAL);
        assert_eq!(envelope.max_retry, 3);
        assert_eq!(envelope.process_at, now + chrono::Duration::seconds(10));
        assert!(!envelope.is_due(now));
    }

    #[test]
    fn test_empty_queue_falls_back_to_default() {
        let envelope = NewTask::new("task:noop", Vec::new())
            .with_options(TaskOptions::new().queue(""))
            .into_envelope(Utc::now());
        assert_eq!(envelope.queue, QUEUE_DEFAULT);
    }

    #[test]
    fn test_json_payload() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Payload {
            user_id: i64,
        }

        let envelope = NewTask::json("task:send_verify_email", &Payload { user_id: 42 })
            .unwrap()
            .into_envelope(Utc::now());

        let decoded: Payload = envelope.payload_json().unwrap();
        assert_eq!(decoded, Payload { user_id: 42 });
    }

    #[test]
    fn test_retries_exhausted() {
        let mut envelope = NewTask::new("task:noop", Vec::new())
            .with_options(TaskOptions::new().max_retry(1))
            .into_envelope(Utc::now());

        assert!(!envelope.retries_exhausted());
        envelope.retry_count = 1;
        assert!(envelope.retries_exhausted());
    }

    #[test]
    fn test_task_id_parse() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_add_duration_saturates() {
        let now = Utc::now();
        assert_eq!(add_duration(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
