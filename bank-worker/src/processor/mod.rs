//! Task processor: a fixed pool of workers that lease envelopes from the
//! broker and run them through registered handlers.
//!
//! ## Worker loop
//!
//! ```text
//! lease (weighted lane order) → lookup handler → run with deadline → ack
//!                                     │                   │
//!                                 not found            failed / panicked / timed out
//!                                     ▼                   ▼
//!                                   kill         retry with backoff, or kill
//!                                                when the budget is spent
//! ```
//!
//! Broker errors never stop a worker; it backs off and leases again.

pub mod mux;
pub mod retry;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use rand::Rng;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::broker::{Broker, BrokerError, Lease};
use crate::lifecycle::Component;
use crate::task::envelope::add_duration;
use crate::task::{QUEUE_CRITICAL, QUEUE_DEFAULT};

pub use mux::{HandlerMux, RegistryError, TaskError, TaskHandler};
pub use retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("task processor is already running")]
    AlreadyStarted,

    #[error("task processor needs at least one queue with a positive weight")]
    NoQueues,

    #[error("task processor needs at least one worker")]
    NoWorkers,
}

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Number of concurrent workers
    pub concurrency: usize,
    /// Lanes to consume with their relative weights
    pub queues: Vec<(String, u32)>,
    /// How long one lease call may block when the lanes are empty
    pub poll_timeout: Duration,
    /// Deadline for a single handler execution
    pub handler_timeout: Duration,
    /// Grace period for in-flight handlers on shutdown
    pub shutdown_timeout: Duration,
    /// Backoff between failed executions of an envelope
    pub retry: RetryPolicy,
    /// Backoff between failed lease calls
    pub broker_backoff: RetryPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            queues: vec![
                (QUEUE_CRITICAL.to_string(), 10),
                (QUEUE_DEFAULT.to_string(), 5),
            ],
            poll_timeout: Duration::from_secs(1),
            handler_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(8),
            retry: RetryPolicy::default(),
            broker_backoff: RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(5)),
        }
    }
}

/// Lanes with relative weights. A lane with twice the weight is tried first
/// twice as often, which gives soft priority without starving anyone.
#[derive(Debug, Clone)]
pub struct WeightedLanes {
    lanes: Vec<(String, u32)>,
}

impl WeightedLanes {
    /// Lanes with weight zero are dropped.
    pub fn new(lanes: &[(String, u32)]) -> Result<Self, ProcessorError> {
        let lanes: Vec<(String, u32)> = lanes
            .iter()
            .filter(|(name, weight)| *weight > 0 && !name.is_empty())
            .cloned()
            .collect();
        if lanes.is_empty() {
            return Err(ProcessorError::NoQueues);
        }
        Ok(Self { lanes })
    }

    /// A weighted-random permutation of the lane names.
    pub fn order<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<String> {
        let mut remaining: Vec<&(String, u32)> = self.lanes.iter().collect();
        let mut order = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let total: u64 = remaining.iter().map(|(_, w)| u64::from(*w)).sum();
            let mut pick = rng.gen_range(0..total);
            let index = remaining
                .iter()
                .position(|(_, w)| {
                    let w = u64::from(*w);
                    if pick < w {
                        true
                    } else {
                        pick -= w;
                        false
                    }
                })
                .unwrap_or(0);
            order.push(remaining.remove(index).0.clone());
        }
        order
    }

    pub fn names(&self) -> Vec<String> {
        self.lanes.iter().map(|(name, _)| name.clone()).collect()
    }
}

struct Running {
    cancel: CancellationToken,
    workers: JoinSet<()>,
}

/// Consumer side of the pipeline.
pub struct TaskProcessor {
    broker: Arc<dyn Broker>,
    mux: Arc<HandlerMux>,
    config: ProcessorConfig,
    running: Mutex<Option<Running>>,
}

impl TaskProcessor {
    pub fn new(broker: Arc<dyn Broker>, mux: HandlerMux, config: ProcessorConfig) -> Self {
        Self {
            broker,
            mux: Arc::new(mux),
            config,
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// Spawn the worker pool. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), ProcessorError> {
        if self.config.concurrency == 0 {
            return Err(ProcessorError::NoWorkers);
        }
        let lanes = Arc::new(WeightedLanes::new(&self.config.queues)?);

        let mut running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if running.is_some() {
            return Err(ProcessorError::AlreadyStarted);
        }

        let cancel = CancellationToken::new();
        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.concurrency {
            let worker = Worker {
                id: worker_id,
                broker: Arc::clone(&self.broker),
                mux: Arc::clone(&self.mux),
                lanes: Arc::clone(&lanes),
                config: self.config.clone(),
                cancel: cancel.clone(),
            };
            workers.spawn(worker.run());
        }

        info!(
            concurrency = self.config.concurrency,
            queues = ?lanes.names(),
            handlers = ?self.mux.registered_types(),
            "task_processor_started"
        );

        *running = Some(Running { cancel, workers });
        Ok(())
    }

    /// Stop leasing and wait for in-flight handlers up to the shutdown
    /// timeout. Handlers still running after that are abandoned; their leases
    /// expire and the envelopes are delivered again.
    pub async fn shutdown(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(Running { cancel, mut workers }) = running else {
            return;
        };

        info!(in_flight_workers = workers.len(), "task_processor_stopping");
        cancel.cancel();

        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while let Some(result) = workers.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "task_worker_join_failed");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                abandoned_workers = workers.len(),
                grace_ms = self.config.shutdown_timeout.as_millis() as u64,
                "task_processor_shutdown_timeout"
            );
            workers.shutdown().await;
        }

        info!("task_processor_stopped");
    }
}

struct Worker {
    id: usize,
    broker: Arc<dyn Broker>,
    mux: Arc<HandlerMux>,
    lanes: Arc<WeightedLanes>,
    config: ProcessorConfig,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!(worker_id = self.id, "task_worker_started");
        let mut lease_failures: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            // ThreadRng is not Send, so the order is computed before any await.
            let order = {
                let mut rng = rand::thread_rng();
                self.lanes.order(&mut rng)
            };

            let leased = tokio::select! {
                _ = self.cancel.cancelled() => break,
                leased = self.broker.lease(&order, self.config.poll_timeout) => leased,
            };

            match leased {
                Ok(Some(lease)) => {
                    lease_failures = 0;
                    self.process(lease).await;
                }
                Ok(None) => lease_failures = 0,
                Err(e) => {
                    let delay = self.config.broker_backoff.delay(lease_failures);
                    lease_failures = lease_failures.saturating_add(1);
                    warn!(
                        worker_id = self.id,
                        error = %e,
                        transient = e.is_transient(),
                        consecutive_failures = lease_failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "task_lease_failed"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        debug!(worker_id = self.id, "task_worker_stopped");
    }

    async fn process(&self, lease: Lease) {
        let span = info_span!(
            "task",
            worker_id = self.id,
            task_id = %lease.envelope.id,
            task_type = %lease.envelope.task_type,
            queue = %lease.envelope.queue,
            retry_count = lease.envelope.retry_count,
        );
        self.execute(&lease).instrument(span).await;
    }

    async fn execute(&self, lease: &Lease) {
        let envelope = &lease.envelope;

        let Some(handler) = self.mux.get(&envelope.task_type).cloned() else {
            // Deployment/version mismatch: no retry budget is spent on it.
            error!("task_handler_not_found");
            let reason = format!("no handler registered for task_type={}", envelope.task_type);
            self.report("kill", self.broker.kill(lease, &reason).await);
            return;
        };

        info!("task_started");
        let started = Instant::now();

        let outcome = tokio::time::timeout(
            self.config.handler_timeout,
            AssertUnwindSafe(handler.handle(envelope)).catch_unwind(),
        )
        .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let failure = match outcome {
            Ok(Ok(Ok(()))) => {
                info!(elapsed_ms = elapsed_ms, "task_succeeded");
                self.report("ack", self.broker.ack(lease).await);
                return;
            }
            Ok(Ok(Err(TaskError::SkipRetry(e)))) => {
                let reason = format!("{e:#}");
                error!(elapsed_ms = elapsed_ms, error = %reason, "task_failed_permanently");
                self.report("kill", self.broker.kill(lease, &reason).await);
                return;
            }
            Ok(Ok(Err(TaskError::Failed(e)))) => format!("{e:#}"),
            Ok(Err(panic)) => format!("handler panicked: {}", panic_message(panic.as_ref())),
            Err(_) => format!(
                "handler exceeded deadline of {}ms",
                self.config.handler_timeout.as_millis()
            ),
        };

        if envelope.retries_exhausted() {
            error!(
                elapsed_ms = elapsed_ms,
                error = %failure,
                max_retry = envelope.max_retry,
                "task_dead_lettered"
            );
            self.report("kill", self.broker.kill(lease, &failure).await);
            return;
        }

        let delay = self.config.retry.delay(envelope.retry_count);
        warn!(
            elapsed_ms = elapsed_ms,
            error = %failure,
            max_retry = envelope.max_retry,
            retry_in_ms = delay.as_millis() as u64,
            "task_retry_scheduled"
        );
        let retry_at = add_duration(Utc::now(), delay);
        self.report("retry", self.broker.retry(lease, &failure, retry_at).await);
    }

    fn report(&self, action: &'static str, result: Result<(), BrokerError>) {
        match result {
            Ok(()) => {}
            Err(BrokerError::LeaseLost(_)) => {
                // The lease expired while the handler ran; the envelope is
                // redelivered and this outcome is discarded.
                warn!(action = action, "task_lease_lost");
            }
            Err(e) => {
                error!(action = action, error = %e, "task_settle_failed");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs a [`TaskProcessor`] under the lifecycle orchestrator.
pub struct ProcessorComponent {
    processor: Arc<TaskProcessor>,
}

impl ProcessorComponent {
    pub fn new(processor: Arc<TaskProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl Component for ProcessorComponent {
    fn name(&self) -> &str {
        "task_processor"
    }

    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.processor.start()?;
        cancel.cancelled().await;
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.processor.shutdown().await;
        Ok(())
    }
}
