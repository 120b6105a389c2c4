//! Simple Bank processor - runs only the background task processor.
//!
//! Useful for scaling workers separately from the HTTP API when the broker
//! and the store are shared between processes.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use bank::broker;
use bank::lifecycle::{shutdown_signal, Orchestrator};
use bank::mail;
use bank::store::{MemoryStore, Store};
use bank::tasks::register_handlers;
use bank::{Config, HandlerMux, ProcessorComponent, TaskProcessor};

#[tokio::main]
async fn main() -> Result<()> {
    bank::telemetry::init();

    info!("processor_starting");

    // Load configuration
    let config = Config::from_env();
    info!(
        concurrency = config.worker_concurrency,
        queues = ?config.task_queues,
        "config_loaded"
    );

    let broker = broker::connect(&config.broker_url, config.lease_timeout())
        .context("Failed to open broker")?;
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let mailer = mail::sender_from_config(&config)?;
    let verify_url = config
        .verify_email_url()
        .context("VERIFY_EMAIL_BASE_URL is not a valid URL")?;

    let mut mux = HandlerMux::new();
    register_handlers(&mut mux, store, mailer, verify_url)?;

    let processor = Arc::new(TaskProcessor::new(broker.clone(), mux, config.processor_config()));

    let result = Orchestrator::new(config.orchestrator_grace())
        .with_component(Arc::new(ProcessorComponent::new(processor)))
        .run(shutdown_signal())
        .await;

    broker.close().await;

    info!("processor_shutdown_complete");
    result
}
