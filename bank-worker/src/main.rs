//! Simple Bank server - HTTP API and background task processor.
//!
//! Both run as components of one orchestrator: a failure in either, or
//! SIGINT/SIGTERM, shuts the whole process down gracefully.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use bank::broker;
use bank::lifecycle::{shutdown_signal, Orchestrator};
use bank::mail;
use bank::store::{MemoryStore, Store};
use bank::tasks::register_handlers;
use bank::web::{AppState, HttpServer};
use bank::{BrokerTaskDistributor, Config, HandlerMux, ProcessorComponent, TaskProcessor};

#[tokio::main]
async fn main() -> Result<()> {
    bank::telemetry::init();

    info!("server_starting");

    // Load configuration from environment
    let config = Config::from_env();
    info!(
        http_address = %config.http_address,
        broker_url_set = !config.broker_url.is_empty(),
        concurrency = config.worker_concurrency,
        queues = ?config.task_queues,
        mailgun_configured = config.mailgun_api_key.is_some(),
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
    register_handlers(&mut mux, store.clone(), mailer, verify_url)?;

    let processor = Arc::new(TaskProcessor::new(
        broker.clone(),
        mux,
        config.processor_config(),
    ));
    let distributor = Arc::new(BrokerTaskDistributor::new(broker.clone()));
    let state = AppState::new(config.clone(), store, distributor);

    let result = Orchestrator::new(config.orchestrator_grace())
        .with_component(Arc::new(HttpServer::new(config.http_address.clone(), state)))
        .with_component(Arc::new(ProcessorComponent::new(processor)))
        .run(shutdown_signal())
        .await;

    // Close broker connection
    broker.close().await;

    info!("server_shutdown_complete");
    result
}
