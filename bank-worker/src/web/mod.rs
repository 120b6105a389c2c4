//! HTTP surface of the bank service.

pub mod handlers;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::lifecycle::Component;

pub use handlers::{
    create_user, health, verify_email, AppState, CreateUserRequest, ErrorResponse,
    HealthResponse, VerifyEmailQuery, VerifyEmailResponse,
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/users", post(create_user))
        .route("/verify_email", get(verify_email))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves [`router`] until cancelled. A bind failure stops the service.
pub struct HttpServer {
    address: String,
    state: AppState,
}

impl HttpServer {
    pub fn new(address: impl Into<String>, state: AppState) -> Self {
        Self {
            address: address.into(),
            state,
        }
    }
}

#[async_trait]
impl Component for HttpServer {
    fn name(&self) -> &str {
        "http_server"
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.address)
            .await
            .with_context(|| format!("Failed to bind to {}", self.address))?;

        info!(address = %self.address, "web_server_listening");

        axum::serve(listener, router(self.state.clone()))
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .context("Server error")?;

        info!("web_server_shutdown_complete");
        Ok(())
    }

    /// The cancellation token passed to `run` drives the graceful stop;
    /// this only records that it has begun.
    async fn shutdown(&self) -> Result<()> {
        info!("web_server_shutting_down");
        Ok(())
    }
}
