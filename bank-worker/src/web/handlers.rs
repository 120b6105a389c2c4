//! HTTP endpoint handlers.
//!
//! User creation only writes the user row and enqueues the verification
//! e-mail; the mail itself is sent by the task processor.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::distributor::TaskDistributor;
use crate::store::{CreateUser, Store, StoreError};
use crate::task::{TaskOptions, QUEUE_CRITICAL};
use crate::tasks::{distribute_send_verify_email, PayloadSendVerifyEmail};
use crate::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub distributor: Arc<dyn TaskDistributor>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn Store>, distributor: Arc<dyn TaskDistributor>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            distributor,
        }
    }
}

/// Error body returned by every endpoint.
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Users
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub email: String,
}

/// Create a user and enqueue the verification e-mail.
///
/// A failed enqueue is logged but does not fail the request: the user row is
/// already committed.
pub async fn create_user(
    State(state): State<AppState>,
    Json(request): Json<CreateUserRequest>,
) -> Response {
    let username = request.username.trim().to_string();
    let full_name = request.full_name.trim().to_string();
    let email = request.email.trim().to_string();

    if username.is_empty() || full_name.is_empty() || email.is_empty() {
        warn!(username = %username, "create_user_missing_fields");
        return error_response(
            StatusCode::BAD_REQUEST,
            "username, full_name and email are required",
        );
    }
    if !email.contains('@') {
        warn!(username = %username, "create_user_invalid_email");
        return error_response(StatusCode::BAD_REQUEST, "email is not valid");
    }

    let user = match state
        .store
        .create_user(CreateUser {
            username,
            full_name,
            email,
        })
        .await
    {
        Ok(user) => user,
        Err(StoreError::Conflict(message)) => {
            warn!(error = %message, "create_user_conflict");
            return error_response(StatusCode::CONFLICT, format!("{message} already exists"));
        }
        Err(StoreError::Invalid(message)) => {
            return error_response(StatusCode::BAD_REQUEST, message);
        }
        Err(e) => {
            error!(error = %e, "create_user_failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to create user");
        }
    };

    info!(user_id = user.id, username = %user.username, "user_created");

    let options = TaskOptions::new()
        .queue(QUEUE_CRITICAL)
        .max_retry(state.config.verify_email_max_retry)
        .process_in(state.config.verify_email_delay());
    let payload = PayloadSendVerifyEmail { user_id: user.id };

    if let Err(e) =
        distribute_send_verify_email(state.distributor.as_ref(), &payload, options).await
    {
        error!(user_id = user.id, error = %e, "verify_email_enqueue_failed");
    }

    (StatusCode::OK, Json(user)).into_response()
}

// =============================================================================
// E-mail verification
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct VerifyEmailQuery {
    pub email_id: i64,
    pub secret_code: String,
}

#[derive(Serialize)]
pub struct VerifyEmailResponse {
    pub is_verified: bool,
}

pub async fn verify_email(
    State(state): State<AppState>,
    Query(query): Query<VerifyEmailQuery>,
) -> Response {
    if query.secret_code.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "secret_code is required");
    }

    match state.store.verify_email(query.email_id, &query.secret_code).await {
        Ok(user) => {
            info!(user_id = user.id, email_id = query.email_id, "email_verified");
            (
                StatusCode::OK,
                Json(VerifyEmailResponse {
                    is_verified: user.is_email_verified,
                }),
            )
                .into_response()
        }
        Err(StoreError::NotFound(_)) => {
            warn!(email_id = query.email_id, "verify_email_rejected");
            error_response(StatusCode::NOT_FOUND, "verification link is invalid or expired")
        }
        Err(e) => {
            error!(email_id = query.email_id, error = %e, "verify_email_failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to verify email")
        }
    }
}
