//! HTTP routes exercised through the router without binding a socket.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use bank::broker::{Broker, BrokerError, MemoryBroker};
use bank::store::{CreateVerifyEmail, MemoryStore, Store};
use bank::task::{NewTask, TaskId, QUEUE_CRITICAL};
use bank::web::{router, AppState};
use bank::{BrokerTaskDistributor, Config, DistributeError, TaskDistributor};

struct BrokenDistributor;

#[async_trait]
impl TaskDistributor for BrokenDistributor {
    async fn distribute(&self, _task: NewTask) -> Result<TaskId, DistributeError> {
        Err(BrokerError::Unavailable("connection refused".to_string()).into())
    }
}

fn app(store: Arc<MemoryStore>, distributor: Arc<dyn TaskDistributor>) -> axum::Router {
    router(AppState::new(Config::from_env(), store, distributor))
}

async fn send(app: axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn post_user(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/users")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn alice() -> Value {
    json!({
        "username": "alice",
        "full_name": "Alice Liddell",
        "email": "alice@example.com"
    })
}

#[tokio::test]
async fn test_health() {
    let broker = Arc::new(MemoryBroker::new());
    let app = app(Arc::new(MemoryStore::new()), Arc::new(BrokerTaskDistributor::new(broker)));

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn test_create_user_enqueues_verification() {
    let broker = Arc::new(MemoryBroker::new());
    let app = app(
        Arc::new(MemoryStore::new()),
        Arc::new(BrokerTaskDistributor::new(broker.clone())),
    );

    let (status, body) = send(app, post_user(alice())).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["username"], "alice");
    assert_eq!(body["is_email_verified"], false);

    // Enqueued on the critical lane with a delay.
    let stats = broker.stats(QUEUE_CRITICAL).await.unwrap();
    assert_eq!(stats.scheduled, 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn test_create_user_rejects_missing_fields() {
    let broker = Arc::new(MemoryBroker::new());
    let app = app(
        Arc::new(MemoryStore::new()),
        Arc::new(BrokerTaskDistributor::new(broker.clone())),
    );

    let (status, body) = send(app, post_user(json!({"username": "alice"}))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("required"));
    assert_eq!(broker.stats(QUEUE_CRITICAL).await.unwrap().live(), 0);
}

#[tokio::test]
async fn test_duplicate_username_conflicts() {
    let broker = Arc::new(MemoryBroker::new());
    let store = Arc::new(MemoryStore::new());
    let distributor: Arc<dyn TaskDistributor> = Arc::new(BrokerTaskDistributor::new(broker.clone()));

    let (status, _) = send(app(store.clone(), distributor.clone()), post_user(alice())).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(app(store, distributor), post_user(alice())).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(broker.stats(QUEUE_CRITICAL).await.unwrap().scheduled, 1);
}

#[tokio::test]
async fn test_enqueue_failure_does_not_fail_request() {
    let store = Arc::new(MemoryStore::new());
    let app = app(store.clone(), Arc::new(BrokenDistributor));

    let (status, body) = send(app, post_user(alice())).await;

    assert_eq!(status, StatusCode::OK);
    let user_id = body["id"].as_i64().unwrap();
    assert_eq!(store.get_user(user_id).await.unwrap().username, "alice");
}

#[tokio::test]
async fn test_verify_email_link() {
    let broker = Arc::new(MemoryBroker::new());
    let store = Arc::new(MemoryStore::new());
    let distributor: Arc<dyn TaskDistributor> = Arc::new(BrokerTaskDistributor::new(broker));

    let (_, body) = send(app(store.clone(), distributor.clone()), post_user(alice())).await;
    let user_id = body["id"].as_i64().unwrap();
    let record = store
        .create_verify_email(CreateVerifyEmail {
            user_id,
            email: "alice@example.com".to_string(),
            secret_code: "abcdef".to_string(),
        })
        .await
        .unwrap();

    let wrong = Request::builder()
        .uri(format!("/verify_email?email_id={}&secret_code=nope", record.id))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(app(store.clone(), distributor.clone()), wrong).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let right = Request::builder()
        .uri(format!("/verify_email?email_id={}&secret_code=abcdef", record.id))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app(store.clone(), distributor), right).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"is_verified": true}));
    assert!(store.get_user(user_id).await.unwrap().is_email_verified);
}

#[tokio::test]
async fn test_verification_task_options_come_from_config() {
    let broker = Arc::new(MemoryBroker::new());
    let config = Config {
        verify_email_delay_ms: 0,
        verify_email_max_retry: 3,
        ..Config::from_env()
    };
    let app = router(AppState::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(BrokerTaskDistributor::new(broker.clone())),
    ));

    let (status, _) = send(app, post_user(alice())).await;
    assert_eq!(status, StatusCode::OK);

    // No delay configured, so the envelope is eligible at once.
    let lease = broker
        .lease(&[QUEUE_CRITICAL.to_string()], std::time::Duration::from_millis(100))
        .await
        .unwrap()
        .expect("verification task should be pending");
    assert_eq!(lease.envelope.max_retry, 3);
    assert_eq!(lease.envelope.retry_count, 0);
}
