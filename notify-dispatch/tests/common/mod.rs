//! Shared fixtures: a temp-file database and a local webhook receiver.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tempfile::TempDir;

use notify_dispatch::config::DispatchConfig;
use notify_dispatch::database::Database;
use notify_dispatch::database::models::{ChannelKind, NewEvent, NewSubscription};
use notify_dispatch::notification::{ChannelRegistry, NotificationService};

pub const TENANT: i64 = 1;
pub const ORDER_CREATED: &str = "order.created";

pub struct Harness {
    pub service: Arc<NotificationService>,
    pub db: Database,
    _dir: TempDir,
}

pub async fn harness(config: DispatchConfig) -> Harness {
    let dir = tempfile::tempdir().expect("temp dir");
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("notify.db").display());
    let db = Database::open(&url).await.expect("open database");
    let registry = Arc::new(ChannelRegistry::with_defaults().expect("registry"));
    let service = NotificationService::new(&db, registry, config).expect("service");
    Harness {
        service: Arc::new(service),
        db,
        _dir: dir,
    }
}

/// Backoff of one second so retries become due quickly.
pub fn fast_retry_config() -> DispatchConfig {
    DispatchConfig {
        backoff_base_secs: 1,
        backoff_max_secs: 1,
        ..Default::default()
    }
}

/// Wait until every retry scheduled by a fast-retry config is due.
pub async fn wait_for_backoff() {
    tokio::time::sleep(Duration::from_millis(1_100)).await;
}

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub headers: HeaderMap,
    pub body: Value,
}

#[derive(Clone)]
struct ReceiverState {
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    script: Arc<Mutex<VecDeque<StatusCode>>>,
    fallback: StatusCode,
    delay: Duration,
}

/// Local HTTP endpoint that records requests and answers with scripted statuses.
pub struct Receiver {
    pub url: String,
    state: ReceiverState,
}

impl Receiver {
    pub fn hits(&self) -> usize {
        self.state.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.state.requests.lock().clone()
    }
}

async fn receive(
    State(state): State<ReceiverState>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    let body = serde_json::from_str(&body).unwrap_or(Value::String(body));
    state.requests.lock().push(CapturedRequest { headers, body });
    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }
    let next = state.script.lock().pop_front();
    next.unwrap_or(state.fallback)
}

/// Answers with `script` in order, then `fallback`, each after `delay`.
pub async fn spawn_receiver(
    script: Vec<StatusCode>,
    fallback: StatusCode,
    delay: Duration,
) -> Receiver {
    let state = ReceiverState {
        requests: Arc::new(Mutex::new(Vec::new())),
        script: Arc::new(Mutex::new(script.into())),
        fallback,
        delay,
    };
    let app = Router::new()
        .route("/hook", post(receive).put(receive))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind receiver");
    let addr = listener.local_addr().expect("receiver addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("receiver server");
    });

    Receiver {
        url: format!("http://{}/hook", addr),
        state,
    }
}

pub async fn ok_receiver() -> Receiver {
    spawn_receiver(Vec::new(), StatusCode::OK, Duration::ZERO).await
}

pub fn webhook_subscription(url: &str) -> NewSubscription {
    NewSubscription::new(
        TENANT,
        ORDER_CREATED,
        ChannelKind::Webhook,
        json!({
            "url": url,
            "auth": {"type": "bearer", "token": "t0k"},
            "metadata": {"store": "north-1"}
        }),
    )
}

pub fn order_created(payload: Value) -> NewEvent {
    NewEvent::new(TENANT, ORDER_CREATED, payload).with_source("order-42")
}
