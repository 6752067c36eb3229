// HTTP transport: maps requests onto lease protocol calls.

use std::{future::Future, sync::Arc, time::Duration, time::Instant};

use axum::{
    extract::{
        rejection::{BytesRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Form, Router,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use fence::{protocol::parse_fence, ConditionalStore, Fence, LeaseProtocol, LeaseRecord};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ApiError;

/// Shared by every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    pub protocol: LeaseProtocol<dyn ConditionalStore>,
    /// Applied by acquire, heartbeat and value updates alike
    pub lease_duration: Duration,
    pub started: Instant,
}

impl AppState {
    pub fn new(protocol: LeaseProtocol<dyn ConditionalStore>, lease_duration: Duration) -> Self {
        Self {
            protocol,
            lease_duration,
            started: Instant::now(),
        }
    }

    pub fn with_store(store: Arc<dyn ConditionalStore>, lease_duration: Duration) -> Self {
        Self::new(LeaseProtocol::new(store), lease_duration)
    }
}

/// Body of a successful acquire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acquisition {
    pub acquire_time: DateTime<Utc>,
    pub expire_time: DateTime<Utc>,
    pub fence: Fence,
    pub body: String,
}

impl From<LeaseRecord> for Acquisition {
    fn from(rec: LeaseRecord) -> Self {
        Self {
            acquire_time: rec.acquire_time.to_datetime(),
            expire_time: rec.expire_time.to_datetime(),
            fence: rec.fence,
            body: rec.body,
        }
    }
}

/// Read-only view of a lease. Never includes the holder nonce, which would
/// let any reader re-acquire the lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseView {
    pub name: String,
    pub fence: Fence,
    pub acquire_time: DateTime<Utc>,
    pub heartbeat_time: DateTime<Utc>,
    pub expire_time: DateTime<Utc>,
    pub body: String,
    pub held: bool,
}

impl LeaseView {
    fn new(rec: LeaseRecord, held: bool) -> Self {
        Self {
            name: rec.name,
            fence: rec.fence,
            acquire_time: rec.acquire_time.to_datetime(),
            heartbeat_time: rec.heartbeat_time.to_datetime(),
            expire_time: rec.expire_time.to_datetime(),
            body: rec.body,
            held,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub backend: String,
    pub lease_duration_secs: u64,
    pub uptime_seconds: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct NonceParams {
    nonce: Option<String>,
}

// Path, query and body extractors are taken as `Result` so their rejections
// go out through `ApiError` as JSON.

async fn acquire(
    State(state): State<AppState>,
    path: Result<Path<String>, PathRejection>,
    query: Result<Query<NonceParams>, QueryRejection>,
    form: Option<Form<NonceParams>>,
) -> Result<Json<Acquisition>, ApiError> {
    let Path(name) = path?;
    let Query(query) = query?;
    // Query string wins over a form body, as with most form handling
    let nonce = query
        .nonce
        .filter(|n| !n.is_empty())
        .or_else(|| form.and_then(|Form(f)| f.nonce))
        .unwrap_or_default();

    let record = state
        .protocol
        .acquire(&name, &nonce, state.lease_duration)
        .await?;
    Ok(Json(Acquisition::from(record)))
}

async fn inspect(
    State(state): State<AppState>,
    path: Result<Path<String>, PathRejection>,
) -> Result<Json<LeaseView>, ApiError> {
    let Path(name) = path?;
    let record = state
        .protocol
        .inspect(&name)
        .await?
        .ok_or_else(|| ApiError::NotFound { name: name.clone() })?;
    let held = record.is_held(state.protocol.now());
    Ok(Json(LeaseView::new(record, held)))
}

async fn mutate_value(
    State(state): State<AppState>,
    path: Result<Path<(String, String)>, PathRejection>,
    value: Result<Bytes, BytesRejection>,
) -> Result<StatusCode, ApiError> {
    let Path((name, raw_fence)) = path?;
    let fence = parse_fence(&raw_fence)?;
    let value = String::from_utf8(value?.to_vec())
        .map_err(|_| fence::Error::MalformedInput("value is not valid UTF-8".to_string()))?;

    state
        .protocol
        .mutate_value(&name, fence, state.lease_duration, &value)
        .await?;
    Ok(StatusCode::OK)
}

async fn heartbeat(
    State(state): State<AppState>,
    path: Result<Path<(String, String)>, PathRejection>,
) -> Result<StatusCode, ApiError> {
    let Path((name, raw_fence)) = path?;
    let fence = parse_fence(&raw_fence)?;
    state
        .protocol
        .heartbeat(&name, fence, state.lease_duration)
        .await?;
    Ok(StatusCode::OK)
}

async fn release(
    State(state): State<AppState>,
    path: Result<Path<(String, String)>, PathRejection>,
) -> Result<StatusCode, ApiError> {
    let Path((name, raw_fence)) = path?;
    let fence = parse_fence(&raw_fence)?;
    state.protocol.release(&name, fence).await?;
    Ok(StatusCode::OK)
}

async fn get_status(State(state): State<AppState>) -> Json<ServiceStatus> {
    Json(ServiceStatus {
        backend: state.protocol.store().backend().to_string(),
        lease_duration_secs: state.lease_duration.as_secs(),
        uptime_seconds: state.started.elapsed().as_secs(),
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/locks/:name", put(acquire).post(acquire).get(inspect))
        .route(
            "/locks/:name/:fence",
            put(mutate_value).post(mutate_value).delete(release),
        )
        .route("/locks/:name/:fence/heartbeat", post(heartbeat))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves, then drain in-flight requests.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("API endpoints:");
    info!("  PUT    /locks/:name                   - Acquire (nonce via ?nonce= or form)");
    info!("  GET    /locks/:name                   - Inspect");
    info!("  PUT    /locks/:name/:fence            - Update value and renew");
    info!("  POST   /locks/:name/:fence/heartbeat  - Renew");
    info!("  DELETE /locks/:name/:fence            - Release");
    info!("  GET    /status                        - Service status");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
