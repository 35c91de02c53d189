// # HTTP Surface
//
// JSON client API plus the internal endpoints peers use for forwarding,
// replication delivery and event fan-in. Every request gets a correlation
// id: taken from X-Correlation-ID when the client sent one, generated
// otherwise, and always echoed on the response.
//
// Client endpoints:
//   GET/PUT/DELETE /api/cache/{store}/{key}
//   DELETE         /api/cache/{store}
//   POST           /api/cache/{store}/batch/get
//   POST           /api/cache/{store}/batch/set
//   GET            /health | /api/cluster/status | /api/node/metrics
//   GET            /api/config
//
// Internal endpoints (bincode bodies):
//   POST /internal/forward | /internal/replicate | /internal/events

use crate::cluster::coordinator::Coordinator;
use crate::cluster::events::EventBus;
use crate::cluster::replication::Replicator;
use crate::cluster::router::{
    ForwardReply, ForwardRequest, OpOutcome, Operation, RequestContext, RequestRouter, Surface,
};
use crate::common::{new_correlation_id, now_millis};
use crate::config::HyperCacheConfig;
use crate::engine::CacheEngine;
use crate::error::{CacheError, Result};
use crate::persistence::PersistenceEngine;
use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

const CORRELATION_HEADER: &str = "x-correlation-id";

fn codec() -> bincode::config::Configuration {
    bincode::config::standard()
}

#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

pub struct AppState {
    pub router: Arc<RequestRouter>,
    pub engine: Arc<CacheEngine>,
    pub coordinator: Arc<Coordinator>,
    pub replicator: Arc<Replicator>,
    pub persistence: Arc<PersistenceEngine>,
    pub bus: Arc<EventBus>,
    pub config: HyperCacheConfig,
    pub ready: AtomicBool,
    pub started_at_ms: u64,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/api/cache/{store}/{key}",
            get(get_key).put(put_key).delete(delete_key),
        )
        .route("/api/cache/{store}", axum::routing::delete(clear_store))
        .route("/api/cache/{store}/batch/get", post(batch_get))
        .route("/api/cache/{store}/batch/set", post(batch_set))
        .route("/health", get(health))
        .route("/api/cluster/status", get(cluster_status))
        .route("/api/node/metrics", get(node_metrics))
        .route("/api/config", get(get_config))
        .route("/internal/forward", post(internal_forward))
        .route("/internal/replicate", post(internal_replicate))
        .route("/internal/events", post(internal_events))
        .layer(middleware::from_fn(correlation_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

/// Serve until the shutdown channel flips.
pub async fn run(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .map_err(|e| CacheError::Transport(e.to_string()))?;
    info!(addr = %addr, "HTTP server listening");
    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| CacheError::Transport(e.to_string()))?;
    Ok(())
}

async fn correlation_middleware(mut request: Request, next: Next) -> Response {
    let correlation_id = request
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(new_correlation_id);
    request
        .extensions_mut()
        .insert(CorrelationId(correlation_id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

// Client API

#[derive(Debug, Deserialize)]
struct PutBody {
    value: String,
    ttl_hours: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct BatchGetBody {
    keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BatchSetItem {
    key: String,
    value: String,
    ttl_hours: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct BatchSetBody {
    items: Vec<BatchSetItem>,
}

#[derive(Debug, Serialize)]
struct BatchGetResult {
    key: String,
    value: Option<String>,
}

fn ttl_secs_from_hours(ttl_hours: Option<f64>) -> Option<u64> {
    ttl_hours.map(|hours| (hours * 3600.0).max(0.0) as u64)
}

async fn get_key(
    State(state): State<Arc<AppState>>,
    Path((store, key)): Path<(String, String)>,
    Extension(correlation): Extension<CorrelationId>,
) -> Response {
    let ctx = RequestContext::new(Surface::Http, correlation.0);
    let operation = Operation::Get {
        store: store.clone(),
        key: key.clone().into_bytes(),
    };
    match state.router.execute(operation, &ctx).await {
        Ok(OpOutcome::Value { value, info }) => (
            StatusCode::OK,
            Json(json!({
                "key": key,
                "value": String::from_utf8_lossy(&value),
                "version": info.version,
                "expires_at": info.expires_at,
            })),
        )
            .into_response(),
        Ok(OpOutcome::Missing) => miss_response(&key),
        Ok(_) => internal_error("unexpected outcome"),
        Err(e) => error_response(e),
    }
}

async fn put_key(
    State(state): State<Arc<AppState>>,
    Path((store, key)): Path<(String, String)>,
    Extension(correlation): Extension<CorrelationId>,
    Json(body): Json<PutBody>,
) -> Response {
    let ctx = RequestContext::new(Surface::Http, correlation.0);
    let operation = Operation::Put {
        store,
        key: key.into_bytes(),
        value: body.value.into_bytes(),
        ttl_secs: ttl_secs_from_hours(body.ttl_hours),
    };
    match state.router.execute(operation, &ctx).await {
        Ok(OpOutcome::Stored { version }) => (
            StatusCode::OK,
            Json(json!({"stored": true, "version": version})),
        )
            .into_response(),
        Ok(_) => internal_error("unexpected outcome"),
        Err(e) => error_response(e),
    }
}

async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path((store, key)): Path<(String, String)>,
    Extension(correlation): Extension<CorrelationId>,
) -> Response {
    let ctx = RequestContext::new(Surface::Http, correlation.0);
    let operation = Operation::Delete {
        store,
        key: key.clone().into_bytes(),
    };
    match state.router.execute(operation, &ctx).await {
        Ok(OpOutcome::Deleted { removed: true }) => {
            (StatusCode::OK, Json(json!({"deleted": true}))).into_response()
        }
        Ok(OpOutcome::Deleted { removed: false }) => miss_response(&key),
        Ok(_) => internal_error("unexpected outcome"),
        Err(e) => error_response(e),
    }
}

async fn clear_store(
    State(state): State<Arc<AppState>>,
    Path(store): Path<String>,
    Extension(correlation): Extension<CorrelationId>,
) -> Response {
    let ctx = RequestContext::new(Surface::Http, correlation.0);
    match state.router.clear_store(&store, &ctx).await {
        Ok(removed) => (StatusCode::OK, Json(json!({"cleared": removed}))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn batch_get(
    State(state): State<Arc<AppState>>,
    Path(store): Path<String>,
    Extension(correlation): Extension<CorrelationId>,
    Json(body): Json<BatchGetBody>,
) -> Response {
    let ctx = RequestContext::new(Surface::Http, correlation.0);
    let mut results = Vec::with_capacity(body.keys.len());
    for key in body.keys {
        let operation = Operation::Get {
            store: store.clone(),
            key: key.clone().into_bytes(),
        };
        match state.router.execute(operation, &ctx).await {
            Ok(OpOutcome::Value { value, .. }) => results.push(BatchGetResult {
                key,
                value: Some(String::from_utf8_lossy(&value).into_owned()),
            }),
            Ok(_) => results.push(BatchGetResult { key, value: None }),
            Err(e) => return error_response(e),
        }
    }
    (StatusCode::OK, Json(json!({"results": results}))).into_response()
}

async fn batch_set(
    State(state): State<Arc<AppState>>,
    Path(store): Path<String>,
    Extension(correlation): Extension<CorrelationId>,
    Json(body): Json<BatchSetBody>,
) -> Response {
    let ctx = RequestContext::new(Surface::Http, correlation.0);
    let mut stored = 0usize;
    let mut failed = Vec::new();
    for item in body.items {
        let operation = Operation::Put {
            store: store.clone(),
            key: item.key.clone().into_bytes(),
            value: item.value.into_bytes(),
            ttl_secs: ttl_secs_from_hours(item.ttl_hours),
        };
        match state.router.execute(operation, &ctx).await {
            Ok(OpOutcome::Stored { .. }) => stored += 1,
            Ok(_) | Err(_) => failed.push(item.key),
        }
    }
    (
        StatusCode::OK,
        Json(json!({"stored": stored, "failed": failed})),
    )
        .into_response()
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    if state.ready.load(Ordering::Acquire) {
        (
            StatusCode::OK,
            Json(json!({"status": "ok", "node": state.coordinator.local_id()})),
        )
            .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "starting"})),
        )
            .into_response()
    }
}

async fn cluster_status(State(state): State<Arc<AppState>>) -> Response {
    let health = state.coordinator.health();
    let members: Vec<_> = state
        .coordinator
        .members()
        .into_iter()
        .map(|m| {
            json!({
                "id": m.id,
                "status": format!("{:?}", m.status).to_lowercase(),
                "gossip_addr": m.gossip_addr,
                "resp_addr": m.resp_addr,
                "http_addr": m.http_addr,
                "incarnation": m.incarnation,
            })
        })
        .collect();
    (
        StatusCode::OK,
        Json(json!({
            "self": health.local_id,
            "ring_version": health.ring_version,
            "replication_factor": state.coordinator.replication_factor(),
            "members": members,
            "alive": health.alive,
            "suspect": health.suspect,
            "dead": health.dead,
            "left": health.left,
        })),
    )
        .into_response()
}

async fn node_metrics(State(state): State<Arc<AppState>>) -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "node": state.coordinator.local_id(),
            "uptime_ms": now_millis().saturating_sub(state.started_at_ms),
            "cache": state.engine.stats(),
            "persistence": state.persistence.stats(),
            "replication": state.replicator.stats(),
            "events": {
                "published": state.bus.published(),
                "dropped": state.bus.dropped_total(),
                "duplicates_suppressed": state.bus.duplicates_suppressed(),
                "subscribers": state.bus.subscriber_stats(),
            },
        })),
    )
        .into_response()
}

async fn get_config(State(state): State<Arc<AppState>>) -> Response {
    (StatusCode::OK, Json(json!({"config": &state.config}))).into_response()
}

// Internal surface

async fn internal_forward(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Response {
    let request: ForwardRequest = match bincode::serde::decode_from_slice(&body, codec()) {
        Ok((request, _)) => request,
        Err(e) => {
            warn!(error = %e, "undecodable forward request");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    let ctx = RequestContext::new(Surface::Http, request.correlation_id.clone());
    let result = state.router.execute_local(request.operation, &ctx).await;
    let reply = ForwardReply::from_result(result);
    match bincode::serde::encode_to_vec(&reply, codec()) {
        Ok(bytes) => (StatusCode::OK, Bytes::from(bytes)).into_response(),
        Err(e) => internal_error(&e.to_string()),
    }
}

async fn internal_replicate(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Response {
    let envelope = match bincode::serde::decode_from_slice(&body, codec()) {
        Ok((envelope, _)) => envelope,
        Err(e) => {
            warn!(error = %e, "undecodable replication envelope");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    match state.replicator.apply_incoming(&envelope) {
        Ok(applied) => (StatusCode::OK, Json(json!({"applied": applied}))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn internal_events(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Response {
    let envelope = match bincode::serde::decode_from_slice(&body, codec()) {
        Ok((envelope, _)) => envelope,
        Err(e) => {
            warn!(error = %e, "undecodable event envelope");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    let accepted = state.bus.ingest_remote(envelope);
    (StatusCode::OK, Json(json!({"accepted": accepted}))).into_response()
}

// Error mapping

fn miss_response(key: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "not found", "key": key})),
    )
        .into_response()
}

fn internal_error(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": message})),
    )
        .into_response()
}

fn error_response(e: CacheError) -> Response {
    let status = match &e {
        CacheError::NotFound | CacheError::Expired | CacheError::UnknownStore(_) => {
            StatusCode::NOT_FOUND
        }
        CacheError::ConfigInvalid(_) | CacheError::Protocol(_) => StatusCode::BAD_REQUEST,
        CacheError::Timeout(_) | CacheError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
        CacheError::BudgetExceeded { .. } | CacheError::FilterFull => {
            StatusCode::INSUFFICIENT_STORAGE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": e.to_string()}))).into_response()
}
