//! Reverse-proxy frontend
//!
//! The only request inspection performed here is extracting the query's
//! start time, so the router can match the query window against backend
//! retention horizons. Everything else streams through untouched.
//!
//! Requests address a cluster by leading path segment
//! (`/{cluster}/api/v1/query_range`); single-cluster deployments may omit
//! the prefix.

use crate::backend::{is_hop_by_hop, Backend, ForwardError, ProxiedRequest};
use crate::pool::ServerPool;
use crate::router::RetentionRouter;
use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Query bodies are tiny; anything bigger than this is not a query.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone)]
pub struct FrontendState {
    pub pool: Arc<ServerPool>,
    pub router: RetentionRouter,
    pub retry_count: u32,
}

impl FrontendState {
    pub fn new(pool: Arc<ServerPool>, retry_count: u32) -> Self {
        Self {
            router: RetentionRouter::new(Arc::clone(&pool)),
            pool,
            retry_count,
        }
    }
}

/// Per-request retry budget, set by middleware and read by the proxy
/// handler.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget(pub u32);

pub async fn inject_retry_budget(
    State(state): State<Arc<FrontendState>>,
    mut request: Request,
    next: Next,
) -> Response {
    request.extensions_mut().insert(RetryBudget(state.retry_count));
    next.run(request).await
}

/// Forward one query to the best backend for its time window.
pub async fn proxy(State(state): State<Arc<FrontendState>>, request: Request) -> Response {
    let budget = request
        .extensions()
        .get::<RetryBudget>()
        .copied()
        .unwrap_or(RetryBudget(0));

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
    };

    let Some((cluster_id, downstream_path)) = resolve_cluster(&state.pool, parts.uri.path())
    else {
        error!(path = parts.uri.path(), "request does not address a configured cluster");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let window = query_window(&parts, &body, Utc::now());

    let proxied = ProxiedRequest {
        method: parts.method.as_str().to_string(),
        path_and_query: match parts.uri.query() {
            Some(query) => format!("{downstream_path}?{query}"),
            None => downstream_path,
        },
        headers: parts
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect(),
        body,
    };

    let mut tried: Vec<Arc<Backend>> = Vec::new();
    let mut first_error: Option<ForwardError> = None;
    for _ in 0..=budget.0 {
        let Some(backend) = state.router.target_excluding(&cluster_id, window, &tried) else {
            break;
        };
        match backend.forward(&proxied).await {
            Ok(upstream) => return into_response(upstream),
            Err(e) => {
                warn!(backend = %backend.url(), error = %e, "forward failed, trying next backend");
                first_error.get_or_insert(e);
                tried.push(backend);
            }
        }
    }

    match first_error {
        // Transport failure survives the retry budget and reaches the
        // client as-is.
        Some(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

/// Stream the upstream response back without buffering the body.
fn into_response(upstream: reqwest::Response) -> Response {
    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);

    let mut builder = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }

    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

/// Map the inbound path to `(cluster, downstream path)`.
fn resolve_cluster(pool: &ServerPool, path: &str) -> Option<(String, String)> {
    let trimmed = path.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((first, rest)) if pool.size(first) > 0 => {
            return Some((first.to_string(), format!("/{rest}")));
        }
        None if !trimmed.is_empty() && pool.size(trimmed) > 0 => {
            return Some((trimmed.to_string(), "/".to_string()));
        }
        _ => {}
    }

    // Single-cluster deployments accept unprefixed paths.
    let mut ids = pool.cluster_ids();
    if ids.len() == 1 {
        return Some((ids.remove(0), path.to_string()));
    }
    None
}

/// How far into the past the query reaches: `now - start`, zero when the
/// request carries no parseable start time.
fn query_window(parts: &axum::http::request::Parts, body: &Bytes, now: DateTime<Utc>) -> Duration {
    let from_query = parts
        .uri
        .query()
        .and_then(|query| find_start(query.as_bytes()));
    let from_body = if is_form(parts) { find_start(body) } else { None };

    let Some(start) = from_query.or(from_body) else {
        return Duration::ZERO;
    };
    let Some(start_time) = parse_time(&start) else {
        return Duration::ZERO;
    };
    (now - start_time).to_std().unwrap_or(Duration::ZERO)
}

fn find_start(bytes: &[u8]) -> Option<String> {
    url::form_urlencoded::parse(bytes)
        .find(|(key, _)| key == "start")
        .map(|(_, value)| value.into_owned())
}

fn is_form(parts: &axum::http::request::Parts) -> bool {
    parts
        .headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}

/// Query start times arrive as unix seconds (possibly fractional) or
/// RFC 3339 timestamps.
fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(seconds) = s.parse::<f64>() {
        if !seconds.is_finite() {
            return None;
        }
        return DateTime::from_timestamp(
            seconds.trunc() as i64,
            (seconds.fract().abs() * 1e9) as u32,
        );
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Liveness derives from pool state: degraded while any backend is down,
/// unhealthy when none are left.
async fn healthz(State(state): State<Arc<FrontendState>>) -> impl IntoResponse {
    let backends = state.pool.all_backends();
    let alive = backends.iter().filter(|b| b.is_alive()).count();

    let (status_code, status) = if backends.is_empty() || alive == 0 {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    } else if alive < backends.len() {
        (StatusCode::OK, "degraded")
    } else {
        (StatusCode::OK, "healthy")
    };

    (
        status_code,
        Json(json!({
            "status": status,
            "backends": backends.len(),
            "alive": alive,
        })),
    )
}

async fn readyz(State(state): State<Arc<FrontendState>>) -> impl IntoResponse {
    if state.pool.is_empty() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ready": false })),
        )
    } else {
        (StatusCode::OK, Json(json!({ "ready": true })))
    }
}

/// Create the frontend router: probe endpoints plus the catch-all proxy.
pub fn create_router(state: Arc<FrontendState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .fallback(proxy)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            inject_retry_budget,
        ))
        .with_state(state)
}

/// Start the frontend server
pub async fn serve(port: u16, state: Arc<FrontendState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "starting load balancer frontend");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
