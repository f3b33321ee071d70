//! HTTP API: metrics exposition and probe endpoints

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use exporter_lib::{
    health::{components, ComponentStatus, HealthRegistry},
    ExporterMetrics, UnitCollector,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Prometheus advertises its per-scrape deadline in this header.
const SCRAPE_TIMEOUT_HEADER: &str = "x-prometheus-scrape-timeout-seconds";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub collector: Arc<UnitCollector>,
    pub metrics: Arc<ExporterMetrics>,
    pub health: HealthRegistry,
    pub default_timeout: Duration,
}

impl AppState {
    pub fn new(
        collector: Arc<UnitCollector>,
        metrics: Arc<ExporterMetrics>,
        health: HealthRegistry,
        default_timeout: Duration,
    ) -> Self {
        Self {
            collector,
            metrics,
            health,
            default_timeout,
        }
    }
}

/// Run one scrape and expose the result in the text format.
async fn metrics(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let timeout = scrape_timeout(&headers).unwrap_or(state.default_timeout);
    let start = Instant::now();

    match state.collector.collect_with_timeout(timeout).await {
        Ok(unit_metrics) => {
            state.metrics.record(&unit_metrics);
            state.health.set_healthy(components::DISCOVERER).await;
            let failed = unit_metrics.iter().filter(|m| m.err).count();
            if failed > 0 {
                state
                    .health
                    .set_degraded(components::COLLECTOR, format!("{failed} units read partially"))
                    .await;
            } else {
                state.health.set_healthy(components::COLLECTOR).await;
            }
        }
        Err(e) => {
            // The whole pass failed; expose an empty unit set this scrape.
            error!(error = %e, "discovery failed");
            state.metrics.inc_discovery_errors();
            state.metrics.record(&[]);
            state
                .health
                .set_unhealthy(components::DISCOVERER, e.to_string())
                .await;
        }
    }
    state
        .metrics
        .observe_scrape_duration(start.elapsed().as_secs_f64());

    match state.metrics.encode() {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            buffer,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Deadline from the scrape request, shaved slightly so we answer before
/// the scraper gives up.
fn scrape_timeout(headers: &HeaderMap) -> Option<Duration> {
    let seconds: f64 = headers.get(SCRAPE_TIMEOUT_HEADER)?.to_str().ok()?.parse().ok()?;
    if seconds <= 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64((seconds - 0.25).max(0.1)))
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health.health().await;
    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health.readiness().await;
    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(readiness))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "starting exporter API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
