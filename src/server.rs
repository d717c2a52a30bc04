//! HTTP surface
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `POST /render`, `POST /api/saveImg` | render a card, PNG body |
//! | `POST /render?variant=promo`, `POST /api/wxSaveImg` | same, promotional footer |
//! | `GET /health` | fixed liveness payload |
//! | `GET /api` | plain-text liveness answer for older callers |
//! | `GET /health/details` | pool, queue and cache snapshot |
//! | `GET /metrics` | Prometheus text |

use crate::{HealthSnapshot, RenderError, RenderService};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RenderService>,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RenderQuery {
    pub variant: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/render", post(render))
        .route("/api/saveImg", post(render_plain))
        .route("/api/wxSaveImg", post(render_promo))
        .route("/api", get(hello))
        .route("/health", get(health))
        .route("/health/details", get(health_details))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then stop accepting connections.
pub async fn serve<F>(state: AppState, addr: SocketAddr, shutdown: F) -> Result<(), RenderError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

pub async fn render(
    State(state): State<AppState>,
    Query(query): Query<RenderQuery>,
    body: Bytes,
) -> Response {
    let promo = query.variant.as_deref() == Some("promo");
    render_response(&state, body, promo).await
}

pub async fn render_plain(State(state): State<AppState>, body: Bytes) -> Response {
    render_response(&state, body, false).await
}

pub async fn render_promo(State(state): State<AppState>, body: Bytes) -> Response {
    render_response(&state, body, true).await
}

async fn render_response(state: &AppState, body: Bytes, promo: bool) -> Response {
    let body = match parse_body(&body) {
        Ok(body) => body,
        Err(e) => return error_response(&e),
    };

    match state.service.render_body(body, promo).await {
        Ok(png) => ([(header::CONTENT_TYPE, "image/png")], png).into_response(),
        Err(e) => error_response(&e),
    }
}

/// An empty body reads as an empty object.
fn parse_body(body: &[u8]) -> Result<Value, RenderError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(body)
        .map_err(|e| RenderError::InvalidRequest(format!("body is not valid JSON: {e}")))
}

fn error_response(err: &RenderError) -> Response {
    let status = match err {
        RenderError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        RenderError::PoolShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Responding {}: {}", status, err);
    }
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        err.to_string(),
    )
        .into_response()
}

pub async fn hello() -> &'static str {
    "hello world"
}

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub async fn health_details(State(state): State<AppState>) -> Json<HealthSnapshot> {
    Json(HealthSnapshot::capture(&state.service))
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => {
            state.service.refresh_gauges();
            (
                [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                handle.render(),
            )
                .into_response()
        }
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed").into_response(),
    }
}
