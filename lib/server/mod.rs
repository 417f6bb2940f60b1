pub mod monitoring;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus_client::encoding::text::encode;
use serde_json::json;
use tracing::{error, info};

use crate::state::AppState;
use monitoring::{COORDINATION_METRICS, GOVERNOR_METRICS, PIPELINE_METRICS};

async fn health_handler() -> String {
    "Healthy".to_string()
}

async fn expose_metrics(State(state): State<Arc<AppState>>) -> Response {
    let mut buffer = String::new();
    let registry = state.registry.read().await;
    match encode(&mut buffer, &registry) {
        Ok(()) => buffer.into_response(),
        Err(err) => {
            error!(event = "metrics_encode_failed", error = %err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.status()).into_response()
}

/// `POST /control/{pause|resume|stop}`. Only writes the shared run state.
async fn control_handler(
    State(state): State<Arc<AppState>>,
    Path(action): Path<String>,
) -> Response {
    let next = match action.as_str() {
        "pause" => state.control.pause(),
        "resume" => state.control.resume(),
        "stop" => state.control.stop(),
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("unknown action `{other}`") })),
            )
                .into_response()
        }
    };
    info!(
        event = "control_requested",
        action = %action,
        run_state = next.as_str(),
        "run control changed over HTTP"
    );
    Json(json!({ "run_state": next })).into_response()
}

/// Registers every metric family once per process.
pub async fn register_metrics(state: &AppState) {
    let mut registry = state.registry.write().await;

    PIPELINE_METRICS
        .get_or_init(|| async { monitoring::PipelineMetrics::register(&mut registry, "pipeline") })
        .await;
    COORDINATION_METRICS
        .get_or_init(|| async {
            monitoring::CoordinationMetrics::register(&mut registry, "coordination")
        })
        .await;
    GOVERNOR_METRICS
        .get_or_init(|| async { monitoring::GovernorMetrics::register(&mut registry, "governor") })
        .await;

    monitoring::register_build_info_metric(&mut registry, "worker");
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(expose_metrics))
        .route("/status", get(status_handler))
        .route("/control/:action", post(control_handler))
        .with_state(state)
}

/// Starts the health/metrics/status HTTP server on the supplied socket address.
pub async fn setup_server_with_addr(
    state: Arc<AppState>,
    addr: SocketAddr,
) -> Result<tokio::task::JoinHandle<()>, std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_on(state, listener).await
}

/// Serves on an already-bound listener until the shutdown token fires.
pub async fn serve_on(
    state: Arc<AppState>,
    listener: tokio::net::TcpListener,
) -> Result<tokio::task::JoinHandle<()>, std::io::Error> {
    register_metrics(&state).await;

    let shutdown_token = state.shutdown_token.clone();
    let app = router(state);
    let bound = listener.local_addr()?;
    info!(event = "server_listening", bind = %bound, "status server listening");
    let server_handle = tokio::spawn(async move {
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_token.cancelled().await;
        })
        .await;
        if let Err(err) = served {
            error!(event = "server_failed", error = %err, "status server exited with error");
        }
    });

    Ok(server_handle)
}

#[cfg(test)]
mod tests;
