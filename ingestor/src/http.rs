use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use tokio::sync::watch;

use crate::connection::ConnectionState;
use crate::metrics;

#[derive(Debug, Clone)]
struct AppState {
    ingress: watch::Receiver<ConnectionState>,
    egress: watch::Receiver<ConnectionState>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ingress: ConnectionState,
    pub egress: ConnectionState,
}

pub fn create_router(
    ingress: watch::Receiver<ConnectionState>,
    egress: watch::Receiver<ConnectionState>,
) -> Router {
    let state = AppState { ingress, egress };

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let body = HealthResponse {
        ingress: *state.ingress.borrow(),
        egress: *state.egress.borrow(),
    };
    let status = if body.ingress == ConnectionState::Connected
        && body.egress == ConnectionState::Connected
    {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
