//! Health, liveness, and readiness endpoint handlers.
//!
//! These handlers expose server health information for orchestrators
//! (Kubernetes, load balancers) and operational monitoring.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::network::HealthState;

/// Returns detailed health information as JSON.
///
/// Always returns 200; the `state` field and broker block in the body say
/// whether the process can actually do work.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let broker = state.pool.broker();

    Json(json!({
        "state": state.shutdown.health_state().as_str(),
        "role": state.role.as_str(),
        "in_flight": state.shutdown.in_flight_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "broker": {
            "kind": broker.kind(),
            "connected": broker.is_connected(),
        },
        "pool": state.pool.stats(),
    }))
}

/// Liveness probe: always 200 while the process responds.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe: 200 once serving and connected to the broker, 503 otherwise.
///
/// A lost broker connection takes the instance out of rotation until the
/// next successful reconnect.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    let ready = state.shutdown.health_state() == HealthState::Ready;
    if ready && state.pool.broker().is_connected() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
