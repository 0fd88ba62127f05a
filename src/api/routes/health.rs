//! Health Routes
//!
//! - GET /health/live - Liveness probe (process is alive)
//! - GET /health/ready - Readiness probe (workers running)
//! - GET /health - Full health status

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::api::dto::{BrokerHealth, HealthResponse, TopicHealth, WebSocketHealth};
use crate::api::state::AppState;

/// GET /health/live
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// GET /health/ready
///
/// 503 until every background worker has reached its running state, and
/// again once shutdown begins.
pub async fn readiness(State(state): State<Arc<AppState>>) -> StatusCode {
    if state.workers_running() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /health
pub async fn full_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let topics = state
        .broker
        .topics()
        .into_iter()
        .map(|name| TopicHealth {
            subscribers: state.broker.subscriber_count(&name),
            name,
        })
        .collect();

    let workers = state
        .workers
        .iter()
        .map(|worker| (worker.name.clone(), worker.state.borrow().as_str().to_string()))
        .collect();

    let status = if state.workers_running() { "healthy" } else { "degraded" };

    Json(HealthResponse {
        status: status.to_string(),
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        broker: BrokerHealth { topics },
        websocket: WebSocketHealth {
            device_messages: state.device_messages.client_count().await,
            device_specific: state.device_specific.client_count().await,
        },
        workers,
    })
}
