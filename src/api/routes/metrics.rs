//! Prometheus exposition
//!
//! - GET /metrics

use axum::{extract::State, http::header, response::IntoResponse};
use std::sync::Arc;

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;

/// GET /metrics
pub async fn export_metrics(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let body = state
        .metrics
        .encode()
        .map_err(|e| ApiError::Internal(format!("Encoding metrics failed: {}", e)))?;

    Ok(([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body))
}
