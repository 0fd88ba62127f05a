//! Uplink Routes
//!
//! - POST /api/v1/uplinks - Ingest a decoded uplink

use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use std::sync::Arc;

use crate::api::dto::{UplinkRequest, UplinkResponse};
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::events::{topics, Event};

/// POST /api/v1/uplinks
///
/// Updates the device state cache, then publishes the uplink. Having no
/// subscriber on `device_messages` is not an error for the sender.
pub async fn ingest_uplink(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UplinkRequest>,
) -> ApiResult<(StatusCode, Json<UplinkResponse>)> {
    if req.device_id.trim().is_empty() {
        return Err(ApiError::Validation("device_id is required".to_string()));
    }

    let uplink = req.into_uplink(Utc::now());
    let device_id = uplink.device_id.clone();
    let received_at = uplink.received_at;

    state
        .cache
        .set_state_at(&device_id, uplink.decoded_payload.clone(), received_at)
        .await;

    if let Err(e) = state.broker.publish(topics::DEVICE_MESSAGES, Event::Uplink(uplink)) {
        tracing::warn!(device_id = %device_id, error = %e, "Uplink not published");
    }

    tracing::debug!(device_id = %device_id, "Uplink accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(UplinkResponse {
            status: "accepted".to_string(),
            device_id,
            received_at,
        }),
    ))
}
