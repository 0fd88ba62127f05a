//! WebSocket upgrade handlers

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Path, State,
    },
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use super::client::ClientHandle;
use super::connection::pump;
use crate::api::{ApiError, AppState};

/// `GET /ws/device-messages`
pub async fn device_messages_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let hub = Arc::clone(&state.device_messages);
    let config = hub.config().clone();

    ws.max_message_size(config.max_message_size)
        .max_frame_size(config.max_message_size)
        .on_upgrade(move |socket| async move {
            let (client, outbound) = ClientHandle::new(None, config.client_queue_capacity);
            if let Err(e) = hub.register(client.clone()) {
                tracing::warn!(error = %e, "Rejecting WebSocket connection");
                return;
            }
            tracing::info!(client_id = %client.id(), "WebSocket connection established");

            pump(socket, client.clone(), outbound, config).await;
            hub.unregister(client.id());
        })
}

/// `GET /ws/devices/:device_id/messages`
///
/// The device id is checked before the upgrade so a blank id gets a plain 400.
pub async fn device_specific_handler(
    Path(device_id): Path<String>,
    State(state): State<Arc<AppState>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let device_id = device_id.trim().to_string();
    if device_id.is_empty() {
        return ApiError::Validation("device_id is required".to_string()).into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let hub = Arc::clone(&state.device_specific);
    let config = hub.config().clone();

    ws.max_message_size(config.max_message_size)
        .max_frame_size(config.max_message_size)
        .on_upgrade(move |socket| async move {
            let (client, outbound) = ClientHandle::new(Some(device_id.clone()), config.client_queue_capacity);
            if let Err(e) = hub.register(client.clone()) {
                tracing::warn!(device_id = %device_id, error = %e, "Rejecting WebSocket connection");
                return;
            }
            tracing::info!(client_id = %client.id(), device_id = %device_id, "Device WebSocket connection established");

            pump(socket, client.clone(), outbound, config).await;
            hub.unregister(client.id());
        })
}
