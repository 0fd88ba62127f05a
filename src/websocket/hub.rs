//! WebSocket hubs
//!
//! Each hub runs one event loop that owns registration, unregistration and
//! fan-out of broker events. Connection tasks talk to it through channels.

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::client::{ClientHandle, ClientRegistry, HubConfig, HubError};
use super::messages::DeviceMessage;
use crate::cache::DeviceStateCache;
use crate::domain::DeviceState;
use crate::events::{topics, EventBroker};
use crate::telemetry::Metrics;

type Receivers = (
    mpsc::UnboundedReceiver<ClientHandle>,
    mpsc::UnboundedReceiver<String>,
);

/// Register/unregister channels into a hub loop
struct Registration {
    register_tx: mpsc::UnboundedSender<ClientHandle>,
    unregister_tx: mpsc::UnboundedSender<String>,
    receivers: Mutex<Option<Receivers>>,
}

impl Registration {
    fn new() -> Self {
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        Self {
            register_tx,
            unregister_tx,
            receivers: Mutex::new(Some((register_rx, unregister_rx))),
        }
    }

    fn register(&self, client: ClientHandle) -> Result<(), HubError> {
        self.register_tx.send(client).map_err(|e| {
            e.0.close();
            HubError::Stopped
        })
    }

    fn unregister(&self, id: &str) {
        // A stopped hub has already closed every client
        let _ = self.unregister_tx.send(id.to_string());
    }

    /// Receivers for the loop; `None` once a loop has started
    fn take(&self) -> Option<Receivers> {
        self.receivers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Queue cached states for a new client, oldest device id first
fn send_states(client: ClientHandle, mut states: Vec<DeviceState>) {
    if states.is_empty() {
        return;
    }
    states.sort_by(|a, b| a.device_id.cmp(&b.device_id));

    tokio::spawn(async move {
        let count = states.len();
        for state in &states {
            let text = match DeviceMessage::from_state(state).to_text() {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(device_id = %state.device_id, error = %e, "Serializing cached state failed");
                    continue;
                }
            };
            if let Err(e) = client.send(text).await {
                tracing::debug!(client_id = %client.id(), error = %e, "Stopped sending cached states");
                return;
            }
        }
        tracing::debug!(client_id = %client.id(), states = count, "Cached states sent");
    });
}

/// `GET /ws/device-messages`: every device's traffic to every client
pub struct DeviceMessageHub {
    config: HubConfig,
    cache: Arc<DeviceStateCache>,
    clients: ClientRegistry,
    registration: Registration,
}

impl DeviceMessageHub {
    pub fn new(config: HubConfig, cache: Arc<DeviceStateCache>, metrics: &Metrics) -> Self {
        let gauge = metrics.ws_connections.with_label_values(&["device_messages"]);
        Self {
            config,
            cache,
            clients: ClientRegistry::new("device_messages", gauge),
            registration: Registration::new(),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn register(&self, client: ClientHandle) -> Result<(), HubError> {
        self.registration.register(client)
    }

    pub fn unregister(&self, id: &str) {
        self.registration.unregister(id);
    }

    pub async fn client_count(&self) -> usize {
        self.clients.len().await
    }

    /// Event loop; returns when `cancel` fires or the broker stops
    pub async fn run(self: Arc<Self>, broker: Arc<EventBroker>, cancel: CancellationToken) {
        let Some((mut register_rx, mut unregister_rx)) = self.registration.take() else {
            tracing::warn!("Device message hub already running");
            return;
        };

        let mut subscription = match broker.subscribe(topics::DEVICE_MESSAGES) {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::error!(error = %e, "Device message hub could not subscribe");
                return;
            }
        };
        let (broadcast_tx, mut broadcast_rx) = mpsc::channel::<DeviceMessage>(self.config.broadcast_capacity.max(1));

        tracing::info!("Device message hub started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(client) = register_rx.recv() => {
                    self.clients.insert(client.clone()).await;
                    send_states(client, self.cache.all_states().await);
                }
                Some(id) = unregister_rx.recv() => {
                    self.clients.remove(&id).await;
                }
                Some(message) = broadcast_rx.recv() => {
                    match message.to_text() {
                        Ok(text) => {
                            self.clients.send_where(&text, |_| true).await;
                        }
                        Err(e) => tracing::error!(error = %e, "Serializing device message failed"),
                    }
                }
                received = subscription.recv() => {
                    let Some(received) = received else {
                        tracing::info!("Broker stopped, device message hub exiting");
                        break;
                    };
                    let Some(message) = DeviceMessage::from_event(&received.event) else {
                        continue;
                    };
                    if let Err(mpsc::error::TrySendError::Full(_)) = broadcast_tx.try_send(message) {
                        tracing::warn!("Broadcast buffer full, dropping message");
                    }
                }
            }
        }

        if let Err(e) = broker.unsubscribe(topics::DEVICE_MESSAGES, subscription.id()) {
            tracing::debug!(error = %e, "Device message hub unsubscribe");
        }
        self.clients.close_all().await;
        tracing::info!("Device message hub stopped");
    }
}

/// `GET /ws/devices/{device_id}/messages`: one device's traffic
pub struct DeviceSpecificHub {
    config: HubConfig,
    cache: Arc<DeviceStateCache>,
    clients: ClientRegistry,
    registration: Registration,
}

impl DeviceSpecificHub {
    pub fn new(config: HubConfig, cache: Arc<DeviceStateCache>, metrics: &Metrics) -> Self {
        let gauge = metrics.ws_connections.with_label_values(&["device_specific"]);
        Self {
            config,
            cache,
            clients: ClientRegistry::new("device_specific", gauge),
            registration: Registration::new(),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Register a client; its handle must carry a device id
    pub fn register(&self, client: ClientHandle) -> Result<(), HubError> {
        self.registration.register(client)
    }

    pub fn unregister(&self, id: &str) {
        self.registration.unregister(id);
    }

    pub async fn client_count(&self) -> usize {
        self.clients.len().await
    }

    pub async fn run(self: Arc<Self>, broker: Arc<EventBroker>, cancel: CancellationToken) {
        let Some((mut register_rx, mut unregister_rx)) = self.registration.take() else {
            tracing::warn!("Device specific hub already running");
            return;
        };

        let mut subscription = match broker.subscribe(topics::DEVICE_MESSAGES) {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::error!(error = %e, "Device specific hub could not subscribe");
                return;
            }
        };

        tracing::info!("Device specific hub started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(client) = register_rx.recv() => {
                    let state = match client.device_id() {
                        Some(device_id) => self.cache.get_state(device_id).await,
                        None => None,
                    };
                    tracing::debug!(client_id = %client.id(), device_id = ?client.device_id(), "Registering device client");
                    self.clients.insert(client.clone()).await;
                    send_states(client, state.into_iter().collect());
                }
                Some(id) = unregister_rx.recv() => {
                    self.clients.remove(&id).await;
                }
                received = subscription.recv() => {
                    let Some(received) = received else {
                        tracing::info!("Broker stopped, device specific hub exiting");
                        break;
                    };
                    let Some(message) = DeviceMessage::from_event(&received.event) else {
                        continue;
                    };
                    self.route(&message).await;
                }
            }
        }

        if let Err(e) = broker.unsubscribe(topics::DEVICE_MESSAGES, subscription.id()) {
            tracing::debug!(error = %e, "Device specific hub unsubscribe");
        }
        self.clients.close_all().await;
        tracing::info!("Device specific hub stopped");
    }

    /// Deliver to the clients following the message's device
    async fn route(&self, message: &DeviceMessage) -> usize {
        let text = match message.to_text() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "Serializing device message failed");
                return 0;
            }
        };
        let device_id = message.device_id.as_str();
        self.clients
            .send_where(&text, |client| client.device_id() == Some(device_id))
            .await
    }
}
