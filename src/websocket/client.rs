//! Connected clients as seen by a hub

use prometheus::IntGauge;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Timeouts and buffer sizes shared by both hubs
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Read deadline, refreshed by every pong
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,

    /// Largest inbound message accepted, in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Pending messages of the broadcast hub
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    /// Pending messages per client; a client that falls this far behind is dropped
    #[serde(default = "default_client_queue_capacity")]
    pub client_queue_capacity: usize,
}

fn default_ping_interval_secs() -> u64 {
    54
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_write_timeout_secs() -> u64 {
    10
}

fn default_max_message_size() -> usize {
    512
}

fn default_broadcast_capacity() -> usize {
    256
}

fn default_client_queue_capacity() -> usize {
    64
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            max_message_size: default_max_message_size(),
            broadcast_capacity: default_broadcast_capacity(),
            client_queue_capacity: default_client_queue_capacity(),
        }
    }
}

impl HubConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// Hub errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HubError {
    #[error("Hub is not running")]
    Stopped,

    #[error("Client {0} is closed")]
    ClientClosed(String),

    #[error("Client {0} is not keeping up")]
    ClientBacklogged(String),
}

/// Sending side of one connection
///
/// The connection task owns the socket and drains `outbound`.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: String,
    device_id: Option<String>,
    outbound: mpsc::Sender<String>,
    closed: CancellationToken,
}

impl ClientHandle {
    /// New handle and the queue its connection drains
    pub fn new(device_id: Option<String>, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: Uuid::new_v4().to_string(),
            device_id,
            outbound,
            closed: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Device this client follows; `None` for the all-devices stream
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// Queue a text frame without waiting
    pub fn try_send(&self, text: String) -> Result<(), HubError> {
        if self.is_closed() {
            return Err(HubError::ClientClosed(self.id.clone()));
        }
        self.outbound.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => HubError::ClientBacklogged(self.id.clone()),
            mpsc::error::TrySendError::Closed(_) => HubError::ClientClosed(self.id.clone()),
        })
    }

    /// Queue a text frame, waiting for room
    pub async fn send(&self, text: String) -> Result<(), HubError> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(HubError::ClientClosed(self.id.clone())),
            result = self.outbound.send(text) => {
                result.map_err(|_| HubError::ClientClosed(self.id.clone()))
            }
        }
    }

    /// Ask the connection to close; safe to call any number of times
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Registered clients of one hub
pub(crate) struct ClientRegistry {
    hub: &'static str,
    clients: RwLock<HashMap<String, ClientHandle>>,
    gauge: IntGauge,
}

impl ClientRegistry {
    pub fn new(hub: &'static str, gauge: IntGauge) -> Self {
        Self {
            hub,
            clients: RwLock::new(HashMap::new()),
            gauge,
        }
    }

    pub async fn insert(&self, client: ClientHandle) {
        let mut clients = self.clients.write().await;
        clients.insert(client.id.clone(), client);
        self.gauge.set(clients.len() as i64);
        tracing::info!(hub = self.hub, total_clients = clients.len(), "WebSocket client registered");
    }

    /// Remove and close a client; false when it was already gone
    pub async fn remove(&self, id: &str) -> bool {
        let mut clients = self.clients.write().await;
        let Some(client) = clients.remove(id) else {
            return false;
        };
        client.close();
        self.gauge.set(clients.len() as i64);
        tracing::info!(hub = self.hub, total_clients = clients.len(), "WebSocket client unregistered");
        true
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Queue `text` for every client accepted by `filter`
    ///
    /// Clients that cannot take the frame are removed and closed. Returns the
    /// number of clients the frame was queued for.
    pub async fn send_where<F>(&self, text: &str, filter: F) -> usize
    where
        F: Fn(&ClientHandle) -> bool,
    {
        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let clients = self.clients.read().await;
            for client in clients.values().filter(|c| filter(c)) {
                match client.try_send(text.to_string()) {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        tracing::warn!(hub = self.hub, client_id = %client.id, error = %e, "Dropping WebSocket client");
                        failed.push(client.id.clone());
                    }
                }
            }
        }

        for id in failed {
            self.remove(&id).await;
        }
        delivered
    }

    /// Close every client
    pub async fn close_all(&self) {
        let mut clients = self.clients.write().await;
        for client in clients.values() {
            client.close();
        }
        clients.clear();
        self.gauge.set(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ClientRegistry {
        ClientRegistry::new("test", IntGauge::new("test_clients", "clients").unwrap())
    }

    #[test]
    fn test_close_is_idempotent() {
        let (client, _rx) = ClientHandle::new(None, 4);
        client.close();
        client.close();
        assert!(client.is_closed());
        assert!(matches!(client.try_send("x".to_string()), Err(HubError::ClientClosed(_))));
    }

    #[tokio::test]
    async fn test_send_where_filters() {
        let registry = registry();
        let (a, mut rx_a) = ClientHandle::new(Some("dev-a".to_string()), 4);
        let (b, mut rx_b) = ClientHandle::new(Some("dev-b".to_string()), 4);
        registry.insert(a).await;
        registry.insert(b).await;

        let delivered = registry
            .send_where("hello", |c| c.device_id() == Some("dev-a"))
            .await;

        assert_eq!(delivered, 1);
        assert_eq!(rx_a.recv().await.as_deref(), Some("hello"));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_backlogged_client_is_removed() {
        let registry = registry();
        let (slow, _rx) = ClientHandle::new(None, 1);
        registry.insert(slow.clone()).await;

        assert_eq!(registry.send_where("one", |_| true).await, 1);
        assert_eq!(registry.send_where("two", |_| true).await, 0);

        assert_eq!(registry.len().await, 0);
        assert!(slow.is_closed());
        assert!(!registry.remove(slow.id()).await);
    }
}
