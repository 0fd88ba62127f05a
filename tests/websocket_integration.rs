//! End-to-end WebSocket tests against a real listener

use chrono::Utc;
use futures_util::StreamExt;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use devicehub::api::{build_router, AppState};
use devicehub::broker::BrokerConfig;
use devicehub::cache::DeviceStateCache;
use devicehub::config::ApiConfig;
use devicehub::domain::{SensorData, SensorReading, Uplink};
use devicehub::events::{topics, Event, EventBroker};
use devicehub::telemetry::Metrics;
use devicehub::websocket::{DeviceMessageHub, DeviceSpecificHub, HubConfig};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    addr: SocketAddr,
    broker: Arc<EventBroker>,
    cache: Arc<DeviceStateCache>,
    device_messages: Arc<DeviceMessageHub>,
    device_specific: Arc<DeviceSpecificHub>,
    cancel: CancellationToken,
}

impl Drop for Server {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start_server() -> Server {
    let broker = Arc::new(EventBroker::new(BrokerConfig::default()));
    let cache = Arc::new(DeviceStateCache::new());
    let metrics = Arc::new(Metrics::new().unwrap());
    let state = AppState::new(
        Arc::clone(&broker),
        Arc::clone(&cache),
        metrics,
        HubConfig::default(),
        ApiConfig::default(),
    );
    let device_messages = Arc::clone(&state.device_messages);
    let device_specific = Arc::clone(&state.device_specific);

    let cancel = CancellationToken::new();
    tokio::spawn(Arc::clone(&device_messages).run(Arc::clone(&broker), cancel.child_token()));
    tokio::spawn(Arc::clone(&device_specific).run(Arc::clone(&broker), cancel.child_token()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = cancel.child_token();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .unwrap();
    });

    Server {
        addr,
        broker,
        cache,
        device_messages,
        device_specific,
        cancel,
    }
}

fn readings(value: f64) -> SensorData {
    let mut data = SensorData::new();
    data.insert("temperature".to_string(), vec![SensorReading { index: 0, value }]);
    data
}

fn uplink(device_id: &str, value: f64) -> Event {
    Event::Uplink(Uplink {
        device_id: device_id.to_string(),
        dev_eui: String::new(),
        received_at: Utc::now(),
        port: 2,
        decoded_payload: readings(value),
        correlation_ids: Vec::new(),
    })
}

async fn connect(addr: SocketAddr, path: &str) -> Socket {
    let (socket, _) = connect_async(format!("ws://{}{}", addr, path)).await.unwrap();
    socket
}

/// Next text frame as JSON, skipping pings
async fn next_json(socket: &mut Socket) -> Value {
    let deadline = Duration::from_secs(5);
    loop {
        let frame = tokio::time::timeout(deadline, socket.next())
            .await
            .expect("timed out waiting for a message")
            .expect("socket closed")
            .unwrap();
        match frame {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

async fn wait_for_clients<F, Fut>(count: F, expected: usize)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = usize>,
{
    for _ in 0..100 {
        if count().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {} clients", expected);
}

#[tokio::test]
async fn test_device_socket_gets_cached_state_then_own_traffic() {
    let server = start_server().await;
    server.cache.set_state("dev-1", readings(25.5)).await;

    let mut socket = connect(server.addr, "/ws/devices/dev-1/messages").await;

    let first = next_json(&mut socket).await;
    assert_eq!(first["type"], "device_state");
    assert_eq!(first["device_id"], "dev-1");
    assert_eq!(first["data"]["temperature"][0]["value"], 25.5);

    server.broker.publish(topics::DEVICE_MESSAGES, uplink("dev-2", 1.0)).unwrap();
    server.broker.publish(topics::DEVICE_MESSAGES, uplink("dev-1", 26.0)).unwrap();

    let next = next_json(&mut socket).await;
    assert_eq!(next["device_id"], "dev-1");
    assert_eq!(next["data"]["temperature"][0]["value"], 26.0);
}

#[tokio::test]
async fn test_broadcast_reaches_every_client() {
    let server = start_server().await;

    let mut first = connect(server.addr, "/ws/device-messages").await;
    let mut second = connect(server.addr, "/ws/device-messages").await;
    let hub = Arc::clone(&server.device_messages);
    wait_for_clients(|| hub.client_count(), 2).await;

    server.broker.publish(topics::DEVICE_MESSAGES, uplink("dev-7", 3.5)).unwrap();

    for socket in [&mut first, &mut second] {
        let message = next_json(socket).await;
        assert_eq!(message["type"], "device_state");
        assert_eq!(message["device_id"], "dev-7");
    }
}

#[tokio::test]
async fn test_uplink_route_streams_to_sockets() {
    let server = start_server().await;

    let mut socket = connect(server.addr, "/ws/devices/dev-9/messages").await;
    let hub = Arc::clone(&server.device_specific);
    wait_for_clients(|| hub.client_count(), 1).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/api/v1/uplinks", server.addr))
        .json(&serde_json::json!({
            "device_id": "dev-9",
            "decoded_payload": {"humidity": [{"index": 1, "value": 40.0}]}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 202);

    let message = next_json(&mut socket).await;
    assert_eq!(message["device_id"], "dev-9");
    assert_eq!(message["data"]["humidity"][0]["index"], 1);
}

#[tokio::test]
async fn test_disconnect_unregisters_client() {
    let server = start_server().await;

    let socket = connect(server.addr, "/ws/device-messages").await;
    let hub = Arc::clone(&server.device_messages);
    wait_for_clients(|| hub.client_count(), 1).await;

    drop(socket);
    wait_for_clients(|| hub.client_count(), 0).await;
}
