//! Request and response bodies

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::{SensorData, Uplink};

/// Body of `POST /api/v1/uplinks`
#[derive(Debug, Clone, Deserialize)]
pub struct UplinkRequest {
    pub device_id: String,
    #[serde(default)]
    pub dev_eui: String,
    /// Defaults to the time the request arrived
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub port: u8,
    #[serde(default)]
    pub decoded_payload: SensorData,
    #[serde(default)]
    pub correlation_ids: Vec<String>,
}

impl UplinkRequest {
    pub fn into_uplink(self, now: DateTime<Utc>) -> Uplink {
        Uplink {
            device_id: self.device_id.trim().to_string(),
            dev_eui: self.dev_eui,
            received_at: self.received_at.unwrap_or(now),
            port: self.port,
            decoded_payload: self.decoded_payload,
            correlation_ids: self.correlation_ids,
        }
    }
}

/// Response of `POST /api/v1/uplinks`
#[derive(Debug, Serialize, Deserialize)]
pub struct UplinkResponse {
    pub status: String,
    pub device_id: String,
    pub received_at: DateTime<Utc>,
}

/// Full health status
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall status: healthy or degraded
    pub status: String,
    pub uptime_seconds: u64,
    pub version: String,
    pub broker: BrokerHealth,
    pub websocket: WebSocketHealth,
    /// Loop state per worker
    pub workers: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BrokerHealth {
    pub topics: Vec<TopicHealth>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopicHealth {
    pub name: String,
    pub subscribers: usize,
}

/// Open connections per hub
#[derive(Debug, Serialize, Deserialize)]
pub struct WebSocketHealth {
    pub device_messages: usize,
    pub device_specific: usize,
}
