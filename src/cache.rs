//! Last known state per device
//!
//! Fed by uplink ingestion, read by the WebSocket hubs to greet new
//! connections with something to show.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::domain::{DeviceState, SensorData};

#[derive(Default)]
pub struct DeviceStateCache {
    states: RwLock<HashMap<String, DeviceState>>,
}

impl DeviceStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the state of `device_id`, stamped with the current time
    pub async fn set_state(&self, device_id: &str, data: SensorData) {
        self.set_state_at(device_id, data, Utc::now()).await;
    }

    /// Replace the state of `device_id` with an explicit timestamp
    pub async fn set_state_at(&self, device_id: &str, data: SensorData, timestamp: DateTime<Utc>) {
        let state = DeviceState {
            device_id: device_id.to_string(),
            timestamp,
            data,
        };
        self.states.write().await.insert(device_id.to_string(), state);
    }

    pub async fn get_state(&self, device_id: &str) -> Option<DeviceState> {
        self.states.read().await.get(device_id).cloned()
    }

    pub async fn all_device_ids(&self) -> Vec<String> {
        self.states.read().await.keys().cloned().collect()
    }

    pub async fn all_states(&self) -> Vec<DeviceState> {
        self.states.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SensorReading;

    #[tokio::test]
    async fn test_set_and_get() {
        let cache = DeviceStateCache::new();
        let mut data = SensorData::new();
        data.insert("temperature".to_string(), vec![SensorReading { index: 0, value: 25.5 }]);

        cache.set_state("test-device", data).await;

        let state = cache.get_state("test-device").await.unwrap();
        assert_eq!(state.device_id, "test-device");
        assert_eq!(state.data["temperature"][0].value, 25.5);
        assert!(cache.get_state("other").await.is_none());
        assert_eq!(cache.all_device_ids().await, vec!["test-device".to_string()]);
    }

    #[tokio::test]
    async fn test_set_replaces_previous() {
        let cache = DeviceStateCache::new();
        cache.set_state("d1", SensorData::new()).await;

        let mut data = SensorData::new();
        data.insert("humidity".to_string(), vec![SensorReading { index: 0, value: 60.0 }]);
        cache.set_state("d1", data).await;

        let states = cache.all_states().await;
        assert_eq!(states.len(), 1);
        assert!(states[0].data.contains_key("humidity"));
    }
}
