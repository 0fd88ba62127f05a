//! Application State
//!
//! Shared state accessible by all API handlers.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

use crate::cache::DeviceStateCache;
use crate::config::ApiConfig;
use crate::events::EventBroker;
use crate::telemetry::Metrics;
use crate::websocket::{DeviceMessageHub, DeviceSpecificHub, HubConfig};
use crate::worker::LoopState;

/// Lifecycle of one background worker, as reported by health
#[derive(Clone)]
pub struct WorkerStatus {
    pub name: String,
    pub state: watch::Receiver<LoopState>,
}

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<EventBroker>,
    pub cache: Arc<DeviceStateCache>,
    pub metrics: Arc<Metrics>,
    /// Hub behind `/ws/device-messages`
    pub device_messages: Arc<DeviceMessageHub>,
    /// Hub behind `/ws/devices/:device_id/messages`
    pub device_specific: Arc<DeviceSpecificHub>,
    pub workers: Vec<WorkerStatus>,
    pub config: Arc<ApiConfig>,
    /// Server start time for uptime tracking
    pub start_time: Instant,
}

impl AppState {
    /// Create state with both hubs built from `hub_config`
    ///
    /// The hub loops are not started here; see [`DeviceMessageHub::run`].
    pub fn new(
        broker: Arc<EventBroker>,
        cache: Arc<DeviceStateCache>,
        metrics: Arc<Metrics>,
        hub_config: HubConfig,
        config: ApiConfig,
    ) -> Self {
        let device_messages = Arc::new(DeviceMessageHub::new(
            hub_config.clone(),
            Arc::clone(&cache),
            &metrics,
        ));
        let device_specific = Arc::new(DeviceSpecificHub::new(hub_config, Arc::clone(&cache), &metrics));

        Self {
            broker,
            cache,
            metrics,
            device_messages,
            device_specific,
            workers: Vec::new(),
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }

    /// Track a worker's loop state in health reports
    pub fn with_worker(mut self, name: impl Into<String>, state: watch::Receiver<LoopState>) -> Self {
        self.workers.push(WorkerStatus {
            name: name.into(),
            state,
        });
        self
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// True when every tracked worker is running
    pub fn workers_running(&self) -> bool {
        self.workers
            .iter()
            .all(|worker| *worker.state.borrow() == LoopState::Running)
    }
}
