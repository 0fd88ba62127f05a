//! Logging and metrics
//!
//! `Metrics` owns a prometheus registry built once at startup and handed to
//! every component that records something. Nothing registers into the
//! prometheus default registry.

use prometheus::{
    register_gauge_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_vec_with_registry, Encoder, GaugeVec, IntCounterVec, IntGaugeVec,
    Registry, TextEncoder,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("devicehub={},tower_http=debug", config.level))
    });
    let registry = tracing_subscriber::registry().with(filter);

    match config.format.as_str() {
        "json" => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        _ => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Metric instruments shared by the broker, workers and hubs
pub struct Metrics {
    registry: Registry,
    /// Messages dropped on a full subscriber queue, by topic
    pub broker_dropped: IntCounterVec,
    /// Commands dispatched by the command worker, by device
    pub commands: IntCounterVec,
    /// Tasks created from scheduled tasks, by device
    pub scheduled_tasks: IntCounterVec,
    /// Notification attempts, by status
    pub notifications: IntCounterVec,
    /// Command events seen on the broker, by device and event
    pub command_events: IntCounterVec,
    /// Scheduled task executions seen on the broker
    pub scheduled_task_events: IntCounterVec,
    /// Last decoded sensor reading per device, sensor and index
    pub sensor_values: GaugeVec,
    /// Open WebSocket connections per hub
    pub ws_connections: IntGaugeVec,
}

impl Metrics {
    /// Create the registry and register every built-in instrument
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("devicehub".to_string()), None)?;

        let broker_dropped = register_int_counter_vec_with_registry!(
            "broker_dropped_messages_total",
            "Messages dropped because a subscriber queue was full",
            &["topic"],
            registry
        )?;
        let commands = register_int_counter_vec_with_registry!(
            "commands_total",
            "Commands dispatched to devices",
            &["device_name"],
            registry
        )?;
        let scheduled_tasks = register_int_counter_vec_with_registry!(
            "scheduled_tasks_total",
            "Tasks created from scheduled tasks",
            &["device_name"],
            registry
        )?;
        let notifications = register_int_counter_vec_with_registry!(
            "notifications_total",
            "Notifications sent",
            &["status"],
            registry
        )?;
        let command_events = register_int_counter_vec_with_registry!(
            "command_events_total",
            "Command events observed on the broker",
            &["device_name", "event"],
            registry
        )?;
        let scheduled_task_events = register_int_counter_vec_with_registry!(
            "scheduled_task_events_total",
            "Scheduled task executions observed on the broker",
            &["scheduled_task_id"],
            registry
        )?;
        let sensor_values = register_gauge_vec_with_registry!(
            "sensor_value",
            "Last decoded sensor value",
            &["device_id", "sensor", "index"],
            registry
        )?;
        let ws_connections = register_int_gauge_vec_with_registry!(
            "websocket_connections",
            "Open WebSocket connections",
            &["hub"],
            registry
        )?;

        Ok(Self {
            registry,
            broker_dropped,
            commands,
            scheduled_tasks,
            notifications,
            command_events,
            scheduled_task_events,
            sensor_values,
            ws_connections,
        })
    }

    /// Registry for components that register their own instruments
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every registered metric in the prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
