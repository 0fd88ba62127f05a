//! # Devicehub
//!
//! Backend core for a fleet of IoT devices: an in-process event broker,
//! reconciliation workers that turn pending commands and schedules into
//! actions, and WebSocket hubs that stream device messages to browsers.
//!
//! ## Modules
//!
//! - [`broker`]: Topic based publish/subscribe with bounded queues
//! - [`events`]: Typed events and the topics they travel on
//! - [`worker`]: Consumer loop plus the command, schedule, notification
//!   and metric workers
//! - [`websocket`]: Broadcast and per-device WebSocket hubs
//! - [`api`]: HTTP server with Axum
//! - [`repository`]: Persistence ports and in-memory adapters
//! - [`notification`]: Email and push delivery
//! - [`telemetry`]: Logging setup and the prometheus registry
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use devicehub::broker::BrokerConfig;
//! use devicehub::events::{topics, Event, EventBroker};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let broker = EventBroker::new(BrokerConfig::default());
//! let mut subscription = broker.subscribe(topics::DEVICE_MESSAGES).unwrap();
//!
//! // An uplink published by the ingest route reaches every subscriber
//! while let Some(message) = subscription.recv().await {
//!     if let Event::Uplink(uplink) = message.event {
//!         println!("{} sent {} readings", uplink.device_id, uplink.decoded_payload.len());
//!     }
//! }
//! # }
//! ```

pub mod api;
pub mod broker;
pub mod cache;
pub mod config;
pub mod domain;
pub mod events;
pub mod notification;
pub mod repository;
pub mod telemetry;
pub mod websocket;
pub mod worker;

// Re-export top-level types for convenience
pub use broker::{Broker, BrokerConfig, BrokerError, BrokerMessage, OverflowPolicy, Subscription};

pub use events::{topics, Event, EventBroker, EventMessage};

pub use api::{build_router, serve, ApiError, AppState};

pub use config::{ApiConfig, Config, ConfigError};

pub use worker::{Consumer, ConsumerLoop, LoopOptions, LoopState};

pub use websocket::{DeviceMessage, DeviceMessageHub, DeviceSpecificHub, HubConfig};
