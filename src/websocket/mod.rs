//! WebSocket Device Streams
//!
//! Pushes device traffic to dashboard clients.
//!
//! - `GET /ws/device-messages`: every device, cached states first
//! - `GET /ws/devices/:device_id/messages`: a single device
//!
//! Each connection gets a bounded outbound queue drained by its own writer
//! task. A client too slow to keep its queue from filling is dropped.
//!
//! ```javascript
//! const ws = new WebSocket('ws://localhost:8080/ws/devices/dev-1/messages');
//! ws.onmessage = (event) => {
//!   const msg = JSON.parse(event.data); // {type, device_id, timestamp, data}
//! };
//! ```

mod client;
mod connection;
mod handler;
mod hub;
mod messages;

pub use client::{ClientHandle, HubConfig, HubError};
pub use handler::{device_messages_handler, device_specific_handler};
pub use hub::{DeviceMessageHub, DeviceSpecificHub};
pub use messages::{DeviceMessage, MessageData, MessageType};
