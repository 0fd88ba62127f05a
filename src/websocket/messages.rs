//! Outbound WebSocket messages
//!
//! Clients never send application messages; anything they send is
//! discarded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{CommandPayload, DeviceState, SensorData};
use crate::events::Event;

/// Value of the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Sensor readings, either cached or from a fresh uplink
    DeviceState,
    /// A command left for the device
    CommandSent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageData {
    Sensors(SensorData),
    Command(CommandPayload),
}

/// A message pushed to dashboard clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: MessageData,
}

impl DeviceMessage {
    /// Cached state sent when a client registers
    pub fn from_state(state: &DeviceState) -> Self {
        Self {
            kind: MessageType::DeviceState,
            device_id: state.device_id.clone(),
            timestamp: state.timestamp,
            data: MessageData::Sensors(state.data.clone()),
        }
    }

    /// Outbound form of a broker event, `None` for events clients don't see
    pub fn from_event(event: &Event) -> Option<Self> {
        match event {
            Event::Uplink(uplink) => Some(Self {
                kind: MessageType::DeviceState,
                device_id: uplink.device_id.clone(),
                timestamp: uplink.received_at,
                data: MessageData::Sensors(uplink.decoded_payload.clone()),
            }),
            Event::CommandSent(command) => Some(Self {
                kind: MessageType::CommandSent,
                device_id: command.device_id.clone(),
                timestamp: command.created_at,
                data: MessageData::Command(command.payload),
            }),
            _ => None,
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
