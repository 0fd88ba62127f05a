//! Device commands and their delivery lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Device;

/// Delivery state of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// Created, waiting for its dispatch time
    Pending,
    /// Accepted by the network server queue
    Queued,
    /// Transmitted to the device
    Sent,
    /// Acknowledged by the device
    Ack,
    /// Delivery failed
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Queued => "queued",
            CommandStatus::Sent => "sent",
            CommandStatus::Ack => "ack",
            CommandStatus::Failed => "failed",
        }
    }
}

/// Downlink payload: a value written at a register index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub index: u8,
    pub value: u8,
}

/// A command addressed to one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub version: u64,
    pub device_id: String,
    pub device_name: String,
    pub task_id: Option<String>,
    pub port: u8,
    pub priority: String,
    pub payload: CommandPayload,
    pub dispatch_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub ready: bool,
    pub sent: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub status: CommandStatus,
    pub error_message: Option<String>,
    pub queued_at: Option<DateTime<Utc>>,
    pub acked_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Command {
    /// Create a pending command for `device`
    pub fn new(device: &Device, port: u8, payload: CommandPayload, dispatch_after: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            version: 1,
            device_id: device.id.clone(),
            device_name: device.name.clone(),
            task_id: None,
            port,
            priority: "NORMAL".to_string(),
            payload,
            dispatch_after,
            created_at: Utc::now(),
            ready: false,
            sent: false,
            sent_at: None,
            status: CommandStatus::Pending,
            error_message: None,
            queued_at: None,
            acked_at: None,
            failed_at: None,
        }
    }

    /// Whether the dispatch time has been reached
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.dispatch_after <= now
    }

    /// Final state reached (ack or failed)
    pub fn is_completed(&self) -> bool {
        matches!(self.status, CommandStatus::Ack | CommandStatus::Failed)
    }

    /// Move to `status`, stamping the matching timestamp and bumping the version
    pub fn update_status(&mut self, status: CommandStatus, error_message: Option<String>, at: DateTime<Utc>) {
        self.status = status;
        match status {
            CommandStatus::Pending => {}
            CommandStatus::Queued => self.queued_at = Some(at),
            CommandStatus::Sent => {
                self.sent = true;
                self.sent_at = Some(at);
            }
            CommandStatus::Ack => self.acked_at = Some(at),
            CommandStatus::Failed => {
                self.failed_at = Some(at);
                self.error_message = error_message;
            }
        }
        self.version += 1;
    }
}

/// Status report for a command coming back from the network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandStatusUpdate {
    pub command_id: String,
    pub device_name: String,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}
