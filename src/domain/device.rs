//! Devices, tenant settings and live device state

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A registered end device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub tenant_id: Option<String>,
}

impl Device {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            display_name: name.clone(),
            name,
            tenant_id: None,
        }
    }

    pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

/// Per-tenant settings read by the workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantConfiguration {
    pub tenant_id: String,
    /// IANA timezone name, e.g. "America/Santiago"
    pub timezone: String,
    /// Empty when the tenant does not want email notifications
    #[serde(default)]
    pub notification_email: String,
}

impl TenantConfiguration {
    /// Parsed timezone, `None` for an unknown name
    pub fn tz(&self) -> Option<Tz> {
        self.timezone.parse().ok()
    }
}

/// One decoded reading inside an uplink
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub index: u32,
    pub value: f64,
}

/// Readings keyed by sensor name ("temperature", "humidity", ...)
pub type SensorData = HashMap<String, Vec<SensorReading>>;

/// A decoded uplink from a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Uplink {
    pub device_id: String,
    #[serde(default)]
    pub dev_eui: String,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub port: u8,
    #[serde(default)]
    pub decoded_payload: SensorData,
    #[serde(default)]
    pub correlation_ids: Vec<String>,
}

/// Last known readings of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: SensorData,
}
