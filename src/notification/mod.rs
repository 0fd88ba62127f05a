//! Notification Clients
//!
//! Email and push delivery behind one trait. Providers retry internally;
//! callers get a single success or failure.

mod http;

pub use http::{HttpNotificationClient, NotificationConfig};

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// An email to send
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmailRequest {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// A push notification to a device token
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushNotificationRequest {
    pub token: String,
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deep_link: Option<String>,
}

/// Errors from notification providers
#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Provider error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Giving up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<NotificationError>,
    },

    #[error("No {0} provider configured")]
    NotConfigured(&'static str),
}

#[async_trait]
pub trait NotificationClient: Send + Sync {
    async fn send_email(&self, request: EmailRequest) -> Result<(), NotificationError>;
    async fn send_push_notification(&self, request: PushNotificationRequest) -> Result<(), NotificationError>;
}

/// Routes email and push to different providers
pub struct CompositeNotificationClient {
    email: Arc<dyn NotificationClient>,
    push: Arc<dyn NotificationClient>,
}

impl CompositeNotificationClient {
    pub fn new(email: Arc<dyn NotificationClient>, push: Arc<dyn NotificationClient>) -> Self {
        Self { email, push }
    }
}

#[async_trait]
impl NotificationClient for CompositeNotificationClient {
    async fn send_email(&self, request: EmailRequest) -> Result<(), NotificationError> {
        self.email.send_email(request).await
    }

    async fn send_push_notification(&self, request: PushNotificationRequest) -> Result<(), NotificationError> {
        self.push.send_push_notification(request).await
    }
}

/// Writes notifications to the log instead of delivering them
///
/// Used when no provider endpoint is configured.
#[derive(Debug, Default)]
pub struct LogNotificationClient;

#[async_trait]
impl NotificationClient for LogNotificationClient {
    async fn send_email(&self, request: EmailRequest) -> Result<(), NotificationError> {
        tracing::info!(to = %request.to, subject = %request.subject, "Email (log only)");
        Ok(())
    }

    async fn send_push_notification(&self, request: PushNotificationRequest) -> Result<(), NotificationError> {
        tracing::info!(title = %request.title, "Push notification (log only)");
        Ok(())
    }
}
