//! HTTP notification provider with linear backoff

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::{EmailRequest, NotificationClient, NotificationError, PushNotificationRequest};

/// Notification provider settings
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    /// POST endpoint for emails; log-only delivery when unset
    #[serde(default)]
    pub email_endpoint: Option<String>,

    /// POST endpoint for push notifications; log-only delivery when unset
    #[serde(default)]
    pub push_endpoint: Option<String>,

    /// Bearer token sent to both endpoints
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_from_address")]
    pub from_address: String,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff unit; attempt `n` waits `n * backoff_ms`
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_from_address() -> String {
    "notifications@devicehub.local".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            email_endpoint: None,
            push_endpoint: None,
            api_key: None,
            from_address: default_from_address(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Sends notifications as JSON POSTs to a provider
pub struct HttpNotificationClient {
    client: Client,
    config: NotificationConfig,
}

#[derive(Serialize)]
struct EmailBody<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
}

#[derive(Serialize)]
struct PushBody<'a> {
    message: PushMessage<'a>,
}

#[derive(Serialize)]
struct PushMessage<'a> {
    token: &'a str,
    notification: PushContent<'a>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    data: HashMap<&'static str, &'a str>,
}

#[derive(Serialize)]
struct PushContent<'a> {
    title: &'a str,
    body: &'a str,
}

impl HttpNotificationClient {
    pub fn new(config: NotificationConfig) -> Result<Self, NotificationError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &NotificationConfig {
        &self.config
    }

    /// POST with up to `max_attempts` tries
    ///
    /// Client errors other than 429 are returned at once.
    async fn post_with_retry<T: Serialize + Sync>(&self, url: &str, body: &T) -> Result<(), NotificationError> {
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.post_once(url, body).await {
                Ok(()) => return Ok(()),
                Err(NotificationError::Api { status, message })
                    if (400..500).contains(&status) && status != 429 =>
                {
                    return Err(NotificationError::Api { status, message });
                }
                Err(e) => {
                    tracing::warn!(url = %url, attempt, error = %e, "Notification attempt failed");
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                let delay = Duration::from_millis(self.config.backoff_ms * attempt as u64);
                tokio::time::sleep(delay).await;
            }
        }

        Err(NotificationError::Exhausted {
            attempts,
            last: Box::new(last_error.unwrap_or(NotificationError::NotConfigured("notification"))),
        })
    }

    async fn post_once<T: Serialize + Sync>(&self, url: &str, body: &T) -> Result<(), NotificationError> {
        let mut request = self.client.post(url).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = response.text().await.unwrap_or_default();
        Err(NotificationError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl NotificationClient for HttpNotificationClient {
    async fn send_email(&self, request: EmailRequest) -> Result<(), NotificationError> {
        let url = self
            .config
            .email_endpoint
            .as_deref()
            .ok_or(NotificationError::NotConfigured("email"))?;

        let body = EmailBody {
            from: &self.config.from_address,
            to: &request.to,
            subject: &request.subject,
            text: &request.body,
        };
        self.post_with_retry(url, &body).await?;

        tracing::debug!(to = %request.to, "Email sent");
        Ok(())
    }

    async fn send_push_notification(&self, request: PushNotificationRequest) -> Result<(), NotificationError> {
        let url = self
            .config
            .push_endpoint
            .as_deref()
            .ok_or(NotificationError::NotConfigured("push"))?;

        let mut data = HashMap::new();
        if let Some(link) = request.deep_link.as_deref() {
            data.insert("deeplink", link);
        }
        let body = PushBody {
            message: PushMessage {
                token: &request.token,
                notification: PushContent {
                    title: &request.title,
                    body: &request.body,
                },
                data,
            },
        };
        self.post_with_retry(url, &body).await
    }
}
