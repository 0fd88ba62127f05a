//! Task notifications for tenants

use async_trait::async_trait;
use std::fmt::Write;
use std::sync::Arc;

use super::runner::Consumer;
use super::WorkerError;
use crate::broker::BrokerMessage;
use crate::domain::{Device, ScheduledTaskExecution, Task};
use crate::events::{topics, Event};
use crate::notification::{EmailRequest, NotificationClient};
use crate::repository::{DeviceRepository, TaskRepository, TenantConfigurationRepository};
use crate::telemetry::Metrics;

const RECENT_TASKS_LIMIT: usize = 10;

/// Emails the tenant whenever a scheduled task produced new tasks
pub struct NotificationWorker {
    tasks: Arc<dyn TaskRepository>,
    devices: Arc<dyn DeviceRepository>,
    tenants: Arc<dyn TenantConfigurationRepository>,
    client: Arc<dyn NotificationClient>,
    metrics: Arc<Metrics>,
}

/// What happened to one task's notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Sent,
    SkippedNoTenant,
    SkippedNoEmail,
}

impl NotificationWorker {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        devices: Arc<dyn DeviceRepository>,
        tenants: Arc<dyn TenantConfigurationRepository>,
        client: Arc<dyn NotificationClient>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            tasks,
            devices,
            tenants,
            client,
            metrics,
        }
    }

    /// Notify about the recent tasks of an executed scheduled task
    pub async fn handle_execution(&self, execution: &ScheduledTaskExecution) {
        let scheduled_task_id = &execution.scheduled_task.id;

        let tasks = match self
            .tasks
            .find_by_scheduled_task(scheduled_task_id, RECENT_TASKS_LIMIT)
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!(scheduled_task_id = %scheduled_task_id, error = %e, "Finding tasks failed");
                return;
            }
        };

        if tasks.is_empty() {
            tracing::debug!(scheduled_task_id = %scheduled_task_id, "No tasks for scheduled task");
            return;
        }

        for task in &tasks {
            match self.notify(task, scheduled_task_id).await {
                Ok(Delivery::Sent) => {
                    self.metrics.notifications.with_label_values(&["success"]).inc();
                }
                Ok(skipped) => {
                    tracing::warn!(task_id = %task.id, reason = ?skipped, "Notification skipped");
                }
                Err(e) => {
                    self.metrics.notifications.with_label_values(&["error"]).inc();
                    tracing::error!(task_id = %task.id, error = %e, "Sending task notification failed");
                }
            }
        }
    }

    pub(crate) async fn notify(&self, task: &Task, scheduled_task_id: &str) -> Result<Delivery, WorkerError> {
        let device = self.devices.get(&task.device_id).await?;
        let Some(tenant_id) = device.tenant_id.as_deref() else {
            return Ok(Delivery::SkippedNoTenant);
        };

        let configuration = self.tenants.get(tenant_id).await?;
        if configuration.notification_email.is_empty() {
            return Ok(Delivery::SkippedNoEmail);
        }

        self.client
            .send_email(EmailRequest {
                to: configuration.notification_email.clone(),
                subject: format!("New Task Created for Device: {}", device.display_name),
                body: notification_body(&device, task, scheduled_task_id),
            })
            .await?;

        tracing::info!(
            device_id = %device.id,
            task_id = %task.id,
            scheduled_task_id = %scheduled_task_id,
            tenant_id = %tenant_id,
            "Task notification sent"
        );
        Ok(Delivery::Sent)
    }
}

fn notification_body(device: &Device, task: &Task, scheduled_task_id: &str) -> String {
    let mut body = String::new();
    // Writing into a String cannot fail
    let _ = writeln!(body, "A new task has been created for device: {}\n", device.display_name);
    let _ = writeln!(body, "Device Details:");
    let _ = writeln!(body, "- Device ID: {}", device.id);
    let _ = writeln!(body, "- Device Name: {}", device.name);
    let _ = writeln!(body, "- Display Name: {}", device.display_name);
    if let Some(tenant_id) = &device.tenant_id {
        let _ = writeln!(body, "- Tenant ID: {}", tenant_id);
    }
    let _ = writeln!(body, "\nTask Details:");
    let _ = writeln!(body, "- Task ID: {}", task.id);
    let _ = writeln!(body, "- Created At: {}", task.created_at.to_rfc3339());
    let _ = writeln!(body, "- Scheduled Task ID: {}", scheduled_task_id);
    let _ = writeln!(body, "- Number of Commands: {}", task.commands.len());
    body
}

#[async_trait]
impl Consumer for NotificationWorker {
    type Event = Event;

    fn name(&self) -> &'static str {
        "notification_worker"
    }

    fn topics(&self) -> Vec<&'static str> {
        vec![topics::SCHEDULED_TASK_EVENTS]
    }

    async fn on_message(self: Arc<Self>, _topic: &'static str, message: BrokerMessage<Event>) {
        match &message.event {
            Event::ScheduledTaskExecuted(execution) => self.handle_execution(execution).await,
            other => tracing::debug!(event = other.name(), "Notification worker ignoring event"),
        }
    }
}
