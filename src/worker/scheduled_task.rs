//! Scheduled task reconciliation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::runner::Consumer;
use super::{ReconcileSummary, WorkerError};
use crate::domain::{ScheduledTask, ScheduledTaskExecution, Task};
use crate::events::{topics, Event, EventBroker};
use crate::repository::{
    DeviceRepository, ScheduledTaskRepository, TaskRepository, TenantConfigurationRepository,
};
use crate::telemetry::Metrics;

/// Repositories the scheduled task worker reads and writes
#[derive(Clone)]
pub struct ScheduledTaskRepositories {
    pub scheduled_tasks: Arc<dyn ScheduledTaskRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub devices: Arc<dyn DeviceRepository>,
    pub tenants: Arc<dyn TenantConfigurationRepository>,
}

/// Creates a task every time an active scheduled task comes due
pub struct ScheduledTaskWorker {
    interval: Duration,
    repos: ScheduledTaskRepositories,
    broker: Arc<EventBroker>,
    metrics: Arc<Metrics>,
    reconciling: Mutex<()>,
}

impl ScheduledTaskWorker {
    pub fn new(
        interval: Duration,
        repos: ScheduledTaskRepositories,
        broker: Arc<EventBroker>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            interval,
            repos,
            broker,
            metrics,
            reconciling: Mutex::new(()),
        }
    }

    /// One pass over the active scheduled tasks
    pub async fn reconcile(&self, now: DateTime<Utc>) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        let Ok(_running) = self.reconciling.try_lock() else {
            tracing::debug!("Previous scheduled task reconciliation still running, skipping tick");
            return summary;
        };

        let active = match self.repos.scheduled_tasks.find_all_active().await {
            Ok(active) => active,
            Err(e) => {
                tracing::error!(error = %e, "Finding active scheduled tasks failed");
                return summary;
            }
        };

        for scheduled in active {
            let scheduled_task_id = scheduled.id.clone();
            match self.process(scheduled, now).await {
                Ok(true) => summary.processed += 1,
                Ok(false) => summary.skipped += 1,
                Err(e) => {
                    tracing::error!(
                        scheduled_task_id = %scheduled_task_id,
                        error = %e,
                        "Processing scheduled task failed"
                    );
                    summary.failed += 1;
                }
            }
        }

        if summary.processed + summary.failed > 0 {
            tracing::info!(
                executed = summary.processed,
                failed = summary.failed,
                "Scheduled task reconciliation finished"
            );
        }
        summary
    }

    /// Tenant timezone, UTC when missing or unknown
    async fn timezone(&self, tenant_id: &str) -> Tz {
        match self.repos.tenants.get(tenant_id).await {
            Ok(configuration) => configuration.tz().unwrap_or_else(|| {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    timezone = %configuration.timezone,
                    "Unknown tenant timezone, using UTC"
                );
                chrono_tz::UTC
            }),
            Err(e) => {
                tracing::debug!(tenant_id = %tenant_id, error = %e, "No tenant configuration, using UTC");
                chrono_tz::UTC
            }
        }
    }

    /// Execute `scheduled` when due; `Ok(false)` when it is not
    async fn process(&self, mut scheduled: ScheduledTask, now: DateTime<Utc>) -> Result<bool, WorkerError> {
        let tz = self.timezone(&scheduled.tenant_id).await;
        if !scheduled.is_due(tz, now)? {
            return Ok(false);
        }

        let device = self.repos.devices.get(&scheduled.device_id).await?;
        let task = Task::from_scheduled(&scheduled, &device, now)?;
        self.repos.tasks.create(task.clone()).await?;

        scheduled.last_executed_at = Some(now);
        scheduled.updated_at = now;
        self.repos.scheduled_tasks.update(scheduled.clone()).await?;

        self.metrics
            .scheduled_tasks
            .with_label_values(&[&device.name])
            .inc();

        tracing::info!(
            scheduled_task_id = %scheduled.id,
            task_id = %task.id,
            device_id = %device.id,
            schedule = %scheduled.describe(),
            commands = task.commands.len(),
            "Scheduled task executed"
        );

        self.publish(topics::TASKS, Event::TaskCreated(task.clone()));
        self.publish(
            topics::SCHEDULED_TASK_EVENTS,
            Event::ScheduledTaskExecuted(ScheduledTaskExecution {
                scheduled_task: scheduled,
                task,
            }),
        );
        Ok(true)
    }

    fn publish(&self, topic: &str, event: Event) {
        if let Err(e) = self.broker.publish(topic, event) {
            tracing::debug!(topic = %topic, error = %e, "Event not published");
        }
    }
}

#[async_trait]
impl Consumer for ScheduledTaskWorker {
    type Event = Event;

    fn name(&self) -> &'static str {
        "scheduled_task_worker"
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.interval)
    }

    async fn on_tick(self: Arc<Self>) {
        self.reconcile(Utc::now()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use crate::domain::{CommandPayload, CommandTemplate, Device, Scheduling, TenantConfiguration};
    use crate::repository::{
        MemoryCommandRepository, MemoryDeviceRepository, MemoryScheduledTaskRepository,
        MemoryTaskRepository, MemoryTenantConfigurationRepository,
    };
    use chrono::TimeZone;

    struct Fixture {
        worker: ScheduledTaskWorker,
        scheduled: Arc<MemoryScheduledTaskRepository>,
        tasks: Arc<MemoryTaskRepository>,
        commands: Arc<MemoryCommandRepository>,
        devices: Arc<MemoryDeviceRepository>,
        tenants: Arc<MemoryTenantConfigurationRepository>,
        broker: Arc<EventBroker>,
        metrics: Arc<Metrics>,
    }

    fn fixture() -> Fixture {
        let scheduled = Arc::new(MemoryScheduledTaskRepository::new());
        let commands = Arc::new(MemoryCommandRepository::new());
        let tasks = Arc::new(MemoryTaskRepository::new(Arc::clone(&commands)));
        let devices = Arc::new(MemoryDeviceRepository::new());
        let tenants = Arc::new(MemoryTenantConfigurationRepository::new());
        let broker = Arc::new(EventBroker::new(BrokerConfig::default()));
        let metrics = Arc::new(Metrics::new().unwrap());

        let worker = ScheduledTaskWorker::new(
            Duration::from_secs(60),
            ScheduledTaskRepositories {
                scheduled_tasks: scheduled.clone(),
                tasks: tasks.clone(),
                devices: devices.clone(),
                tenants: tenants.clone(),
            },
            Arc::clone(&broker),
            Arc::clone(&metrics),
        );

        Fixture {
            worker,
            scheduled,
            tasks,
            commands,
            devices,
            tenants,
            broker,
            metrics,
        }
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn hourly(device_id: &str, created_at: DateTime<Utc>) -> ScheduledTask {
        let mut task = ScheduledTask::new(
            "tenant-1",
            device_id,
            Scheduling::Cron {
                schedule: "0 * * * *".to_string(),
            },
        )
        .template(CommandTemplate {
            port: 15,
            priority: "NORMAL".to_string(),
            payload: CommandPayload { index: 0, value: 1 },
            wait_for_secs: 0,
        });
        task.created_at = created_at;
        task
    }

    #[tokio::test]
    async fn test_due_task_creates_task_and_publishes() {
        let f = fixture();
        f.devices.insert(Device::new("dev-1", "pump-1")).await;
        let scheduled = hourly("dev-1", utc(2024, 3, 1, 9, 10));
        f.scheduled.insert(scheduled.clone()).await;

        let mut tasks_topic = f.broker.subscribe(topics::TASKS).unwrap();
        let mut executions = f.broker.subscribe(topics::SCHEDULED_TASK_EVENTS).unwrap();
        let now = utc(2024, 3, 1, 10, 0);

        let summary = f.worker.reconcile(now).await;

        assert_eq!(summary.processed, 1);
        assert_eq!(f.tasks.len().await, 1);
        assert_eq!(f.commands.len().await, 1);
        let stored = f.scheduled.get(&scheduled.id).await.unwrap();
        assert_eq!(stored.last_executed_at, Some(now));

        assert!(matches!(tasks_topic.recv().await.unwrap().event, Event::TaskCreated(_)));
        match executions.recv().await.unwrap().event {
            Event::ScheduledTaskExecuted(execution) => {
                assert_eq!(execution.scheduled_task.id, scheduled.id);
                assert_eq!(execution.task.scheduled_task_id.as_deref(), Some(scheduled.id.as_str()));
            }
            other => panic!("unexpected event {}", other.name()),
        }
        assert_eq!(f.metrics.scheduled_tasks.with_label_values(&["pump-1"]).get(), 1);
    }

    #[tokio::test]
    async fn test_not_due_is_skipped() {
        let f = fixture();
        f.devices.insert(Device::new("dev-1", "pump-1")).await;
        f.scheduled.insert(hourly("dev-1", utc(2024, 3, 1, 9, 10))).await;

        let summary = f.worker.reconcile(utc(2024, 3, 1, 9, 59)).await;

        assert_eq!(summary, ReconcileSummary { processed: 0, skipped: 1, failed: 0 });
        assert_eq!(f.tasks.len().await, 0);
    }

    #[tokio::test]
    async fn test_failing_task_does_not_abort_batch() {
        let f = fixture();
        f.devices.insert(Device::new("dev-1", "pump-1")).await;
        // dev-missing has no device record
        f.scheduled.insert(hourly("dev-missing", utc(2024, 3, 1, 9, 10))).await;
        f.scheduled.insert(hourly("dev-1", utc(2024, 3, 1, 9, 10))).await;
        let mut broken = hourly("dev-1", utc(2024, 3, 1, 9, 10));
        broken.scheduling = Scheduling::Cron {
            schedule: "every now and then".to_string(),
        };
        f.scheduled.insert(broken).await;

        let summary = f.worker.reconcile(utc(2024, 3, 1, 10, 0)).await;

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(f.tasks.len().await, 1);
    }

    #[tokio::test]
    async fn test_tenant_timezone_applies() {
        let f = fixture();
        f.devices.insert(Device::new("dev-1", "pump-1")).await;
        f.tenants
            .insert(TenantConfiguration {
                tenant_id: "tenant-1".to_string(),
                timezone: "America/Santiago".to_string(),
                notification_email: String::new(),
            })
            .await;
        let mut daily = hourly("dev-1", utc(2024, 3, 1, 0, 0));
        daily.scheduling = Scheduling::Cron {
            schedule: "0 8 * * *".to_string(),
        };
        f.scheduled.insert(daily).await;

        // 08:00 UTC is only 05:00 in Santiago
        assert_eq!(f.worker.reconcile(utc(2024, 3, 1, 8, 0)).await.processed, 0);
        assert_eq!(f.worker.reconcile(utc(2024, 3, 1, 11, 0)).await.processed, 1);
    }

    #[tokio::test]
    async fn test_unknown_timezone_falls_back_to_utc() {
        let f = fixture();
        f.devices.insert(Device::new("dev-1", "pump-1")).await;
        f.tenants
            .insert(TenantConfiguration {
                tenant_id: "tenant-1".to_string(),
                timezone: "Mars/Olympus_Mons".to_string(),
                notification_email: String::new(),
            })
            .await;
        let mut daily = hourly("dev-1", utc(2024, 3, 1, 0, 0));
        daily.scheduling = Scheduling::Cron {
            schedule: "0 8 * * *".to_string(),
        };
        f.scheduled.insert(daily).await;

        assert_eq!(f.worker.reconcile(utc(2024, 3, 1, 8, 0)).await.processed, 1);
    }

    #[tokio::test]
    async fn test_unrepresentable_delay_counts_as_failed() {
        let f = fixture();
        f.devices.insert(Device::new("dev-1", "pump-1")).await;
        let broken = hourly("dev-1", utc(2024, 3, 1, 9, 10)).template(CommandTemplate {
            port: 15,
            priority: "NORMAL".to_string(),
            payload: CommandPayload { index: 0, value: 0 },
            wait_for_secs: u64::MAX,
        });
        f.scheduled.insert(broken.clone()).await;
        f.scheduled.insert(hourly("dev-1", utc(2024, 3, 1, 9, 10))).await;

        let summary = f.worker.reconcile(utc(2024, 3, 1, 10, 0)).await;

        assert_eq!(summary, ReconcileSummary { processed: 1, skipped: 0, failed: 1 });
        assert_eq!(f.tasks.len().await, 1);
        assert_eq!(f.commands.len().await, 1);
        // Not marked as run, so it is retried next tick
        let stored = f.scheduled.get(&broken.id).await.unwrap();
        assert_eq!(stored.last_executed_at, None);
    }
}
