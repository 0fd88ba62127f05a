//! Command reconciliation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use super::runner::Consumer;
use super::{ReconcileSummary, WorkerError};
use crate::broker::{BrokerError, BrokerMessage};
use crate::domain::{Command, CommandStatusUpdate};
use crate::events::{topics, Event, EventBroker};
use crate::repository::CommandRepository;
use crate::telemetry::Metrics;

/// Errors handing a command to the network
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Command rejected: {0}")]
    Rejected(String),
}

/// Sends commands towards devices
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    async fn dispatch(&self, command: &Command) -> Result<(), DispatchError>;
}

/// Publishes `command_sent` on `device_messages` for the network bridge to pick up
pub struct BrokerCommandPublisher {
    broker: Arc<EventBroker>,
}

impl BrokerCommandPublisher {
    pub fn new(broker: Arc<EventBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl CommandPublisher for BrokerCommandPublisher {
    async fn dispatch(&self, command: &Command) -> Result<(), DispatchError> {
        self.broker
            .publish(topics::DEVICE_MESSAGES, Event::CommandSent(command.clone()))?;
        Ok(())
    }
}

/// Dispatches pending commands once their dispatch time is reached and
/// applies status reports coming back from the network
pub struct CommandWorker {
    interval: Duration,
    commands: Arc<dyn CommandRepository>,
    publisher: Arc<dyn CommandPublisher>,
    broker: Arc<EventBroker>,
    metrics: Arc<Metrics>,
    reconciling: Mutex<()>,
}

impl CommandWorker {
    pub fn new(
        interval: Duration,
        commands: Arc<dyn CommandRepository>,
        publisher: Arc<dyn CommandPublisher>,
        broker: Arc<EventBroker>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            interval,
            commands,
            publisher,
            broker,
            metrics,
            reconciling: Mutex::new(()),
        }
    }

    /// One pass over the pending commands
    pub async fn reconcile(&self, now: DateTime<Utc>) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        let Ok(_running) = self.reconciling.try_lock() else {
            tracing::debug!("Previous command reconciliation still running, skipping tick");
            return summary;
        };

        let pending = match self.commands.find_all_pending().await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!(error = %e, "Finding pending commands failed");
                return summary;
            }
        };

        for command in pending {
            if !command.is_due(now) {
                tracing::debug!(
                    command_id = %command.id,
                    dispatch_after = %command.dispatch_after,
                    "Command not due yet"
                );
                summary.skipped += 1;
                continue;
            }

            let command_id = command.id.clone();
            match self.dispatch(command).await {
                Ok(()) => summary.processed += 1,
                Err(e) => {
                    tracing::error!(command_id = %command_id, error = %e, "Dispatching command failed");
                    summary.failed += 1;
                }
            }
        }

        if summary.processed + summary.failed > 0 {
            tracing::info!(
                dispatched = summary.processed,
                failed = summary.failed,
                skipped = summary.skipped,
                "Command reconciliation finished"
            );
        }
        summary
    }

    async fn dispatch(&self, mut command: Command) -> Result<(), WorkerError> {
        command.ready = true;
        self.publisher.dispatch(&command).await?;
        self.commands.update(command.clone()).await?;

        self.metrics
            .commands
            .with_label_values(&[&command.device_name])
            .inc();

        let device_name = command.device_name.clone();
        let command_id = command.id.clone();
        if let Err(e) = self
            .broker
            .publish(topics::COMMAND_EVENTS, Event::CommandProcessed(command))
        {
            tracing::debug!(command_id = %command_id, error = %e, "No listener for command events");
        }

        tracing::debug!(command_id = %command_id, device_name = %device_name, "Command dispatched");
        Ok(())
    }

    /// Apply a status report to the stored command
    pub async fn apply_status_update(&self, update: CommandStatusUpdate) -> Result<Command, WorkerError> {
        let mut command = self.commands.get(&update.command_id).await?;
        command.update_status(update.status, update.error_message, update.timestamp);
        self.commands.update(command.clone()).await?;

        tracing::info!(
            command_id = %command.id,
            device_name = %update.device_name,
            status = command.status.as_str(),
            version = command.version,
            "Command status updated"
        );
        Ok(command)
    }
}

#[async_trait]
impl Consumer for CommandWorker {
    type Event = Event;

    fn name(&self) -> &'static str {
        "command_worker"
    }

    fn topics(&self) -> Vec<&'static str> {
        vec![topics::DEVICE_MESSAGES]
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.interval)
    }

    async fn on_tick(self: Arc<Self>) {
        self.reconcile(Utc::now()).await;
    }

    async fn on_message(self: Arc<Self>, _topic: &'static str, message: BrokerMessage<Event>) {
        match message.event {
            Event::CommandStatusUpdate(update) => {
                let command_id = update.command_id.clone();
                if let Err(e) = self.apply_status_update(update).await {
                    tracing::error!(command_id = %command_id, error = %e, "Applying command status failed");
                }
            }
            other => {
                tracing::trace!(event = other.name(), "Command worker ignoring event");
            }
        }
    }
}
