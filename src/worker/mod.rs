//! Background Workers
//!
//! Every worker is a [`Consumer`] driven by the shared [`ConsumerLoop`]:
//!
//! - [`CommandWorker`]: dispatches due commands, applies status updates
//! - [`ScheduledTaskWorker`]: turns due scheduled tasks into tasks
//! - [`NotificationWorker`]: emails tenants about new scheduled work
//! - [`MetricPublisherWorker`]: built-in metrics from broker traffic
//! - [`MetricWorker`]: metrics declared in configuration
//!
//! Reconciliation workers re-read their repository on every tick, so a
//! failed item is simply retried on the next tick.

mod command;
mod metric;
mod metric_publisher;
mod notification;
mod runner;
mod scheduled_task;

pub use command::{BrokerCommandPublisher, CommandPublisher, CommandWorker, DispatchError};
pub use metric::{MetricError, MetricKind, MetricWorker, MetricWorkerConfig, MetricWorkerFactory};
pub use metric_publisher::MetricPublisherWorker;
pub use notification::NotificationWorker;
pub use runner::{Consumer, ConsumerLoop, LoopOptions, LoopState};
pub use scheduled_task::{ScheduledTaskRepositories, ScheduledTaskWorker};

use thiserror::Error;

use crate::domain::ScheduleError;
use crate::notification::NotificationError;
use crate::repository::RepositoryError;

/// Errors raised while a worker processes one item
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Notification error: {0}")]
    Notification(#[from] NotificationError),
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Items acted upon
    pub processed: usize,
    /// Items not due yet
    pub skipped: usize,
    /// Items whose processing failed
    pub failed: usize,
}
