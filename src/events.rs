//! Event vocabulary carried by the broker
//!
//! | topic                   | events                                            |
//! |-------------------------|---------------------------------------------------|
//! | `device_messages`       | `uplink`, `command_sent`, `command_status_update` |
//! | `command_events`        | `command_processed`                               |
//! | `scheduled_task_events` | `scheduled_task_executed`                         |
//! | `tasks`                 | `task_created`                                    |

use serde::{Deserialize, Serialize};

use crate::broker::{Broker, BrokerMessage};
use crate::domain::{Command, CommandStatusUpdate, ScheduledTaskExecution, Task, Uplink};

/// Well-known topic names
pub mod topics {
    pub const DEVICE_MESSAGES: &str = "device_messages";
    pub const COMMAND_EVENTS: &str = "command_events";
    pub const SCHEDULED_TASK_EVENTS: &str = "scheduled_task_events";
    pub const TASKS: &str = "tasks";

    pub const ALL: [&str; 4] = [DEVICE_MESSAGES, COMMAND_EVENTS, SCHEDULED_TASK_EVENTS, TASKS];

    /// The static name of a known topic
    pub fn resolve(name: &str) -> Option<&'static str> {
        ALL.iter().copied().find(|topic| *topic == name)
    }
}

/// Every event the service publishes, each with its own payload type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "value", rename_all = "snake_case")]
pub enum Event {
    Uplink(Uplink),
    CommandSent(Command),
    CommandStatusUpdate(CommandStatusUpdate),
    CommandProcessed(Command),
    ScheduledTaskExecuted(ScheduledTaskExecution),
    TaskCreated(Task),
}

impl Event {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            Event::Uplink(_) => "uplink",
            Event::CommandSent(_) => "command_sent",
            Event::CommandStatusUpdate(_) => "command_status_update",
            Event::CommandProcessed(_) => "command_processed",
            Event::ScheduledTaskExecuted(_) => "scheduled_task_executed",
            Event::TaskCreated(_) => "task_created",
        }
    }

    /// Device the event is about, when there is one
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Event::Uplink(uplink) => Some(&uplink.device_id),
            Event::CommandSent(cmd) | Event::CommandProcessed(cmd) => Some(&cmd.device_id),
            Event::ScheduledTaskExecuted(execution) => Some(&execution.task.device_id),
            Event::TaskCreated(task) => Some(&task.device_id),
            Event::CommandStatusUpdate(_) => None,
        }
    }
}

/// The broker instantiated with the service's events
pub type EventBroker = Broker<Event>;

/// A message on the event broker
pub type EventMessage = BrokerMessage<Event>;
