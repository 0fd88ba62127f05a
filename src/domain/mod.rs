//! Domain records exchanged between repositories, workers and hubs

mod command;
mod device;
mod scheduled_task;

pub use command::{Command, CommandPayload, CommandStatus, CommandStatusUpdate};
pub use device::{Device, DeviceState, SensorData, SensorReading, TenantConfiguration, Uplink};
pub use scheduled_task::{
    CommandTemplate, ScheduleError, ScheduledTask, ScheduledTaskExecution, Scheduling, Task,
};
