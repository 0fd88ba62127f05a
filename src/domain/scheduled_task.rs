//! Scheduled tasks and their next-run evaluation

use chrono::{DateTime, Days, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use super::{Command, CommandPayload, Device};

/// How a scheduled task decides when to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Scheduling {
    /// Standard 5-field cron expression (a 6 or 7 field form with seconds
    /// is accepted as well)
    Cron { schedule: String },
    /// Every `day_interval` days at `execution_time` ("HH:MM", tenant local)
    Interval {
        initial_day: DateTime<Utc>,
        day_interval: u32,
        execution_time: String,
    },
}

/// Template materialised into a command each time the schedule fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub port: u8,
    pub priority: String,
    pub payload: CommandPayload,
    /// Dispatch delay in seconds, counted from the moment the task is created
    #[serde(default)]
    pub wait_for_secs: u64,
}

/// A recurring set of commands for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub tenant_id: String,
    pub device_id: String,
    pub command_templates: Vec<CommandTemplate>,
    pub scheduling: Scheduling,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_executed_at: Option<DateTime<Utc>>,
}

/// A batch of commands created for a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub device_id: String,
    pub scheduled_task_id: Option<String>,
    pub commands: Vec<Command>,
    pub created_at: DateTime<Utc>,
}

/// Payload of a `scheduled_task_executed` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTaskExecution {
    pub scheduled_task: ScheduledTask,
    pub task: Task,
}

/// Errors evaluating a schedule
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("Invalid cron expression {expression:?}: {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Invalid execution time {0:?}, expected HH:MM")]
    InvalidExecutionTime(String),

    #[error("Day interval must be positive")]
    InvalidDayInterval,

    #[error("Schedule has no upcoming run")]
    NoUpcomingRun,

    #[error("Local time {0} does not exist in the tenant timezone")]
    NonexistentLocalTime(String),

    #[error("Command delay of {0} seconds is out of range")]
    DelayOutOfRange(u64),
}

impl ScheduledTask {
    pub fn new(tenant_id: impl Into<String>, device_id: impl Into<String>, scheduling: Scheduling) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            device_id: device_id.into(),
            command_templates: Vec::new(),
            scheduling,
            is_active: true,
            created_at: now,
            updated_at: now,
            last_executed_at: None,
        }
    }

    pub fn template(mut self, template: CommandTemplate) -> Self {
        self.command_templates.push(template);
        self
    }

    /// Next run time evaluated in `tz`
    ///
    /// Cron schedules count from the last execution, or from creation when
    /// the task never ran.
    pub fn next_run(&self, tz: Tz) -> Result<DateTime<Utc>, ScheduleError> {
        match &self.scheduling {
            Scheduling::Cron { schedule } => {
                let reference = self.last_executed_at.unwrap_or(self.created_at);
                next_cron_run(schedule, reference, tz)
            }
            Scheduling::Interval {
                initial_day,
                day_interval,
                execution_time,
            } => next_interval_run(
                *initial_day,
                *day_interval,
                execution_time,
                self.last_executed_at,
                tz,
            ),
        }
    }

    /// Whether the task should fire at `now`
    pub fn is_due(&self, tz: Tz, now: DateTime<Utc>) -> Result<bool, ScheduleError> {
        Ok(self.next_run(tz)? <= now)
    }

    /// Short human readable description of the schedule
    pub fn describe(&self) -> String {
        match &self.scheduling {
            Scheduling::Cron { schedule } => format!("cron: {}", schedule),
            Scheduling::Interval {
                day_interval,
                execution_time,
                ..
            } => format!("interval: every {} days at {}", day_interval, execution_time),
        }
    }
}

impl CommandTemplate {
    /// Build a pending command for `device`, dispatched at `now` plus the template delay
    pub fn to_command(&self, device: &Device, now: DateTime<Utc>) -> Result<Command, ScheduleError> {
        let out_of_range = || ScheduleError::DelayOutOfRange(self.wait_for_secs);
        let delay = i64::try_from(self.wait_for_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .ok_or_else(out_of_range)?;
        let dispatch_after = now.checked_add_signed(delay).ok_or_else(out_of_range)?;

        let mut command = Command::new(device, self.port, self.payload, dispatch_after);
        command.priority = self.priority.clone();
        Ok(command)
    }
}

impl Task {
    /// Materialise the templates of `scheduled` into a new task
    ///
    /// Fails when any template's delay cannot be represented.
    pub fn from_scheduled(scheduled: &ScheduledTask, device: &Device, now: DateTime<Utc>) -> Result<Self, ScheduleError> {
        let id = Uuid::new_v4().to_string();
        let commands = scheduled
            .command_templates
            .iter()
            .map(|template| {
                let mut command = template.to_command(device, now)?;
                command.task_id = Some(id.clone());
                Ok(command)
            })
            .collect::<Result<Vec<_>, ScheduleError>>()?;

        Ok(Self {
            id,
            device_id: device.id.clone(),
            scheduled_task_id: Some(scheduled.id.clone()),
            commands,
            created_at: now,
        })
    }
}

fn next_cron_run(expression: &str, reference: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>, ScheduleError> {
    // The cron crate wants a seconds field
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    };

    let schedule = cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })?;

    schedule
        .after(&reference.with_timezone(&tz))
        .next()
        .map(|next| next.with_timezone(&Utc))
        .ok_or(ScheduleError::NoUpcomingRun)
}

fn next_interval_run(
    initial_day: DateTime<Utc>,
    day_interval: u32,
    execution_time: &str,
    last_executed_at: Option<DateTime<Utc>>,
    tz: Tz,
) -> Result<DateTime<Utc>, ScheduleError> {
    if day_interval == 0 {
        return Err(ScheduleError::InvalidDayInterval);
    }
    let at = parse_execution_time(execution_time)?;
    let interval = Days::new(day_interval as u64);

    match last_executed_at {
        None => {
            let initial_local = initial_day.with_timezone(&tz);
            let mut candidate = local_datetime(tz, initial_local.date_naive().and_time(at))?;
            if candidate < initial_day {
                let date = initial_local.date_naive() + interval;
                candidate = local_datetime(tz, date.and_time(at))?;
            }
            Ok(candidate)
        }
        Some(last) => {
            let date = last.with_timezone(&tz).date_naive() + interval;
            local_datetime(tz, date.and_time(at))
        }
    }
}

fn parse_execution_time(value: &str) -> Result<NaiveTime, ScheduleError> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .map_err(|_| ScheduleError::InvalidExecutionTime(value.to_string()))
}

fn local_datetime(tz: Tz, naive: chrono::NaiveDateTime) -> Result<DateTime<Utc>, ScheduleError> {
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| ScheduleError::NonexistentLocalTime(naive.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn cron_task(expr: &str, created_at: DateTime<Utc>) -> ScheduledTask {
        let mut task = ScheduledTask::new(
            "tenant-1",
            "dev-1",
            Scheduling::Cron {
                schedule: expr.to_string(),
            },
        );
        task.created_at = created_at;
        task
    }

    #[test]
    fn test_cron_next_run_from_creation() {
        let task = cron_task("*/15 * * * *", utc(2024, 3, 1, 10, 2));
        let next = task.next_run(chrono_tz::UTC).unwrap();
        assert_eq!(next, utc(2024, 3, 1, 10, 15));
    }

    #[test]
    fn test_cron_evaluated_in_tenant_timezone() {
        // 08:00 in Santiago (UTC-3 in March) is 11:00 UTC
        let task = cron_task("0 8 * * *", utc(2024, 3, 1, 0, 0));
        let next = task.next_run(chrono_tz::America::Santiago).unwrap();
        assert_eq!(next, utc(2024, 3, 1, 11, 0));
    }

    #[test]
    fn test_cron_uses_last_execution() {
        let mut task = cron_task("0 * * * *", utc(2024, 3, 1, 0, 0));
        task.last_executed_at = Some(utc(2024, 3, 1, 5, 0));
        let next = task.next_run(chrono_tz::UTC).unwrap();
        assert_eq!(next, utc(2024, 3, 1, 6, 0));
        assert!(task.is_due(chrono_tz::UTC, utc(2024, 3, 1, 6, 0)).unwrap());
        assert!(!task.is_due(chrono_tz::UTC, utc(2024, 3, 1, 5, 59)).unwrap());
    }

    #[test]
    fn test_invalid_cron() {
        let task = cron_task("not a cron", Utc::now());
        assert!(matches!(
            task.next_run(chrono_tz::UTC),
            Err(ScheduleError::InvalidCron { .. })
        ));
    }

    fn interval_task(initial_day: DateTime<Utc>, days: u32, at: &str) -> ScheduledTask {
        ScheduledTask::new(
            "tenant-1",
            "dev-1",
            Scheduling::Interval {
                initial_day,
                day_interval: days,
                execution_time: at.to_string(),
            },
        )
    }

    #[test]
    fn test_interval_first_run_same_day() {
        let task = interval_task(utc(2024, 3, 1, 6, 0), 2, "09:30");
        assert_eq!(task.next_run(chrono_tz::UTC).unwrap(), utc(2024, 3, 1, 9, 30));
    }

    #[test]
    fn test_interval_first_run_pushed_when_time_passed() {
        let task = interval_task(utc(2024, 3, 1, 12, 0), 3, "09:30");
        assert_eq!(task.next_run(chrono_tz::UTC).unwrap(), utc(2024, 3, 4, 9, 30));
    }

    #[test]
    fn test_interval_after_execution() {
        let mut task = interval_task(utc(2024, 3, 1, 6, 0), 2, "09:30");
        task.last_executed_at = Some(utc(2024, 3, 5, 9, 31));
        assert_eq!(task.next_run(chrono_tz::UTC).unwrap(), utc(2024, 3, 7, 9, 30));
    }

    #[test]
    fn test_interval_rejects_bad_time() {
        let task = interval_task(utc(2024, 3, 1, 6, 0), 1, "25:99");
        assert_eq!(
            task.next_run(chrono_tz::UTC),
            Err(ScheduleError::InvalidExecutionTime("25:99".to_string()))
        );
    }

    #[test]
    fn test_task_from_scheduled_links_commands() {
        let device = Device::new("dev-1", "pump-1");
        let scheduled = interval_task(utc(2024, 3, 1, 6, 0), 1, "08:00")
            .template(CommandTemplate {
                port: 15,
                priority: "HIGH".to_string(),
                payload: CommandPayload { index: 1, value: 100 },
                wait_for_secs: 0,
            })
            .template(CommandTemplate {
                port: 15,
                priority: "HIGH".to_string(),
                payload: CommandPayload { index: 1, value: 0 },
                wait_for_secs: 600,
            });
        let now = utc(2024, 3, 1, 8, 0);

        let task = Task::from_scheduled(&scheduled, &device, now).unwrap();

        assert_eq!(task.commands.len(), 2);
        assert_eq!(task.scheduled_task_id.as_deref(), Some(scheduled.id.as_str()));
        assert!(task.commands.iter().all(|c| c.task_id.as_deref() == Some(task.id.as_str())));
        assert_eq!(task.commands[1].dispatch_after, utc(2024, 3, 1, 8, 10));
        assert_eq!(task.commands[0].priority, "HIGH");
    }

    #[test]
    fn test_unrepresentable_delay_is_rejected() {
        let device = Device::new("dev-1", "pump-1");
        let template = CommandTemplate {
            port: 15,
            priority: "LOW".to_string(),
            payload: CommandPayload { index: 1, value: 1 },
            wait_for_secs: u64::MAX,
        };
        let now = utc(2024, 3, 1, 8, 0);

        assert_eq!(
            template.to_command(&device, now).unwrap_err(),
            ScheduleError::DelayOutOfRange(u64::MAX)
        );

        let scheduled = interval_task(utc(2024, 3, 1, 6, 0), 1, "08:00").template(template);
        assert_eq!(
            Task::from_scheduled(&scheduled, &device, now).unwrap_err(),
            ScheduleError::DelayOutOfRange(u64::MAX)
        );
    }

    #[test]
    fn test_delay_past_the_calendar_is_rejected() {
        let device = Device::new("dev-1", "pump-1");
        let now = utc(2024, 3, 1, 8, 0);
        let template = |wait_for_secs| CommandTemplate {
            port: 15,
            priority: "LOW".to_string(),
            payload: CommandPayload { index: 1, value: 1 },
            wait_for_secs,
        };

        // Roughly 35 thousand years still fits
        let command = template(1 << 40).to_command(&device, now).unwrap();
        assert!(command.dispatch_after > now);

        // Roughly 35 million years is a valid duration but not a valid date
        assert_eq!(
            template(1 << 50).to_command(&device, now).unwrap_err(),
            ScheduleError::DelayOutOfRange(1 << 50)
        );
    }
}
