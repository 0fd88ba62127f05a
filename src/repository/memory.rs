//! In-memory repositories

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{
    CommandRepository, DeviceRepository, RepositoryError, RepositoryResult,
    ScheduledTaskRepository, TaskRepository, TenantConfigurationRepository,
};
use crate::domain::{Command, CommandStatus, Device, ScheduledTask, Task, TenantConfiguration};

#[derive(Default)]
pub struct MemoryCommandRepository {
    commands: RwLock<HashMap<String, Command>>,
}

impl MemoryCommandRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, command: Command) {
        self.commands.write().await.insert(command.id.clone(), command);
    }

    pub async fn len(&self) -> usize {
        self.commands.read().await.len()
    }
}

#[async_trait]
impl CommandRepository for MemoryCommandRepository {
    async fn find_all_pending(&self) -> RepositoryResult<Vec<Command>> {
        let mut pending: Vec<Command> = self
            .commands
            .read()
            .await
            .values()
            .filter(|c| c.status == CommandStatus::Pending && !c.ready)
            .cloned()
            .collect();
        pending.sort_by_key(|c| c.dispatch_after);
        Ok(pending)
    }

    async fn get(&self, id: &str) -> RepositoryResult<Command> {
        self.commands
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found("command", id))
    }

    async fn update(&self, command: Command) -> RepositoryResult<()> {
        let mut commands = self.commands.write().await;
        match commands.get_mut(&command.id) {
            Some(existing) => {
                *existing = command;
                Ok(())
            }
            None => Err(RepositoryError::not_found("command", command.id)),
        }
    }
}

#[derive(Default)]
pub struct MemoryScheduledTaskRepository {
    scheduled_tasks: RwLock<HashMap<String, ScheduledTask>>,
}

impl MemoryScheduledTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, scheduled_task: ScheduledTask) {
        self.scheduled_tasks
            .write()
            .await
            .insert(scheduled_task.id.clone(), scheduled_task);
    }
}

#[async_trait]
impl ScheduledTaskRepository for MemoryScheduledTaskRepository {
    async fn find_all_active(&self) -> RepositoryResult<Vec<ScheduledTask>> {
        Ok(self
            .scheduled_tasks
            .read()
            .await
            .values()
            .filter(|t| t.is_active)
            .cloned()
            .collect())
    }

    async fn get(&self, id: &str) -> RepositoryResult<ScheduledTask> {
        self.scheduled_tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found("scheduled task", id))
    }

    async fn update(&self, scheduled_task: ScheduledTask) -> RepositoryResult<()> {
        let mut scheduled_tasks = self.scheduled_tasks.write().await;
        match scheduled_tasks.get_mut(&scheduled_task.id) {
            Some(existing) => {
                *existing = scheduled_task;
                Ok(())
            }
            None => Err(RepositoryError::not_found("scheduled task", scheduled_task.id)),
        }
    }
}

/// Tasks, persisting their commands into the command repository
pub struct MemoryTaskRepository {
    tasks: RwLock<Vec<Task>>,
    commands: Arc<MemoryCommandRepository>,
}

impl MemoryTaskRepository {
    pub fn new(commands: Arc<MemoryCommandRepository>) -> Self {
        Self {
            tasks: RwLock::new(Vec::new()),
            commands,
        }
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn create(&self, task: Task) -> RepositoryResult<()> {
        for command in &task.commands {
            self.commands.insert(command.clone()).await;
        }
        self.tasks.write().await.push(task);
        Ok(())
    }

    async fn find_by_scheduled_task(&self, scheduled_task_id: &str, limit: usize) -> RepositoryResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .iter()
            .filter(|t| t.scheduled_task_id.as_deref() == Some(scheduled_task_id))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(limit);
        Ok(tasks)
    }
}

#[derive(Default)]
pub struct MemoryDeviceRepository {
    devices: RwLock<HashMap<String, Device>>,
}

impl MemoryDeviceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, device: Device) {
        self.devices.write().await.insert(device.id.clone(), device);
    }
}

#[async_trait]
impl DeviceRepository for MemoryDeviceRepository {
    async fn get(&self, id: &str) -> RepositoryResult<Device> {
        self.devices
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found("device", id))
    }
}

#[derive(Default)]
pub struct MemoryTenantConfigurationRepository {
    configurations: RwLock<HashMap<String, TenantConfiguration>>,
}

impl MemoryTenantConfigurationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, configuration: TenantConfiguration) {
        self.configurations
            .write()
            .await
            .insert(configuration.tenant_id.clone(), configuration);
    }
}

#[async_trait]
impl TenantConfigurationRepository for MemoryTenantConfigurationRepository {
    async fn get(&self, tenant_id: &str) -> RepositoryResult<TenantConfiguration> {
        self.configurations
            .read()
            .await
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found("tenant configuration", tenant_id))
    }
}
