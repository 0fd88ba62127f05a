//! Repository Ports
//!
//! Persistence is an external concern; workers only see these traits.
//! `memory` holds the in-process implementations the binary runs with.

mod memory;

pub use memory::{
    MemoryCommandRepository, MemoryDeviceRepository, MemoryScheduledTaskRepository,
    MemoryTaskRepository, MemoryTenantConfigurationRepository,
};

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Command, Device, ScheduledTask, Task, TenantConfiguration};

/// Errors returned by repositories
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepositoryError {
    /// No record with that id
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Backend failure
    #[error("Repository unavailable: {0}")]
    Unavailable(String),
}

impl RepositoryError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        RepositoryError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::NotFound { .. })
    }
}

/// Result type alias for repository operations
pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait CommandRepository: Send + Sync {
    /// Commands still waiting to be dispatched
    async fn find_all_pending(&self) -> RepositoryResult<Vec<Command>>;
    async fn get(&self, id: &str) -> RepositoryResult<Command>;
    async fn update(&self, command: Command) -> RepositoryResult<()>;
}

#[async_trait]
pub trait ScheduledTaskRepository: Send + Sync {
    async fn find_all_active(&self) -> RepositoryResult<Vec<ScheduledTask>>;
    async fn get(&self, id: &str) -> RepositoryResult<ScheduledTask>;
    async fn update(&self, scheduled_task: ScheduledTask) -> RepositoryResult<()>;
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create(&self, task: Task) -> RepositoryResult<()>;
    /// Newest first, at most `limit`
    async fn find_by_scheduled_task(&self, scheduled_task_id: &str, limit: usize) -> RepositoryResult<Vec<Task>>;
}

#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn get(&self, id: &str) -> RepositoryResult<Device>;
}

#[async_trait]
pub trait TenantConfigurationRepository: Send + Sync {
    async fn get(&self, tenant_id: &str) -> RepositoryResult<TenantConfiguration>;
}
