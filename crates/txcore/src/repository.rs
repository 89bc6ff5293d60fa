//! Storage interface for flows, instances, tasks, exception records and
//! audit logs.
//!
//! Semantics shared by every implementation:
//! - `create` on an existing key fails with [`RepositoryError::Conflict`]
//! - `get` returns `Ok(None)` for a missing key
//! - `update` of a missing key fails with [`RepositoryError::NotFound`]
//! - paged lists return `(rows, total)`

use crate::error::RepositoryError;
use crate::model::{ExceptionRecord, ExecutionLog, Flow, Instance, InstanceStatus, Task};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub type Page<T> = (Vec<T>, usize);

#[async_trait]
pub trait FlowRepository: Send + Sync {
    async fn create(&self, flow: &Flow) -> Result<(), RepositoryError>;
    async fn get(&self, id: &str) -> Result<Option<Flow>, RepositoryError>;
    async fn update(&self, flow: &Flow) -> Result<(), RepositoryError>;
    async fn list(&self, offset: usize, limit: usize) -> Result<Page<Flow>, RepositoryError>;
}

#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn create(&self, instance: &Instance) -> Result<(), RepositoryError>;
    async fn get(&self, id: &str) -> Result<Option<Instance>, RepositoryError>;
    async fn update(&self, instance: &Instance) -> Result<(), RepositoryError>;
    /// Move `id` from `from` to `to` in one step; false when the row is not in `from`
    async fn transition_if(
        &self,
        id: &str,
        from: InstanceStatus,
        to: InstanceStatus,
    ) -> Result<bool, RepositoryError>;
    /// Newest first
    async fn list(&self, offset: usize, limit: usize) -> Result<Page<Instance>, RepositoryError>;
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create(&self, task: &Task) -> Result<(), RepositoryError>;
    async fn get(&self, id: &str) -> Result<Option<Task>, RepositoryError>;
    async fn update(&self, task: &Task) -> Result<(), RepositoryError>;
    async fn list(&self, offset: usize, limit: usize) -> Result<Page<Task>, RepositoryError>;
    /// Every task of one instance, in creation order
    async fn list_by_group(&self, group_id: &str) -> Result<Vec<Task>, RepositoryError>;
}

#[async_trait]
pub trait ExceptionRepository: Send + Sync {
    /// Stores the record and returns its assigned id
    async fn create(&self, record: &ExceptionRecord) -> Result<i64, RepositoryError>;
    async fn get(&self, id: i64) -> Result<Option<ExceptionRecord>, RepositoryError>;
    async fn update(&self, record: &ExceptionRecord) -> Result<(), RepositoryError>;

    /// Newest first, optionally filtered by `handled`
    async fn list(
        &self,
        offset: usize,
        limit: usize,
        handled: Option<bool>,
    ) -> Result<Page<ExceptionRecord>, RepositoryError>;

    /// Auto-retry candidates due at `now`, oldest `retry_next_at` first
    async fn get_pending_retry(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExceptionRecord>, RepositoryError>;

    /// `retry_times += 1` and `retry_next_at = now + retry_interval`
    async fn increment_retry(&self, id: i64, now: DateTime<Utc>) -> Result<(), RepositoryError>;

    /// `retry_times = retry_max`
    async fn mark_retry_complete(&self, id: i64) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait LogRepository: Send + Sync {
    async fn create(&self, log: &ExecutionLog) -> Result<i64, RepositoryError>;
    async fn list_by_task(&self, task_id: &str) -> Result<Vec<ExecutionLog>, RepositoryError>;
    async fn list_by_group(&self, group_id: &str) -> Result<Vec<ExecutionLog>, RepositoryError>;
}

/// Shared handle to every repository the engine and service need
#[derive(Clone)]
pub struct Repositories {
    pub flows: Arc<dyn FlowRepository>,
    pub instances: Arc<dyn InstanceRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub exceptions: Arc<dyn ExceptionRepository>,
    pub logs: Arc<dyn LogRepository>,
}

impl Repositories {
    /// Use one store for all five repositories
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: FlowRepository
            + InstanceRepository
            + TaskRepository
            + ExceptionRepository
            + LogRepository
            + 'static,
    {
        Self {
            flows: store.clone(),
            instances: store.clone(),
            tasks: store.clone(),
            exceptions: store.clone(),
            logs: store,
        }
    }
}
