use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use txcore::repository::{
    ExceptionRepository, FlowRepository, InstanceRepository, LogRepository, Page, TaskRepository,
};
use txcore::{ExceptionRecord, ExecutionLog, Flow, Instance, InstanceStatus, RepositoryError, Task};

/// In-process store for every repository; state is lost on exit
#[derive(Default)]
pub struct MemoryStore {
    flows: RwLock<Vec<Flow>>,
    instances: RwLock<Vec<Instance>>,
    tasks: RwLock<Vec<Task>>,
    exceptions: RwLock<ExceptionTable>,
    logs: RwLock<LogTable>,
}

#[derive(Default)]
struct ExceptionTable {
    next_id: i64,
    rows: HashMap<i64, ExceptionRecord>,
}

#[derive(Default)]
struct LogTable {
    next_id: i64,
    rows: Vec<ExecutionLog>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn page<T: Clone>(rows: impl Iterator<Item = T>, offset: usize, limit: usize) -> Page<T> {
    let rows: Vec<T> = rows.collect();
    let total = rows.len();
    (rows.into_iter().skip(offset).take(limit).collect(), total)
}

#[async_trait]
impl FlowRepository for MemoryStore {
    async fn create(&self, flow: &Flow) -> Result<(), RepositoryError> {
        let mut flows = self.flows.write().await;
        if flows.iter().any(|f| f.id == flow.id) {
            return Err(RepositoryError::Conflict(format!("flow {} already exists", flow.id)));
        }
        flows.push(flow.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Flow>, RepositoryError> {
        Ok(self.flows.read().await.iter().find(|f| f.id == id).cloned())
    }

    async fn update(&self, flow: &Flow) -> Result<(), RepositoryError> {
        let mut flows = self.flows.write().await;
        let slot = flows
            .iter_mut()
            .find(|f| f.id == flow.id)
            .ok_or_else(|| RepositoryError::NotFound(format!("flow {}", flow.id)))?;
        *slot = flow.clone();
        Ok(())
    }

    async fn list(&self, offset: usize, limit: usize) -> Result<Page<Flow>, RepositoryError> {
        let flows = self.flows.read().await;
        Ok(page(flows.iter().cloned(), offset, limit))
    }
}

#[async_trait]
impl InstanceRepository for MemoryStore {
    async fn create(&self, instance: &Instance) -> Result<(), RepositoryError> {
        let mut instances = self.instances.write().await;
        if instances.iter().any(|i| i.id == instance.id) {
            return Err(RepositoryError::Conflict(format!("instance {} already exists", instance.id)));
        }
        instances.push(instance.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Instance>, RepositoryError> {
        Ok(self.instances.read().await.iter().find(|i| i.id == id).cloned())
    }

    async fn update(&self, instance: &Instance) -> Result<(), RepositoryError> {
        let mut instances = self.instances.write().await;
        let slot = instances
            .iter_mut()
            .find(|i| i.id == instance.id)
            .ok_or_else(|| RepositoryError::NotFound(format!("instance {}", instance.id)))?;
        *slot = instance.clone();
        Ok(())
    }

    async fn transition_if(
        &self,
        id: &str,
        from: InstanceStatus,
        to: InstanceStatus,
    ) -> Result<bool, RepositoryError> {
        let mut instances = self.instances.write().await;
        let slot = instances
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| RepositoryError::NotFound(format!("instance {}", id)))?;
        if slot.status != from {
            return Ok(false);
        }
        slot.transition(to);
        Ok(true)
    }

    async fn list(&self, offset: usize, limit: usize) -> Result<Page<Instance>, RepositoryError> {
        let instances = self.instances.read().await;
        Ok(page(instances.iter().rev().cloned(), offset, limit))
    }
}

#[async_trait]
impl TaskRepository for MemoryStore {
    async fn create(&self, task: &Task) -> Result<(), RepositoryError> {
        let mut tasks = self.tasks.write().await;
        if tasks.iter().any(|t| t.id == task.id) {
            return Err(RepositoryError::Conflict(format!("task {} already exists", task.id)));
        }
        tasks.push(task.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, RepositoryError> {
        Ok(self.tasks.read().await.iter().find(|t| t.id == id).cloned())
    }

    async fn update(&self, task: &Task) -> Result<(), RepositoryError> {
        let mut tasks = self.tasks.write().await;
        let slot = tasks
            .iter_mut()
            .find(|t| t.id == task.id)
            .ok_or_else(|| RepositoryError::NotFound(format!("task {}", task.id)))?;
        *slot = task.clone();
        Ok(())
    }

    async fn list(&self, offset: usize, limit: usize) -> Result<Page<Task>, RepositoryError> {
        let tasks = self.tasks.read().await;
        Ok(page(tasks.iter().cloned(), offset, limit))
    }

    async fn list_by_group(&self, group_id: &str) -> Result<Vec<Task>, RepositoryError> {
        let tasks = self.tasks.read().await;
        Ok(tasks.iter().filter(|t| t.group_id == group_id).cloned().collect())
    }
}

#[async_trait]
impl ExceptionRepository for MemoryStore {
    async fn create(&self, record: &ExceptionRecord) -> Result<i64, RepositoryError> {
        let mut table = self.exceptions.write().await;
        table.next_id += 1;
        let id = table.next_id;
        let mut record = record.clone();
        record.id = id;
        table.rows.insert(id, record);
        Ok(id)
    }

    async fn get(&self, id: i64) -> Result<Option<ExceptionRecord>, RepositoryError> {
        Ok(self.exceptions.read().await.rows.get(&id).cloned())
    }

    async fn update(&self, record: &ExceptionRecord) -> Result<(), RepositoryError> {
        let mut table = self.exceptions.write().await;
        let slot = table
            .rows
            .get_mut(&record.id)
            .ok_or_else(|| RepositoryError::NotFound(format!("exception {}", record.id)))?;
        *slot = record.clone();
        Ok(())
    }

    async fn list(
        &self,
        offset: usize,
        limit: usize,
        handled: Option<bool>,
    ) -> Result<Page<ExceptionRecord>, RepositoryError> {
        let table = self.exceptions.read().await;
        let mut rows: Vec<&ExceptionRecord> = table
            .rows
            .values()
            .filter(|r| handled.map_or(true, |h| r.handled == h))
            .collect();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(page(rows.into_iter().cloned(), offset, limit))
    }

    async fn get_pending_retry(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExceptionRecord>, RepositoryError> {
        let table = self.exceptions.read().await;
        let mut due: Vec<ExceptionRecord> = table
            .rows
            .values()
            .filter(|r| r.is_due(now))
            .cloned()
            .collect();
        // Unset `retry_next_at` sorts first, then oldest-due, then id
        due.sort_by(|a, b| a.retry_next_at.cmp(&b.retry_next_at).then(a.id.cmp(&b.id)));
        Ok(due)
    }

    async fn increment_retry(&self, id: i64, now: DateTime<Utc>) -> Result<(), RepositoryError> {
        let mut table = self.exceptions.write().await;
        let record = table
            .rows
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("exception {}", id)))?;
        record.retry_times += 1;
        record.retry_next_at = Some(record.next_retry_after(now));
        Ok(())
    }

    async fn mark_retry_complete(&self, id: i64) -> Result<(), RepositoryError> {
        let mut table = self.exceptions.write().await;
        let record = table
            .rows
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("exception {}", id)))?;
        record.retry_times = record.retry_max;
        Ok(())
    }
}

#[async_trait]
impl LogRepository for MemoryStore {
    async fn create(&self, log: &ExecutionLog) -> Result<i64, RepositoryError> {
        let mut table = self.logs.write().await;
        table.next_id += 1;
        let id = table.next_id;
        let mut log = log.clone();
        log.id = id;
        table.rows.push(log);
        Ok(id)
    }

    async fn list_by_task(&self, task_id: &str) -> Result<Vec<ExecutionLog>, RepositoryError> {
        let table = self.logs.read().await;
        Ok(table.rows.iter().filter(|l| l.task_id == task_id).cloned().collect())
    }

    async fn list_by_group(&self, group_id: &str) -> Result<Vec<ExecutionLog>, RepositoryError> {
        let table = self.logs.read().await;
        Ok(table.rows.iter().filter(|l| l.group_id == group_id).cloned().collect())
    }
}
