use crate::engine::FlowEngine;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use txcore::{ExceptionRecord, Repositories, RepositoryError, TaskError};

/// Observable scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Scanning,
    Dispatching(usize),
    Stopped,
}

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub scanned: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Error, Debug)]
enum RetryError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("{0} not found")]
    Missing(String),

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Background loop that re-runs failed tasks whose exception record asks for
/// automatic retry.
///
/// Records are processed one at a time within a tick, oldest-due first.
pub struct RetryScheduler {
    repos: Repositories,
    engine: FlowEngine,
    interval: Duration,
    state: watch::Sender<SchedulerState>,
    shutdown: CancellationToken,
    /// Context for retried executors, independent of any request and of stop
    context: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RetryScheduler {
    pub fn new(repos: Repositories, engine: FlowEngine, interval: Duration) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            repos,
            engine,
            interval,
            state,
            shutdown: CancellationToken::new(),
            context: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// Spawn the loop; the first scan happens one interval from now
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() || self.shutdown.is_cancelled() {
            return;
        }

        let scheduler = Arc::clone(self);
        *handle = Some(tokio::spawn(async move { scheduler.run().await }));
        tracing::info!("Retry scheduler started with interval: {:?}", self.interval);
    }

    /// Stop after any in-flight tick completes
    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!("Retry scheduler task ended abnormally: {}", e);
            }
        }
        self.state.send_replace(SchedulerState::Stopped);
        tracing::info!("Retry scheduler stopped");
    }

    async fn run(&self) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// Run one scan and process every due record sequentially
    pub async fn tick(&self) -> TickReport {
        self.state.send_replace(SchedulerState::Scanning);

        let due = match self.repos.exceptions.get_pending_retry(Utc::now()).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!("Failed to get pending retries: {}", e);
                self.state.send_replace(SchedulerState::Idle);
                return TickReport::default();
            }
        };

        let mut report = TickReport {
            scanned: due.len(),
            ..Default::default()
        };
        if !due.is_empty() {
            self.state.send_replace(SchedulerState::Dispatching(due.len()));
        }

        for record in &due {
            if self.process(record).await {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
        }

        self.state.send_replace(SchedulerState::Idle);
        report
    }

    async fn process(&self, record: &ExceptionRecord) -> bool {
        tracing::info!(
            exception_id = record.id,
            task_id = %record.task_id,
            retry_times = record.retry_times,
            "Processing retry"
        );

        match self.retry(record).await {
            Ok(()) => {
                if let Err(e) = self.repos.exceptions.mark_retry_complete(record.id).await {
                    tracing::error!(exception_id = record.id, "Failed to mark retry complete: {}", e);
                }
                tracing::info!(exception_id = record.id, "Retry succeeded");
                true
            }
            Err(err) => {
                tracing::error!(exception_id = record.id, "Retry failed: {}", err);
                let bookkeeping = if record.retry_times + 1 >= record.retry_max {
                    tracing::warn!(exception_id = record.id, "Retry exhausted, marked complete");
                    self.repos.exceptions.mark_retry_complete(record.id).await
                } else {
                    self.repos.exceptions.increment_retry(record.id, Utc::now()).await
                };
                if let Err(e) = bookkeeping {
                    tracing::error!(exception_id = record.id, "Failed to update retry state: {}", e);
                }
                false
            }
        }
    }

    async fn retry(&self, record: &ExceptionRecord) -> Result<(), RetryError> {
        let instance = self
            .repos
            .instances
            .get(&record.group_id)
            .await?
            .ok_or_else(|| RetryError::Missing(format!("instance {}", record.group_id)))?;
        let flow = self
            .repos
            .flows
            .get(&instance.flow_id)
            .await?
            .ok_or_else(|| RetryError::Missing(format!("flow {}", instance.flow_id)))?;
        let task = self
            .repos
            .tasks
            .list_by_group(&record.group_id)
            .await?
            .into_iter()
            .find(|t| t.id == record.task_id)
            .ok_or_else(|| RetryError::Missing(format!("task {}", record.task_id)))?;

        self.engine
            .retry_task(&self.context, &instance, &flow, &task)
            .await?;
        Ok(())
    }
}
