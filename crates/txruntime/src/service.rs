use crate::engine::FlowEngine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use txcore::{
    params_from_json, DefinitionError, ErrorClass, ExceptionRecord, Flow, FlowDefinition,
    FlowError, Instance, InstanceStatus, Params, Repositories, RepositoryError, RetryStrategy, Task,
};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Error, Debug, Clone)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl ServiceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ServiceError::NotFound(_) => ErrorClass::NotFound,
            ServiceError::BadRequest(_) | ServiceError::Definition(_) => ErrorClass::BadRequest,
            ServiceError::Repository(e) => e.class(),
        }
    }
}

/// Request to register a flow template
#[derive(Debug, Clone, Deserialize)]
pub struct NewFlow {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_flow_type")]
    pub flow_type: String,
    /// Flow document, either as an object or as JSON text
    pub definition: serde_json::Value,
    #[serde(default)]
    pub created_by: String,
}

fn default_flow_type() -> String {
    "transaction".to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub instance_id: String,
    pub flow_id: String,
    pub status: InstanceStatus,
    /// The id already existed; nothing new was started
    pub replayed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionView {
    #[serde(flatten)]
    pub instance: Instance,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageResult<T> {
    pub list: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
}

/// Normalize 1-based paging input into `(page, page_size, offset)`
pub fn paging(page: Option<usize>, page_size: Option<usize>) -> (usize, usize, usize) {
    let page = page.filter(|p| *p > 0).unwrap_or(1);
    let page_size = page_size
        .filter(|s| *s > 0)
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .min(MAX_PAGE_SIZE);
    (page, page_size, (page - 1) * page_size)
}

/// Entry point for everything that starts, inspects or retries a
/// transaction.
///
/// Flows run in the background on tasks owned by the service, so they
/// outlive the request that started them and stop only on [`shutdown`].
///
/// [`shutdown`]: TransactionService::shutdown
pub struct TransactionService {
    repos: Repositories,
    engine: FlowEngine,
    shutdown: CancellationToken,
    running: Mutex<JoinSet<()>>,
}

impl TransactionService {
    pub fn new(repos: Repositories, engine: FlowEngine) -> Self {
        Self {
            repos,
            engine,
            shutdown: CancellationToken::new(),
            running: Mutex::new(JoinSet::new()),
        }
    }

    pub fn engine(&self) -> &FlowEngine {
        &self.engine
    }

    pub async fn create_flow(&self, request: NewFlow) -> Result<Flow, ServiceError> {
        if request.name.trim().is_empty() {
            return Err(ServiceError::BadRequest("name is required".to_string()));
        }

        let definition = match request.definition {
            serde_json::Value::String(text) => FlowDefinition::parse(&text)?,
            value @ serde_json::Value::Object(_) => serde_json::from_value(value)
                .map_err(|e| DefinitionError::Malformed(e.to_string()))?,
            _ => {
                return Err(ServiceError::BadRequest(
                    "definition must be a JSON object or JSON text".to_string(),
                ))
            }
        };
        self.engine.config().dependency_mode.plan(&definition)?;
        definition.check_retry_intervals()?;
        for task in &definition.tasks {
            if !self.engine.registry().contains(&task.task_name) {
                return Err(DefinitionError::UnknownTask(task.task_name.clone()).into());
            }
        }

        let mut flow = Flow::new(
            uuid::Uuid::new_v4().to_string(),
            request.name,
            definition.to_document()?,
        );
        flow.description = request.description;
        flow.flow_type = request.flow_type;
        flow.created_by = request.created_by.clone();
        flow.updated_by = request.created_by;

        self.repos.flows.create(&flow).await?;
        tracing::info!(flow_id = %flow.id, name = %flow.name, "Flow created");
        Ok(flow)
    }

    pub async fn get_flow(&self, id: &str) -> Result<Flow, ServiceError> {
        self.repos
            .flows
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("flow {}", id)))
    }

    pub async fn list_flows(
        &self,
        page: Option<usize>,
        page_size: Option<usize>,
    ) -> Result<PageResult<Flow>, ServiceError> {
        let (page, page_size, offset) = paging(page, page_size);
        let (list, total) = self.repos.flows.list(offset, page_size).await?;
        Ok(PageResult { list, page, page_size, total })
    }

    /// Create the instance and run it in the background.
    ///
    /// Starting an id that already exists returns that instance's current
    /// status and runs nothing.
    pub async fn start_transaction(
        &self,
        instance_id: &str,
        flow_id: &str,
        params: serde_json::Value,
    ) -> Result<StartOutcome, ServiceError> {
        if instance_id.trim().is_empty() {
            return Err(ServiceError::BadRequest("instance_id is required".to_string()));
        }
        let params = match params {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            value @ serde_json::Value::Object(_) => value,
            _ => return Err(ServiceError::BadRequest("params must be a JSON object".to_string())),
        };

        if let Some(existing) = self.repos.instances.get(instance_id).await? {
            return Ok(replayed(existing));
        }

        let flow = self.get_flow(flow_id).await?;
        if !flow.active {
            return Err(ServiceError::BadRequest(format!("flow {} is not active", flow_id)));
        }

        let instance = Instance::new(instance_id, flow_id, params);
        match self.repos.instances.create(&instance).await {
            Ok(()) => {}
            Err(RepositoryError::Conflict(_)) => {
                // Lost a race with an identical start
                return match self.repos.instances.get(instance_id).await? {
                    Some(existing) => Ok(replayed(existing)),
                    None => Err(ServiceError::Repository(RepositoryError::Conflict(format!(
                        "instance {} already exists",
                        instance_id
                    )))),
                };
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(instance_id = %instance.id, flow_id = %flow.id, "Transaction started");
        let outcome = StartOutcome {
            instance_id: instance.id.clone(),
            flow_id: flow.id.clone(),
            status: instance.status,
            replayed: false,
        };
        self.launch(instance, flow).await;
        Ok(outcome)
    }

    pub async fn get_transaction(&self, id: &str) -> Result<TransactionView, ServiceError> {
        let instance = self
            .repos
            .instances
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("instance {}", id)))?;
        let tasks = self.repos.tasks.list_by_group(id).await?;
        Ok(TransactionView { instance, tasks })
    }

    /// Re-run a failed transaction from scratch with its original params
    pub async fn retry_transaction(&self, id: &str) -> Result<StartOutcome, ServiceError> {
        let mut instance = self
            .repos
            .instances
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("instance {}", id)))?;
        if instance.status != InstanceStatus::Failed {
            return Err(ServiceError::BadRequest(
                "only failed transactions can be retried".to_string(),
            ));
        }
        let flow = self.get_flow(&instance.flow_id).await?;

        // Only one concurrent retry may claim the failed instance
        let claimed = self
            .repos
            .instances
            .transition_if(id, InstanceStatus::Failed, InstanceStatus::Pending)
            .await?;
        if !claimed {
            return Err(ServiceError::BadRequest(format!(
                "transaction {} is already being retried",
                id
            )));
        }

        instance.attempt += 1;
        instance.transition(InstanceStatus::Pending);
        self.repos.instances.update(&instance).await?;

        tracing::info!(instance_id = %instance.id, attempt = instance.attempt, "Transaction retry requested");
        let outcome = StartOutcome {
            instance_id: instance.id.clone(),
            flow_id: flow.id.clone(),
            status: instance.status,
            replayed: false,
        };
        self.launch(instance, flow).await;
        Ok(outcome)
    }

    pub async fn list_exceptions(
        &self,
        page: Option<usize>,
        page_size: Option<usize>,
        handled: Option<bool>,
    ) -> Result<PageResult<ExceptionRecord>, ServiceError> {
        let (page, page_size, offset) = paging(page, page_size);
        let (list, total) = self.repos.exceptions.list(offset, page_size, handled).await?;
        Ok(PageResult { list, page, page_size, total })
    }

    /// Mark an exception handled; handled records take no further retries
    pub async fn handle_exception(
        &self,
        id: i64,
        handled_by: Option<String>,
        remark: Option<String>,
    ) -> Result<ExceptionRecord, ServiceError> {
        let mut record = self.get_exception(id).await?;
        if record.handled {
            return Err(ServiceError::BadRequest(format!("exception {} is already handled", id)));
        }

        record.handled = true;
        record.handled_by = Some(handled_by.unwrap_or_else(|| "system".to_string()));
        record.handled_at = Some(Utc::now());
        record.handled_remark = remark;
        self.repos.exceptions.update(&record).await?;

        tracing::info!(exception_id = id, "Exception handled");
        Ok(record)
    }

    /// Pull the next automatic attempt forward to one interval from now
    pub async fn schedule_exception_retry(&self, id: i64) -> Result<ExceptionRecord, ServiceError> {
        let mut record = self.get_exception(id).await?;
        if record.handled {
            return Err(ServiceError::BadRequest("handled exception cannot be retried".to_string()));
        }
        if record.retry_strategy == RetryStrategy::NoRetry {
            return Err(ServiceError::BadRequest(
                "this exception is configured to not retry".to_string(),
            ));
        }

        record.retry_next_at = Some(record.next_retry_after(Utc::now()));
        self.repos.exceptions.update(&record).await?;
        Ok(record)
    }

    /// Cancel in-flight flows and wait for them to wind down
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.drain().await;
    }

    /// Wait until every background flow started so far has finished
    pub async fn drain(&self) {
        loop {
            // Join outside the lock so `launch` is never blocked by a drain
            let mut running = std::mem::take(&mut *self.running.lock().await);
            if running.is_empty() {
                return;
            }
            while let Some(result) = running.join_next().await {
                if let Err(e) = result {
                    tracing::error!("Background flow ended abnormally: {}", e);
                }
            }
        }
    }

    async fn get_exception(&self, id: i64) -> Result<ExceptionRecord, ServiceError> {
        self.repos
            .exceptions
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("exception {}", id)))
    }

    async fn launch(&self, mut instance: Instance, flow: Flow) {
        let engine = self.engine.clone();
        let repos = self.repos.clone();
        let token = self.shutdown.child_token();
        let params: Params = match &instance.params {
            serde_json::Value::Object(map) => params_from_json(map.clone()),
            _ => Params::new(),
        };

        let mut running = self.running.lock().await;
        // Reap finished flows so the set does not grow without bound
        while running.try_join_next().is_some() {}
        running.spawn(async move {
            match engine.execute(&token, &mut instance, &flow, &params).await {
                Ok(()) => {}
                Err(FlowError::Definition(e)) => {
                    tracing::error!(instance_id = %instance.id, "Flow definition rejected: {}", e);
                    instance.transition(InstanceStatus::Failed);
                    if let Err(e) = repos.instances.update(&instance).await {
                        tracing::error!(instance_id = %instance.id, "Failed to persist failed status: {}", e);
                    }
                }
                Err(e) => {
                    tracing::error!(instance_id = %instance.id, "Execute failed: {}", e);
                }
            }
        });
    }
}

fn replayed(existing: Instance) -> StartOutcome {
    StartOutcome {
        instance_id: existing.id,
        flow_id: existing.flow_id,
        status: existing.status,
        replayed: true,
    }
}
