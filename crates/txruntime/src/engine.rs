use crate::factory::ExecutorFactory;
use crate::graph::ExecutionPlan;
use crate::registry::TaskRegistry;
use crate::validator;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use txcore::{
    merge_config, params_to_json, ConfigMap, DefinitionError, ExceptionRecord, ExecContext,
    ExecutionLog, ExecutorError, Flow, FlowDefinition, FlowError, FlowTask, Instance,
    InstanceStatus, LogAction, Params, Repositories, RetryPolicy, Task, TaskDefinition, TaskError,
    TaskFailure, Value,
};

/// How `depends_on` edges are treated at run time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyMode {
    /// Start every node together; edges are recorded but not honored
    #[default]
    Ignore,
    /// Run a node once all its predecessors succeeded; skip it if any failed
    Enforce,
}

impl DependencyMode {
    /// Check a document for this mode.
    ///
    /// `Enforce` needs a full plan, so unknown targets and cycles are
    /// errors. `Ignore` only rejects duplicate node ids and logs edge
    /// problems.
    pub fn plan(self, definition: &FlowDefinition) -> Result<Option<ExecutionPlan>, DefinitionError> {
        match self {
            DependencyMode::Enforce => ExecutionPlan::build(definition).map(Some),
            DependencyMode::Ignore => {
                ExecutionPlan::check_node_ids(definition)?;
                if let Err(e) = ExecutionPlan::build(definition) {
                    tracing::warn!(flow = %definition.name, "Ignoring dependency problem: {}", e);
                }
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub dependency_mode: DependencyMode,
    pub default_retry: RetryPolicy,
    /// Merge the failed task's saved config over the definition defaults on retry
    pub retry_with_node_config: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dependency_mode: DependencyMode::Ignore,
            default_retry: RetryPolicy::default(),
            retry_with_node_config: false,
        }
    }
}

/// Runs flow instances: one concurrent unit per node, every outcome recorded
/// through the repositories.
#[derive(Clone)]
pub struct FlowEngine {
    repos: Repositories,
    registry: Arc<TaskRegistry>,
    factory: Arc<ExecutorFactory>,
    config: EngineConfig,
}

/// Everything one node needs to run on its own task
struct NodeJob {
    position: usize,
    instance_id: String,
    task_id: String,
    group_name: String,
    node: FlowTask,
    params: Arc<Params>,
    cancellation: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

type NodeOutcome = (usize, Result<(), TaskError>);

impl FlowEngine {
    pub fn new(
        repos: Repositories,
        registry: Arc<TaskRegistry>,
        factory: Arc<ExecutorFactory>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repos,
            registry,
            factory,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute every node of `flow` for `instance`.
    ///
    /// A malformed document fails before the instance is touched. Otherwise
    /// the instance ends `success` with `completed_at` set, or `failed` with
    /// every node failure returned in document order.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        instance: &mut Instance,
        flow: &Flow,
        params: &Params,
    ) -> Result<(), FlowError> {
        let definition = FlowDefinition::parse(&flow.definition)?;
        let plan = self.config.dependency_mode.plan(&definition)?;

        instance.transition(InstanceStatus::Running);
        self.repos.instances.update(instance).await?;

        tracing::info!(
            instance_id = %instance.id,
            flow_id = %flow.id,
            attempt = instance.attempt,
            nodes = definition.tasks.len(),
            "Starting flow execution"
        );

        let params = Arc::new(params.clone());
        let jobs: Vec<NodeJob> = definition
            .tasks
            .iter()
            .enumerate()
            .map(|(position, node)| NodeJob {
                position,
                instance_id: instance.id.clone(),
                task_id: instance.task_id(&node.id),
                group_name: flow.name.clone(),
                node: node.clone(),
                params: params.clone(),
                cancellation: cancel.clone(),
            })
            .collect();

        let mut outcomes = match &plan {
            None => self.run_all(jobs).await,
            Some(plan) => self.run_ordered(plan, jobs).await,
        };
        outcomes.sort_by_key(|(position, _)| *position);

        let failures: Vec<TaskFailure> = outcomes
            .into_iter()
            .filter_map(|(position, result)| {
                result.err().map(|error| {
                    let node = &definition.tasks[position];
                    TaskFailure {
                        node_id: node.id.clone(),
                        task_name: node.task_name.clone(),
                        error,
                    }
                })
            })
            .collect();

        if !failures.is_empty() {
            instance.transition(InstanceStatus::Failed);
            if let Err(e) = self.repos.instances.update(instance).await {
                tracing::error!(instance_id = %instance.id, "Failed to persist failed status: {}", e);
            }
            tracing::warn!(instance_id = %instance.id, failed = failures.len(), "Flow execution failed");
            return Err(FlowError::TasksFailed(failures));
        }

        instance.transition(InstanceStatus::Success);
        self.repos.instances.update(instance).await?;
        tracing::info!(instance_id = %instance.id, "Flow execution completed");
        Ok(())
    }

    /// Start every node at once and join them all
    async fn run_all(&self, jobs: Vec<NodeJob>) -> Vec<NodeOutcome> {
        let mut running: FuturesUnordered<_> = jobs.into_iter().map(|job| self.spawn(job)).collect();
        let mut outcomes = Vec::new();
        while let Some(outcome) = running.next().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Run nodes as their predecessors succeed; skip those behind a failure
    async fn run_ordered(&self, plan: &ExecutionPlan, jobs: Vec<NodeJob>) -> Vec<NodeOutcome> {
        let node_ids: Vec<String> = jobs.iter().map(|job| job.node.id.clone()).collect();
        let mut states = vec![NodeState::Pending; jobs.len()];
        let mut pending: Vec<Option<NodeJob>> = jobs.into_iter().map(Some).collect();
        let mut running = FuturesUnordered::new();
        let mut outcomes = Vec::new();

        loop {
            for position in 0..states.len() {
                if states[position] != NodeState::Pending {
                    continue;
                }
                let dependencies = plan.dependencies(position);
                if let Some(blocker) = dependencies
                    .iter()
                    .find(|d| matches!(states[**d], NodeState::Failed | NodeState::Skipped))
                {
                    states[position] = NodeState::Skipped;
                    if let Some(job) = pending[position].take() {
                        tracing::warn!(
                            instance_id = %job.instance_id,
                            node_id = %job.node.id,
                            blocked_by = %node_ids[*blocker],
                            "Skipping node because a dependency did not succeed"
                        );
                    }
                    continue;
                }
                if dependencies.iter().all(|d| states[*d] == NodeState::Succeeded) {
                    if let Some(job) = pending[position].take() {
                        states[position] = NodeState::Running;
                        running.push(self.spawn(job));
                    }
                }
            }

            // A skip can cascade to nodes earlier in document order
            if running.is_empty() && states.contains(&NodeState::Pending) {
                continue;
            }

            let Some((position, result)) = running.next().await else {
                break;
            };
            states[position] = if result.is_ok() {
                NodeState::Succeeded
            } else {
                NodeState::Failed
            };
            outcomes.push((position, result));
        }

        outcomes
    }

    fn spawn(&self, job: NodeJob) -> impl std::future::Future<Output = NodeOutcome> {
        let position = job.position;
        let engine = self.clone();
        let handle = tokio::spawn(async move { engine.run_node(job).await });
        async move {
            match handle.await {
                Ok(result) => (position, result),
                Err(e) => (position, Err(TaskError::from(ExecutorError::Aborted(e.to_string())))),
            }
        }
    }

    async fn run_node(&self, job: NodeJob) -> Result<(), TaskError> {
        let NodeJob {
            instance_id,
            task_id,
            group_name,
            node,
            params,
            cancellation,
            ..
        } = job;

        let definition = self
            .registry
            .lookup(&node.task_name)
            .cloned()
            .ok_or_else(|| DefinitionError::UnknownTask(node.task_name.clone()))?;
        let policy = node.retry_policy(&self.config.default_retry);
        let config = merge_config(&definition.config.to_map(), node.config.as_ref());

        let mut task = Task::running(
            &task_id,
            &instance_id,
            &node.id,
            &definition.name,
            &definition.task_type,
        );
        task.description = node.description.clone();
        task.max_retry = policy.max_attempts;
        task.config = serde_json::Value::Object(config.clone());
        self.repos.tasks.create(&task).await?;

        self.audit(&task, LogAction::Start, format!("task {} started", definition.name)).await;
        tracing::info!(task_id = %task.id, task_name = %definition.name, "Task started");

        let result = self
            .dispatch(&definition, &config, &params, cancellation, &mut task)
            .await;

        match result {
            Ok(()) => {
                task.succeed();
                self.save_task(&task).await;
                self.audit(&task, LogAction::Success, "task completed").await;
                tracing::info!(task_id = %task.id, task_name = %definition.name, "Task completed");
                Ok(())
            }
            Err(error) => {
                self.record_failure(&mut task, &group_name, &policy, &error).await;
                Err(error)
            }
        }
    }

    /// Input derivation, executor resolution and the executor call itself
    async fn dispatch(
        &self,
        definition: &TaskDefinition,
        config: &ConfigMap,
        params: &Params,
        cancellation: CancellationToken,
        task: &mut Task,
    ) -> Result<(), TaskError> {
        let input = derive_input(definition, params)?;
        task.input = Some(params_to_json(&input));

        let executor = self
            .factory
            .create(&definition.task_type)
            .map_err(DefinitionError::from)?;

        let ctx = ExecContext::new(&task.group_id, &task.id).with_cancellation(cancellation);
        executor.execute(&ctx, config, &input).await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        task: &mut Task,
        group_name: &str,
        policy: &RetryPolicy,
        error: &TaskError,
    ) {
        let message = error.to_string();
        task.fail(&message);
        self.save_task(task).await;
        self.audit(task, LogAction::Failed, message.clone()).await;

        let record = ExceptionRecord::new(
            &task.group_id,
            &task.id,
            &task.name,
            error.kind(),
            &message,
            policy,
        )
        .with_group_name(group_name);

        match self.repos.exceptions.create(&record).await {
            Ok(id) => tracing::error!(
                task_id = %task.id,
                task_name = %task.name,
                exception_id = id,
                retry_strategy = %policy.strategy,
                "Task failed: {}",
                message
            ),
            Err(e) => tracing::error!(
                task_id = %task.id,
                "Task failed ({}) and its exception record could not be stored: {}",
                message,
                e
            ),
        }
    }

    /// Re-run the node behind `failed` as a new Task row.
    ///
    /// Runs with the definition's default config (plus the failed row's
    /// config snapshot when `retry_with_node_config` is set) and empty input.
    /// Failures are recorded on the new row only; the caller owns the
    /// exception record.
    pub async fn retry_task(
        &self,
        cancel: &CancellationToken,
        instance: &Instance,
        flow: &Flow,
        failed: &Task,
    ) -> Result<(), TaskError> {
        let task_name = failed.name.as_str();
        let definition = self
            .registry
            .lookup(task_name)
            .cloned()
            .ok_or_else(|| DefinitionError::UnknownTask(task_name.to_string()))?;

        let config = if self.config.retry_with_node_config {
            merge_config(&definition.config.to_map(), failed.config.as_object())
        } else {
            definition.config.to_map()
        };

        let task_id = format!("{}_retry_{}", instance.id, uuid::Uuid::new_v4().simple());
        let mut task = Task::running(
            &task_id,
            &instance.id,
            &failed.node_id,
            &definition.name,
            &definition.task_type,
        );
        task.description = failed.description.clone();
        task.retry_count = 1;
        task.max_retry = failed.max_retry;
        task.config = serde_json::Value::Object(config.clone());
        self.repos.tasks.create(&task).await?;

        self.audit(&task, LogAction::Retry, format!("retrying task {}", task_name)).await;
        tracing::info!(task_id = %task.id, task_name, flow_id = %flow.id, "Task retry started");

        let result: Result<(), TaskError> = async {
            let executor = self
                .factory
                .create(&definition.task_type)
                .map_err(DefinitionError::from)?;
            let ctx = ExecContext::new(&instance.id, &task_id).with_cancellation(cancel.clone());
            executor.execute(&ctx, &config, &Params::new()).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                task.succeed();
                self.save_task(&task).await;
                self.audit(&task, LogAction::Success, "retry completed").await;
                tracing::info!(task_id = %task.id, task_name, "Task retry completed");
                Ok(())
            }
            Err(error) => {
                let message = error.to_string();
                task.fail(&message);
                self.save_task(&task).await;
                self.audit(&task, LogAction::Failed, message).await;
                Err(error)
            }
        }
    }

    async fn save_task(&self, task: &Task) {
        if let Err(e) = self.repos.tasks.update(task).await {
            tracing::error!(task_id = %task.id, "Failed to update task: {}", e);
        }
    }

    async fn audit(&self, task: &Task, action: LogAction, message: impl Into<String>) {
        let log = ExecutionLog::new(&task.id, &task.group_id, action, message);
        if let Err(e) = self.repos.logs.create(&log).await {
            tracing::warn!(task_id = %task.id, "Failed to write execution log: {}", e);
        }
    }
}

/// Node input: global params as-is when the definition declares no fields,
/// else `params[task_name]` validated against the schema
pub fn derive_input(definition: &TaskDefinition, params: &Params) -> Result<Params, TaskError> {
    if definition.input_fields.is_empty() {
        return Ok(params.clone());
    }
    let scoped = match params.get(&definition.name) {
        Some(Value::Object(map)) => map.clone(),
        _ => Params::new(),
    };
    Ok(validator::validate(&definition.input_fields, &scoped)?)
}
