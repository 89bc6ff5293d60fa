#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use txcore::{
    params_from_json, ConfigMap, ExecContext, ExecutorError, Flow, FlowDefinition, Params,
    Repositories, TaskExecutor,
};
use txruntime::{EngineConfig, ExecutorFactory, FlowEngine, MemoryStore, TaskRegistry};

#[derive(Debug, Clone)]
pub struct Call {
    pub task_id: String,
    pub config: ConfigMap,
    pub input: Params,
}

/// Executor whose outcome is scripted by the test
pub struct ScriptedExecutor {
    task_type: String,
    /// Fail this many upcoming calls; `usize::MAX` fails forever
    failures: AtomicUsize,
    delay: Duration,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedExecutor {
    fn build(task_type: &str, failures: usize, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            task_type: task_type.to_string(),
            failures: AtomicUsize::new(failures),
            delay,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn ok(task_type: &str) -> Arc<Self> {
        Self::build(task_type, 0, Duration::ZERO)
    }

    pub fn failing(task_type: &str) -> Arc<Self> {
        Self::build(task_type, usize::MAX, Duration::ZERO)
    }

    pub fn failing_times(task_type: &str, times: usize) -> Arc<Self> {
        Self::build(task_type, times, Duration::ZERO)
    }

    pub fn slow(task_type: &str, delay: Duration) -> Arc<Self> {
        Self::build(task_type, 0, delay)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    async fn execute(&self, ctx: &ExecContext, config: &ConfigMap, input: &Params) -> Result<(), ExecutorError> {
        self.calls.lock().unwrap().push(Call {
            task_id: ctx.task_id.clone(),
            config: config.clone(),
            input: input.clone(),
        });

        if !self.delay.is_zero() {
            let delay = self.delay;
            ctx.guard(async move {
                tokio::time::sleep(delay).await;
                Ok(())
            })
            .await?;
        }

        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining == 0 {
            return Ok(());
        }
        if remaining != usize::MAX {
            self.failures.fetch_sub(1, Ordering::SeqCst);
        }
        Err(ExecutorError::Status {
            status: 502,
            body: "scripted failure".to_string(),
        })
    }
}

pub struct Harness {
    pub repos: Repositories,
    pub engine: FlowEngine,
}

pub fn harness(executors: Vec<Arc<ScriptedExecutor>>, config: EngineConfig) -> Harness {
    harness_with_registry(executors, config, TaskRegistry::with_builtins())
}

pub fn harness_with_registry(
    executors: Vec<Arc<ScriptedExecutor>>,
    config: EngineConfig,
    registry: TaskRegistry,
) -> Harness {
    let repos = Repositories::from_store(Arc::new(MemoryStore::new()));
    harness_on(repos, executors, config, registry)
}

/// Engine over caller-supplied repositories
pub fn harness_on(
    repos: Repositories,
    executors: Vec<Arc<ScriptedExecutor>>,
    config: EngineConfig,
    registry: TaskRegistry,
) -> Harness {
    let mut factory = ExecutorFactory::new();
    for executor in executors {
        factory.register(executor);
    }
    let engine = FlowEngine::new(repos.clone(), Arc::new(registry), Arc::new(factory), config);
    Harness { repos, engine }
}

pub async fn save_flow(repos: &Repositories, definition: &FlowDefinition) -> Flow {
    let flow = Flow::new(
        format!("flow-{}", definition.name),
        definition.name.clone(),
        definition.to_document().unwrap(),
    );
    repos.flows.create(&flow).await.unwrap();
    flow
}

pub fn params(value: serde_json::Value) -> Params {
    match value {
        serde_json::Value::Object(map) => params_from_json(map),
        other => panic!("params must be an object, got {other}"),
    }
}

pub fn payment_params() -> serde_json::Value {
    serde_json::json!({
        "deduct": {"user_id": "u1", "amount": "100", "order_id": "o1"},
        "notify": {"user_id": "u1", "order_id": "o1", "status": "paid"}
    })
}

pub fn enforce() -> EngineConfig {
    EngineConfig {
        dependency_mode: txruntime::DependencyMode::Enforce,
        ..EngineConfig::default()
    }
}

/// Default engine settings: `depends_on` is recorded, not honored
pub fn ignore_dependencies() -> EngineConfig {
    EngineConfig::default()
}
