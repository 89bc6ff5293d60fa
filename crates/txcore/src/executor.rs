use crate::error::ExecutorError;
use crate::task::ConfigMap;
use crate::value::{Params, Value};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Side-effecting dispatcher for one backend type.
///
/// Success is signalled only by the absence of an error; executors return no
/// payload to the engine.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Backend type tag (e.g., "rpc", "mq", "http", "db")
    fn task_type(&self) -> &str;

    async fn execute(
        &self,
        ctx: &ExecContext,
        config: &ConfigMap,
        input: &Params,
    ) -> Result<(), ExecutorError>;
}

/// Execution context passed to each executor call
#[derive(Clone, Debug)]
pub struct ExecContext {
    pub instance_id: String,
    pub task_id: String,

    /// Cancelled when the owning flow is torn down
    pub cancellation: CancellationToken,
}

impl ExecContext {
    pub fn new(instance_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            task_id: task_id.into(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Run `fut` unless the context is cancelled first
    pub async fn guard<F, T>(&self, fut: F) -> Result<T, ExecutorError>
    where
        F: std::future::Future<Output = Result<T, ExecutorError>>,
    {
        tokio::select! {
            _ = self.cancellation.cancelled() => Err(ExecutorError::Cancelled),
            result = fut => result,
        }
    }

    /// Like [`guard`](Self::guard) with an upper bound on wall time
    pub async fn guard_timeout<F, T>(&self, limit: Duration, fut: F) -> Result<T, ExecutorError>
    where
        F: std::future::Future<Output = Result<T, ExecutorError>>,
    {
        self.guard(async move {
            match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(ExecutorError::Timeout { seconds: limit.as_secs() }),
            }
        })
        .await
    }
}

/// Get a required string config key or return a configuration error
pub fn require_str<'a>(config: &'a ConfigMap, key: &str) -> Result<&'a str, ExecutorError> {
    config
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ExecutorError::Configuration(format!("Missing config: {}", key)))
}

/// Optional string config key
pub fn config_str<'a>(config: &'a ConfigMap, key: &str) -> Option<&'a str> {
    config.get(key).and_then(|v| v.as_str())
}

/// Input value by key, `Null` when absent
pub fn input_or_null<'a>(input: &'a Params, key: &str) -> &'a Value {
    const NULL: &Value = &Value::Null;
    input.get(key).unwrap_or(NULL)
}
