use crate::task::FieldType;
use crate::value::ValueKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome of a whole-flow execution that did not succeed
#[derive(Error, Debug, Clone)]
pub enum FlowError {
    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("{}", describe_failures(.0))]
    TasksFailed(Vec<TaskFailure>),

    #[error("Execution error: {0}")]
    Execution(String),
}

impl FlowError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FlowError::Definition(_) => ErrorClass::BadRequest,
            FlowError::Repository(e) => e.class(),
            FlowError::TasksFailed(_) | FlowError::Execution(_) => ErrorClass::Internal,
        }
    }

    /// Failures collected from the node join, empty for whole-flow errors
    pub fn failures(&self) -> &[TaskFailure] {
        match self {
            FlowError::TasksFailed(failures) => failures,
            _ => &[],
        }
    }
}

fn describe_failures(failures: &[TaskFailure]) -> String {
    let details: Vec<String> = failures
        .iter()
        .map(|f| format!("{} ({}): {}", f.node_id, f.task_name, f.error))
        .collect();
    format!("{} task(s) failed: {}", failures.len(), details.join("; "))
}

/// One failed node of a flow run
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub node_id: String,
    pub task_name: String,
    pub error: TaskError,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DefinitionError {
    #[error("Malformed flow definition: {0}")]
    Malformed(String),

    #[error("Task definition not found: {0}")]
    UnknownTask(String),

    #[error("Unsupported task type: {0}")]
    UnsupportedType(String),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    #[error("Cyclic dependency detected")]
    CyclicDependency,

    #[error("Node '{node}' retry interval of {interval}s is too long")]
    RetryInterval { node: String, interval: u64 },
}

/// A field that could not be coerced to its declared type
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Invalid value for '{field}': {reason} (expected {expected}, got {})", observed(.actual))]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
    /// `None` when the field was absent altogether
    pub actual: Option<ValueKind>,
    pub expected: FieldType,
}

fn observed(kind: &Option<ValueKind>) -> String {
    match kind {
        Some(kind) => kind.to_string(),
        None => "nothing".to_string(),
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutorError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Statement failed: {0}")]
    Statement(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("Aborted: {0}")]
    Aborted(String),
}

/// Failure of a single node attempt
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl TaskError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TaskError::Definition(_) => FailureKind::Definition,
            TaskError::Validation(_) => FailureKind::Validation,
            TaskError::Executor(ExecutorError::Configuration(_)) => FailureKind::Configuration,
            TaskError::Executor(_) => FailureKind::Execution,
            TaskError::Repository(_) => FailureKind::Repository,
        }
    }
}

/// Classification stored on exception records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Definition,
    Validation,
    Execution,
    Configuration,
    Repository,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepositoryError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Backend(String),
}

impl RepositoryError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RepositoryError::NotFound(_) => ErrorClass::NotFound,
            RepositoryError::Conflict(_) => ErrorClass::BadRequest,
            RepositoryError::Backend(_) => ErrorClass::Internal,
        }
    }
}

/// Caller-facing bucket an error falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NotFound,
    BadRequest,
    Internal,
}
