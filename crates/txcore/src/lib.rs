//! Core abstractions for transaction flows
//!
//! This crate provides the domain types and traits that all other
//! components depend on: dynamic values, errors, the persisted data model,
//! flow and task definitions, the executor trait and the storage interface.
//! It has no runtime behaviour of its own.

mod error;
pub mod executor;
mod flow;
mod model;
pub mod repository;
mod task;
mod value;

pub use error::{
    DefinitionError, ErrorClass, ExecutorError, FailureKind, FlowError, RepositoryError,
    TaskError, TaskFailure, ValidationError,
};
pub use executor::{ExecContext, TaskExecutor};
pub use flow::{
    FlowDefinition, FlowTask, RetryOverride, RetryPolicy, RetryStrategy, MAX_RETRY_INTERVAL_SECS,
};
pub use model::{
    ExceptionRecord, ExecutionLog, Flow, Instance, InstanceStatus, LogAction, Task, TaskStatus,
};
pub use repository::Repositories;
pub use task::{merge_config, ConfigMap, FieldSpec, FieldType, TaskConfig, TaskDefinition};
pub use value::{params_from_json, params_to_json, Params, Value, ValueKind};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
