//! Transaction flow runtime
//!
//! This crate provides the execution engine that runs flow instances, the
//! task registry and parameter validator it relies on, the background retry
//! scheduler, the transaction service used by the API and CLI, in-memory and
//! SQL stores and process configuration.

pub mod config;
mod engine;
mod factory;
mod graph;
mod registry;
mod retry;
mod service;
mod store;
pub mod validator;

pub use config::{AppConfig, ConfigError};
pub use engine::{derive_input, DependencyMode, EngineConfig, FlowEngine};
pub use factory::{ExecutorFactory, FactoryError};
pub use graph::ExecutionPlan;
pub use registry::TaskRegistry;
pub use retry::{RetryScheduler, SchedulerState, TickReport};
pub use service::{
    paging, NewFlow, PageResult, ServiceError, StartOutcome, TransactionService, TransactionView,
};
pub use store::{Dialect, MemoryStore, SqlStore};
pub use validator::{validate, validate_all, ValidationReport};
