use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use txcore::{DefinitionError, TaskExecutor};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FactoryError {
    #[error("Unsupported task type: {0}")]
    UnsupportedType(String),
}

impl From<FactoryError> for DefinitionError {
    fn from(err: FactoryError) -> Self {
        match err {
            FactoryError::UnsupportedType(t) => DefinitionError::UnsupportedType(t),
        }
    }
}

/// Resolves a task type to its executor.
///
/// Executors are registered once at startup and handed out as shared
/// handles, so backends that hold a connection (the message publisher, the
/// database pool) are constructed exactly once.
#[derive(Clone, Default)]
pub struct ExecutorFactory {
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
}

impl ExecutorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under its own task type
    pub fn register(&mut self, executor: Arc<dyn TaskExecutor>) {
        let task_type = executor.task_type().to_string();
        tracing::info!("Registering executor type: {}", task_type);
        self.executors.insert(task_type, executor);
    }

    pub fn create(&self, task_type: &str) -> Result<Arc<dyn TaskExecutor>, FactoryError> {
        self.executors
            .get(task_type)
            .cloned()
            .ok_or_else(|| FactoryError::UnsupportedType(task_type.to_string()))
    }

    /// Registered task types, sorted
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use txcore::{ConfigMap, ExecContext, ExecutorError, Params};

    struct Noop;

    #[async_trait]
    impl TaskExecutor for Noop {
        fn task_type(&self) -> &str {
            "noop"
        }

        async fn execute(&self, _: &ExecContext, _: &ConfigMap, _: &Params) -> Result<(), ExecutorError> {
            Ok(())
        }
    }

    #[test]
    fn resolves_registered_type_and_shares_instance() {
        let mut factory = ExecutorFactory::new();
        factory.register(Arc::new(Noop));

        let a = factory.create("noop").unwrap();
        let b = factory.create("noop").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.task_types(), vec!["noop".to_string()]);
    }

    #[test]
    fn unknown_type_is_unsupported() {
        let factory = ExecutorFactory::new();
        let err = factory.create("ftp").err().unwrap();
        assert_eq!(err, FactoryError::UnsupportedType("ftp".to_string()));
        assert_eq!(DefinitionError::from(err), DefinitionError::UnsupportedType("ftp".to_string()));
    }
}
