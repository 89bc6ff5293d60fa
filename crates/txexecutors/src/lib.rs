//! Standard executor library
//!
//! Backends for the built-in task types: `rpc`, `http`, `mq` and `db`.

mod db;
mod http;
mod mq;
mod rpc;

pub use db::{DbExecutor, Placeholder};
pub use http::HttpExecutor;
pub use mq::{IggyPublisher, MessagePublisher, MqExecutor};
pub use rpc::RpcExecutor;

use std::sync::Arc;
use txcore::ExecutorError;
use txruntime::{AppConfig, ExecutorFactory};

/// Long-lived connections shared by every flow
#[derive(Default)]
pub struct Backends {
    pub publisher: Option<Arc<dyn MessagePublisher>>,
    pub database: Option<Arc<DbExecutor>>,
}

impl Backends {
    /// Open the broker and database connections the config asks for
    pub async fn connect(config: &AppConfig) -> Result<Self, ExecutorError> {
        let mut backends = Backends::default();
        if let Some(broker) = &config.broker {
            backends.publisher = Some(Arc::new(IggyPublisher::connect(broker).await?));
        }
        if let Some(database) = &config.database {
            backends.database = Some(Arc::new(DbExecutor::connect(database).await?));
        }
        Ok(backends)
    }
}

/// Register every executor with a factory; `mq` and `db` only when their
/// backend is available
pub fn register_all(factory: &mut ExecutorFactory, backends: Backends) -> Result<(), ExecutorError> {
    factory.register(Arc::new(RpcExecutor::new()?));
    factory.register(Arc::new(HttpExecutor::new()?));
    match backends.publisher {
        Some(publisher) => factory.register(Arc::new(MqExecutor::new(publisher))),
        None => tracing::warn!("No broker configured, mq tasks are unsupported"),
    }
    match backends.database {
        Some(database) => factory.register(database),
        None => tracing::warn!("No database configured, db tasks are unsupported"),
    }
    Ok(())
}
