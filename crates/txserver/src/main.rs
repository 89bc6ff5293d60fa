mod api;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use txcore::Repositories;
use txexecutors::Backends;
use txruntime::config::LogConfig;
use txruntime::{
    AppConfig, ExecutorFactory, FlowEngine, MemoryStore, RetryScheduler, SqlStore, TransactionService,
};

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if log.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// SQL store when `[store]` is configured, otherwise in-memory
async fn open_repositories(config: &AppConfig) -> anyhow::Result<Repositories> {
    match &config.store {
        Some(store) => {
            let store = SqlStore::connect(store).await?;
            info!(dialect = ?store.dialect(), "💾 Using SQL store");
            Ok(Repositories::from_store(Arc::new(store)))
        }
        None => {
            info!("💾 Using in-memory store; state is lost on restart");
            Ok(Repositories::from_store(Arc::new(MemoryStore::new())))
        }
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing(&config.log);

    info!("🚀 Starting txflow server");

    let repos = open_repositories(&config).await?;
    let registry = Arc::new(config.registry());

    let mut factory = ExecutorFactory::new();
    txexecutors::register_all(&mut factory, Backends::connect(&config).await?)?;
    info!(
        tasks = registry.len(),
        executors = ?factory.task_types(),
        "✅ Registry and executors initialized"
    );

    let engine = FlowEngine::new(repos.clone(), registry, Arc::new(factory), config.engine_config());
    let scheduler = Arc::new(RetryScheduler::new(
        repos.clone(),
        engine.clone(),
        config.scan_interval(),
    ));
    scheduler.start().await;

    let service = Arc::new(TransactionService::new(repos, engine));
    let app_state = web::Data::new(api::AppState {
        service: service.clone(),
    });

    let bind_address = config.bind_address();
    info!("🌐 Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .configure(api::configure)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    info!("Server stopped, draining background work");
    scheduler.stop().await;
    service.shutdown().await;

    Ok(())
}
