use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use txcore::{
    params_from_json, Flow, FlowDefinition, FlowError, FlowTask, Instance, Repositories,
    RetryOverride,
};
use txexecutors::Backends;
use txruntime::{AppConfig, DependencyMode, ExecutorFactory, FlowEngine, MemoryStore, TaskRegistry};

#[derive(Parser)]
#[command(name = "txflow")]
#[command(about = "Transaction flow CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow file in-process
    Run {
        /// Path to flow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Global params as a JSON object
        #[arg(short, long)]
        params: Option<String>,

        /// TOML config (defaults to CONFIG_PATH or configs/app.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a flow file
    Validate {
        /// Path to flow JSON file
        file: PathBuf,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// List task definitions
    Tasks {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Create an example flow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "flow.json")]
        output: PathBuf,
    },
}

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::from_env()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            params,
            config,
            verbose,
        } => {
            let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
            tracing_subscriber::fmt().with_max_level(level).init();

            let config = load_config(config.as_deref())?;
            run_flow(&config, &file, params).await?;
        }

        Commands::Validate { file, config } => {
            let config = load_config(config.as_deref())?;
            validate_flow(&config.registry(), config.engine.dependency_mode, &file)?;
        }

        Commands::Tasks { config } => {
            let config = load_config(config.as_deref())?;
            list_tasks(&config.registry());
        }

        Commands::Init { output } => {
            create_example_flow(&output)?;
        }
    }

    Ok(())
}

/// Parse, plan for `mode` and check every task name against the registry
fn check_document(text: &str, registry: &TaskRegistry, mode: DependencyMode) -> Result<FlowDefinition> {
    let definition = FlowDefinition::parse(text)?;
    mode.plan(&definition)?;
    definition.check_retry_intervals()?;
    for task in &definition.tasks {
        if !registry.contains(&task.task_name) {
            return Err(anyhow!(
                "Node '{}' uses unknown task '{}'",
                task.id,
                task.task_name
            ));
        }
    }
    Ok(definition)
}

fn read_flow(file: &Path) -> Result<String> {
    std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))
}

fn parse_params(params: Option<String>) -> Result<serde_json::Value> {
    let Some(text) = params else {
        return Ok(serde_json::json!({}));
    };
    match serde_json::from_str(&text)? {
        value @ serde_json::Value::Object(_) => Ok(value),
        _ => Err(anyhow!("Params must be a JSON object")),
    }
}

async fn run_flow(config: &AppConfig, file: &Path, params: Option<String>) -> Result<()> {
    println!("🚀 Loading flow from: {}", file.display());

    let registry = config.registry();
    let text = read_flow(file)?;
    let definition = check_document(&text, &registry, config.engine.dependency_mode)?;
    let params = parse_params(params)?;

    println!("📋 Flow: {}", definition.name);
    println!("   Tasks: {}", definition.tasks.len());
    println!();

    let repos = Repositories::from_store(Arc::new(MemoryStore::new()));
    let mut factory = ExecutorFactory::new();
    txexecutors::register_all(&mut factory, Backends::connect(config).await?)?;
    let engine = FlowEngine::new(
        repos.clone(),
        Arc::new(registry),
        Arc::new(factory),
        config.engine_config(),
    );

    let flow = Flow::new(uuid::Uuid::new_v4().to_string(), definition.name.clone(), text);
    repos.flows.create(&flow).await?;
    let instance_id = format!("cli-{}", uuid::Uuid::new_v4().simple());
    let mut instance = Instance::new(instance_id, &flow.id, params.clone());
    repos.instances.create(&instance).await?;

    let global = match params {
        serde_json::Value::Object(map) => params_from_json(map),
        _ => Default::default(),
    };
    let result = engine
        .execute(&CancellationToken::new(), &mut instance, &flow, &global)
        .await;

    println!("📊 Execution Summary:");
    println!("   Instance: {}", instance.id);
    println!("   Status: {}", instance.status);
    for task in repos.tasks.list_by_group(&instance.id).await? {
        match &task.error_message {
            Some(error) => println!("  ❌ {} ({}) {:?}: {}", task.node_id, task.name, task.status, error),
            None => println!("  ✅ {} ({}) {:?}", task.node_id, task.name, task.status),
        }
    }

    let (exceptions, _) = repos.exceptions.list(0, usize::MAX, None).await?;
    if !exceptions.is_empty() {
        println!();
        println!("⚠️  Exceptions:");
        for record in exceptions {
            println!(
                "   #{} {} [{:?}] retry={} max={}: {}",
                record.id,
                record.task_id,
                record.error_kind,
                record.retry_strategy,
                record.retry_max,
                record.error_message
            );
        }
    }

    match result {
        Ok(()) => {
            println!();
            println!("✨ Flow completed successfully");
            Ok(())
        }
        Err(FlowError::TasksFailed(failures)) => Err(anyhow!("💥 {} task(s) failed", failures.len())),
        Err(e) => Err(e.into()),
    }
}

fn validate_flow(registry: &TaskRegistry, mode: DependencyMode, file: &Path) -> Result<()> {
    println!("🔍 Validating flow: {}", file.display());

    let definition = check_document(&read_flow(file)?, registry, mode)?;

    println!("✅ Flow is valid:");
    println!("   Name: {}", definition.name);
    println!("   Tasks: {}", definition.tasks.len());
    Ok(())
}

fn list_tasks(registry: &TaskRegistry) {
    println!("📦 Available Tasks:");
    println!();

    for definition in registry.list() {
        println!("  • {} ({})", definition.name, definition.task_type);
        if !definition.description.is_empty() {
            println!("    {}", definition.description);
        }
        for field in &definition.input_fields {
            let marker = if field.required { "required" } else { "optional" };
            println!("    - {}: {} ({})", field.name, field.field_type, marker);
        }
    }
}

fn example_flow() -> FlowDefinition {
    let mut definition = FlowDefinition::new("payment");
    definition.description = "Deduct the order amount, then announce the payment".to_string();
    definition
        .add_task(FlowTask::new("t1", "deduct").with_description("Charge the user"))
        .add_task(
            FlowTask::new("t2", "notify")
                .with_description("Publish payment.completed")
                .depends_on("t1")
                .with_retry(RetryOverride::auto(3, 30)),
        );
    definition
}

fn create_example_flow(output: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&example_flow())?;
    std::fs::write(output, json)?;

    println!("✨ Created example flow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  txflow run --file {} --params '{{\"deduct\": {{\"user_id\": \"u1\", \"amount\": 100, \"order_id\": \"o1\"}}, \"notify\": {{\"user_id\": \"u1\", \"order_id\": \"o1\", \"status\": \"paid\"}}}}'",
        output.display()
    );
    Ok(())
}
