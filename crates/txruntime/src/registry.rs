use std::collections::HashMap;
use txcore::{FieldSpec, FieldType, TaskConfig, TaskDefinition};

/// Catalog of task definitions, keyed by task name.
///
/// Built once at startup and shared read-only by the engine, the service
/// and the CLI.
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    definitions: HashMap<String, TaskDefinition>,
}

impl TaskRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            definitions: HashMap::new(),
        }
    }

    /// Registry preloaded with `deduct`, `notify` and `http_request`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for definition in builtin_definitions() {
            registry.register(definition);
        }
        registry
    }

    /// Register a task definition, replacing any existing one with that name
    pub fn register(&mut self, definition: TaskDefinition) {
        tracing::debug!(task_name = %definition.name, task_type = %definition.task_type, "Registering task definition");
        self.definitions.insert(definition.name.clone(), definition);
    }

    /// Look up a definition; `None` is distinct from a found definition with
    /// an empty schema
    pub fn lookup(&self, name: &str) -> Option<&TaskDefinition> {
        self.definitions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    /// All definitions sorted by name
    pub fn list(&self) -> Vec<&TaskDefinition> {
        let mut definitions: Vec<_> = self.definitions.values().collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn builtin_definitions() -> Vec<TaskDefinition> {
    vec![
        TaskDefinition::new("deduct", "rpc")
            .with_description("Deduct the order amount from the user's account")
            .with_field(FieldSpec::required("user_id", FieldType::String))
            .with_field(FieldSpec::required("amount", FieldType::Int))
            .with_field(FieldSpec::required("order_id", FieldType::String))
            .with_config(TaskConfig {
                service: Some("PaymentService".to_string()),
                method: Some("deduct".to_string()),
                ..Default::default()
            }),
        TaskDefinition::new("notify", "mq")
            .with_description("Publish the payment completed notification")
            .with_field(FieldSpec::required("user_id", FieldType::String))
            .with_field(FieldSpec::required("order_id", FieldType::String))
            .with_field(FieldSpec::required("status", FieldType::String))
            .with_config(TaskConfig {
                topic: Some("payment.completed".to_string()),
                ..Default::default()
            }),
        TaskDefinition::new("http_request", "http")
            .with_description("Issue an outbound HTTP request")
            .with_field(FieldSpec::optional("body", FieldType::String)),
    ]
}
