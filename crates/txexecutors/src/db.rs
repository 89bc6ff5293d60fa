use async_trait::async_trait;
use serde_json::Value as Json;
use sqlx::any::{AnyArguments, AnyPoolOptions};
use sqlx::query::Query;
use sqlx::{Any, AnyPool};
use txcore::executor::require_str;
use txcore::{ConfigMap, ExecContext, ExecutorError, Params, TaskExecutor};
use txruntime::config::DatabaseConfig;

/// Bind-parameter syntax of the target database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// `?` (sqlite, mysql)
    Question,
    /// `$1, $2, ...` (postgres)
    Numbered,
}

impl Placeholder {
    pub fn for_url(url: &str) -> Self {
        if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            Placeholder::Numbered
        } else {
            Placeholder::Question
        }
    }

    fn render(&self, position: usize) -> String {
        match self {
            Placeholder::Question => "?".to_string(),
            Placeholder::Numbered => format!("${}", position),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    fn parse(name: &str) -> Result<Self, ExecutorError> {
        match name.to_ascii_lowercase().as_str() {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            _ => Err(ExecutorError::Configuration(format!("Unsupported db operation: {}", name))),
        }
    }
}

/// SQL text plus the values to bind, in placeholder order
#[derive(Debug, PartialEq)]
struct Statement {
    sql: String,
    values: Vec<Json>,
}

/// Plain identifier, optionally schema-qualified when `qualified` is set
fn check_identifier(name: &str, qualified: bool) -> Result<(), ExecutorError> {
    let plain = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    let valid = match name.split_once('.') {
        Some((schema, table)) if qualified => plain(schema) && plain(table),
        Some(_) => false,
        None => plain(name),
    };
    if valid {
        Ok(())
    } else {
        Err(ExecutorError::Configuration(format!("Invalid identifier: {}", name)))
    }
}

fn object<'a>(config: &'a ConfigMap, key: &str) -> Result<Option<&'a serde_json::Map<String, Json>>, ExecutorError> {
    match config.get(key) {
        None | Some(Json::Null) => Ok(None),
        Some(Json::Object(map)) => Ok(Some(map)),
        Some(_) => Err(ExecutorError::Configuration(format!("{} must be an object", key))),
    }
}

fn build_statement(config: &ConfigMap, placeholder: Placeholder) -> Result<Statement, ExecutorError> {
    let operation = Operation::parse(require_str(config, "operation")?)?;
    let table = require_str(config, "table")?;
    check_identifier(table, true)?;

    let data = object(config, "data")?.filter(|m| !m.is_empty());
    let filter = object(config, "where")?.filter(|m| !m.is_empty());

    let mut values = Vec::new();
    let mut bind = |value: &Json| {
        values.push(value.clone());
        placeholder.render(values.len())
    };

    let sql = match operation {
        Operation::Insert => {
            let data = data.ok_or_else(|| ExecutorError::Configuration("insert data is required".to_string()))?;
            let mut columns = Vec::new();
            let mut slots = Vec::new();
            for (column, value) in data {
                check_identifier(column, false)?;
                columns.push(column.as_str());
                slots.push(bind(value));
            }
            format!("INSERT INTO {} ({}) VALUES ({})", table, columns.join(", "), slots.join(", "))
        }
        Operation::Update => {
            let data = data.ok_or_else(|| ExecutorError::Configuration("update data is required".to_string()))?;
            let mut sets = Vec::new();
            for (column, value) in data {
                check_identifier(column, false)?;
                sets.push(format!("{} = {}", column, bind(value)));
            }
            let mut sql = format!("UPDATE {} SET {}", table, sets.join(", "));
            if let Some(filter) = filter {
                sql.push_str(" WHERE ");
                sql.push_str(&conditions(filter, &mut bind)?);
            }
            sql
        }
        Operation::Delete => {
            let filter = filter
                .ok_or_else(|| ExecutorError::Configuration("delete where condition is required".to_string()))?;
            format!("DELETE FROM {} WHERE {}", table, conditions(filter, &mut bind)?)
        }
    };

    Ok(Statement { sql, values })
}

fn conditions(
    filter: &serde_json::Map<String, Json>,
    bind: &mut impl FnMut(&Json) -> String,
) -> Result<String, ExecutorError> {
    let mut clauses = Vec::new();
    for (column, value) in filter {
        check_identifier(column, false)?;
        clauses.push(format!("{} = {}", column, bind(value)));
    }
    Ok(clauses.join(" AND "))
}

fn bind_json<'q>(query: Query<'q, Any, AnyArguments<'q>>, value: &Json) -> Query<'q, Any, AnyArguments<'q>> {
    match value {
        Json::Null => query.bind(Option::<String>::None),
        Json::Bool(b) => query.bind(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or_default()),
        },
        Json::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

/// Parameterized INSERT/UPDATE/DELETE against a configured table
pub struct DbExecutor {
    pool: AnyPool,
    placeholder: Placeholder,
}

impl DbExecutor {
    pub fn new(pool: AnyPool, placeholder: Placeholder) -> Self {
        Self { pool, placeholder }
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self, ExecutorError> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| ExecutorError::Configuration(format!("Failed to connect to database: {}", e)))?;
        tracing::info!(max_connections = config.max_connections, "Database pool ready");
        Ok(Self::new(pool, Placeholder::for_url(&config.url)))
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }
}

#[async_trait]
impl TaskExecutor for DbExecutor {
    fn task_type(&self) -> &str {
        "db"
    }

    async fn execute(&self, ctx: &ExecContext, config: &ConfigMap, _input: &Params) -> Result<(), ExecutorError> {
        let statement = build_statement(config, self.placeholder)?;
        let table = require_str(config, "table")?;
        tracing::debug!(task_id = %ctx.task_id, sql = %statement.sql, "Executing statement");

        let mut query = sqlx::query(&statement.sql);
        for value in &statement.values {
            query = bind_json(query, value);
        }

        let result = ctx
            .guard(async {
                query
                    .execute(&self.pool)
                    .await
                    .map_err(|e| ExecutorError::Statement(e.to_string()))
            })
            .await?;

        tracing::info!(
            task_id = %ctx.task_id,
            table,
            affected = result.rows_affected(),
            "Statement completed"
        );
        Ok(())
    }
}
