use crate::config::DatabaseConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyQueryResult, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Row};
use txcore::repository::{
    ExceptionRepository, FlowRepository, InstanceRepository, LogRepository, Page, TaskRepository,
};
use txcore::{
    ExceptionRecord, ExecutionLog, Flow, Instance, InstanceStatus, RepositoryError, RetryStrategy,
    Task,
};

type AnyQuery<'q> = Query<'q, Any, AnyArguments<'q>>;

/// SQL flavour of the connected database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
    MySql,
}

impl Dialect {
    pub fn for_url(url: &str) -> Self {
        if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            Dialect::Postgres
        } else if url.starts_with("mysql:") || url.starts_with("mariadb:") {
            Dialect::MySql
        } else {
            Dialect::Sqlite
        }
    }

    /// Rewrite `?` placeholders to `$1, $2, ...` where the database wants them
    fn sql(&self, text: &str) -> String {
        if *self != Dialect::Postgres {
            return text.to_string();
        }
        let mut out = String::with_capacity(text.len() + 8);
        let mut position = 0;
        for c in text.chars() {
            if c == '?' {
                position += 1;
                out.push('$');
                out.push_str(&position.to_string());
            } else {
                out.push(c);
            }
        }
        out
    }

    fn serial_key(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
            Dialect::Postgres => "BIGSERIAL PRIMARY KEY",
            Dialect::MySql => "BIGINT AUTO_INCREMENT PRIMARY KEY",
        }
    }

    /// Whether `INSERT ... RETURNING id` is available
    fn returns_id(&self) -> bool {
        *self != Dialect::MySql
    }

    fn schema(&self) -> Vec<String> {
        let serial = self.serial_key();
        vec![
            format!(
                "CREATE TABLE IF NOT EXISTS flows (
                    seq {serial},
                    id VARCHAR(191) NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL,
                    flow_type TEXT NOT NULL,
                    version BIGINT NOT NULL,
                    definition TEXT NOT NULL,
                    active BIGINT NOT NULL,
                    created_at BIGINT NOT NULL,
                    updated_at BIGINT NOT NULL,
                    created_by TEXT NOT NULL,
                    updated_by TEXT NOT NULL
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS instances (
                    seq {serial},
                    id VARCHAR(191) NOT NULL UNIQUE,
                    flow_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    attempt BIGINT NOT NULL,
                    params TEXT NOT NULL,
                    created_at BIGINT NOT NULL,
                    updated_at BIGINT NOT NULL,
                    completed_at BIGINT
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS tasks (
                    seq {serial},
                    id VARCHAR(191) NOT NULL UNIQUE,
                    group_id VARCHAR(191) NOT NULL,
                    node_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL,
                    task_type TEXT NOT NULL,
                    status TEXT NOT NULL,
                    retry_count BIGINT NOT NULL,
                    max_retry BIGINT NOT NULL,
                    config TEXT NOT NULL,
                    input TEXT,
                    error_message TEXT,
                    created_at BIGINT NOT NULL,
                    started_at BIGINT,
                    completed_at BIGINT
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS exception_records (
                    id {serial},
                    group_id TEXT NOT NULL,
                    group_name TEXT NOT NULL,
                    task_id TEXT NOT NULL,
                    task_name TEXT NOT NULL,
                    error_kind TEXT NOT NULL,
                    error_message TEXT NOT NULL,
                    retry_strategy VARCHAR(32) NOT NULL,
                    retry_times BIGINT NOT NULL,
                    retry_max BIGINT NOT NULL,
                    retry_interval BIGINT NOT NULL,
                    retry_next_at BIGINT,
                    handled BIGINT NOT NULL,
                    handled_by TEXT,
                    handled_at BIGINT,
                    handled_remark TEXT,
                    occurred_at BIGINT NOT NULL
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS execution_logs (
                    id {serial},
                    task_id VARCHAR(191) NOT NULL,
                    group_id VARCHAR(191) NOT NULL,
                    action TEXT NOT NULL,
                    message TEXT NOT NULL,
                    details TEXT,
                    created_at BIGINT NOT NULL
                )"
            ),
        ]
    }
}

/// Store for every repository backed by a sqlx `Any` pool.
///
/// Timestamps are kept as microseconds since the epoch so they order and
/// compare the same way in every backend. Enums are stored by their serde
/// name and JSON payloads as text.
#[derive(Clone)]
pub struct SqlStore {
    pool: AnyPool,
    dialect: Dialect,
}

impl SqlStore {
    /// Wrap an existing pool and create any missing tables
    pub async fn new(pool: AnyPool, dialect: Dialect) -> Result<Self, RepositoryError> {
        let store = Self { pool, dialect };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self, RepositoryError> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| RepositoryError::Backend(format!("Failed to connect to store: {}", e)))?;
        let dialect = Dialect::for_url(&config.url);
        tracing::info!(?dialect, max_connections = config.max_connections, "Store pool ready");
        Self::new(pool, dialect).await
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn migrate(&self) -> Result<(), RepositoryError> {
        for statement in self.dialect.schema() {
            sqlx::query(&statement).execute(&self.pool).await.map_err(backend)?;
        }
        Ok(())
    }

    async fn execute<'q>(&self, query: AnyQuery<'q>) -> Result<AnyQueryResult, RepositoryError> {
        query.execute(&self.pool).await.map_err(backend)
    }

    async fn count(&self, sql: &str) -> Result<usize, RepositoryError> {
        let total: i64 = sqlx::query_scalar(sql).fetch_one(&self.pool).await.map_err(backend)?;
        Ok(usize::try_from(total).unwrap_or_default())
    }

    /// Zero affected rows means either a missing key or, on MySQL, an
    /// update that changed nothing
    async fn require_row(&self, table: &str, id: &str, affected: u64) -> Result<(), RepositoryError> {
        if affected > 0 {
            return Ok(());
        }
        let sql = self.dialect.sql(&format!("SELECT COUNT(*) FROM {} WHERE id = ?", table));
        let found: i64 = sqlx::query_scalar(&sql)
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        if found == 0 {
            let what = table.trim_end_matches('s');
            return Err(RepositoryError::NotFound(format!("{} {}", what, id)));
        }
        Ok(())
    }

    async fn require_record(&self, id: i64, affected: u64) -> Result<(), RepositoryError> {
        if affected > 0 || ExceptionRepository::get(self, id).await?.is_some() {
            return Ok(());
        }
        Err(RepositoryError::NotFound(format!("exception {}", id)))
    }

    /// Run an insert and return the generated `id`
    async fn insert_returning_id(
        &self,
        sql: &str,
        bind: impl for<'q> FnOnce(AnyQuery<'q>) -> AnyQuery<'q>,
    ) -> Result<i64, RepositoryError> {
        if self.dialect.returns_id() {
            let sql = self.dialect.sql(&format!("{} RETURNING id", sql));
            let row = bind(sqlx::query(&sql)).fetch_one(&self.pool).await.map_err(backend)?;
            return row.try_get::<i64, _>(0).map_err(backend);
        }
        let sql = self.dialect.sql(sql);
        let result = self.execute(bind(sqlx::query(&sql))).await?;
        result
            .last_insert_id()
            .ok_or_else(|| RepositoryError::Backend("insert returned no id".to_string()))
    }
}

fn backend(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Backend(e.to_string())
}

fn conflict_or_backend(e: sqlx::Error, what: String) -> RepositoryError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Conflict(format!("{} already exists", what))
        }
        _ => backend(e),
    }
}

fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn instant(micros: i64) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| RepositoryError::Backend(format!("timestamp out of range: {}", micros)))
}

fn label<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(RepositoryError::Backend(format!("not a label: {}", other))),
        Err(e) => Err(RepositoryError::Backend(e.to_string())),
    }
}

fn json_text<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Backend(e.to_string()))
}

fn get<'r, T>(row: &'r AnyRow, column: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, Any> + sqlx::Type<Any>,
{
    row.try_get(column).map_err(backend)
}

fn get_u32(row: &AnyRow, column: &str) -> Result<u32, RepositoryError> {
    let value: i64 = get(row, column)?;
    u32::try_from(value).map_err(|_| RepositoryError::Backend(format!("{} out of range: {}", column, value)))
}

fn get_instant(row: &AnyRow, column: &str) -> Result<DateTime<Utc>, RepositoryError> {
    instant(get(row, column)?)
}

fn get_optional_instant(row: &AnyRow, column: &str) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    get::<Option<i64>>(row, column)?.map(instant).transpose()
}

fn get_label<T: DeserializeOwned>(row: &AnyRow, column: &str) -> Result<T, RepositoryError> {
    let text: String = get(row, column)?;
    serde_json::from_value(serde_json::Value::String(text)).map_err(|e| RepositoryError::Backend(e.to_string()))
}

fn get_json<T: DeserializeOwned>(row: &AnyRow, column: &str) -> Result<T, RepositoryError> {
    let text: String = get(row, column)?;
    serde_json::from_str(&text).map_err(|e| RepositoryError::Backend(e.to_string()))
}

fn get_optional_json(row: &AnyRow, column: &str) -> Result<Option<serde_json::Value>, RepositoryError> {
    get::<Option<String>>(row, column)?
        .map(|text| serde_json::from_str(&text).map_err(|e| RepositoryError::Backend(e.to_string())))
        .transpose()
}

fn flow_from_row(row: &AnyRow) -> Result<Flow, RepositoryError> {
    Ok(Flow {
        id: get(row, "id")?,
        name: get(row, "name")?,
        description: get(row, "description")?,
        flow_type: get(row, "flow_type")?,
        version: get_u32(row, "version")?,
        definition: get(row, "definition")?,
        active: get::<i64>(row, "active")? != 0,
        created_at: get_instant(row, "created_at")?,
        updated_at: get_instant(row, "updated_at")?,
        created_by: get(row, "created_by")?,
        updated_by: get(row, "updated_by")?,
    })
}

fn instance_from_row(row: &AnyRow) -> Result<Instance, RepositoryError> {
    Ok(Instance {
        id: get(row, "id")?,
        flow_id: get(row, "flow_id")?,
        status: get_label(row, "status")?,
        attempt: get_u32(row, "attempt")?,
        params: get_json(row, "params")?,
        created_at: get_instant(row, "created_at")?,
        updated_at: get_instant(row, "updated_at")?,
        completed_at: get_optional_instant(row, "completed_at")?,
    })
}

fn task_from_row(row: &AnyRow) -> Result<Task, RepositoryError> {
    Ok(Task {
        id: get(row, "id")?,
        group_id: get(row, "group_id")?,
        node_id: get(row, "node_id")?,
        name: get(row, "name")?,
        description: get(row, "description")?,
        task_type: get(row, "task_type")?,
        status: get_label(row, "status")?,
        retry_count: get_u32(row, "retry_count")?,
        max_retry: get_u32(row, "max_retry")?,
        config: get_json(row, "config")?,
        input: get_optional_json(row, "input")?,
        error_message: get(row, "error_message")?,
        created_at: get_instant(row, "created_at")?,
        started_at: get_optional_instant(row, "started_at")?,
        completed_at: get_optional_instant(row, "completed_at")?,
    })
}

fn exception_from_row(row: &AnyRow) -> Result<ExceptionRecord, RepositoryError> {
    let interval: i64 = get(row, "retry_interval")?;
    Ok(ExceptionRecord {
        id: get(row, "id")?,
        group_id: get(row, "group_id")?,
        group_name: get(row, "group_name")?,
        task_id: get(row, "task_id")?,
        task_name: get(row, "task_name")?,
        error_kind: get_label(row, "error_kind")?,
        error_message: get(row, "error_message")?,
        retry_strategy: get_label(row, "retry_strategy")?,
        retry_times: get_u32(row, "retry_times")?,
        retry_max: get_u32(row, "retry_max")?,
        retry_interval: u64::try_from(interval).unwrap_or_default(),
        retry_next_at: get_optional_instant(row, "retry_next_at")?,
        handled: get::<i64>(row, "handled")? != 0,
        handled_by: get(row, "handled_by")?,
        handled_at: get_optional_instant(row, "handled_at")?,
        handled_remark: get(row, "handled_remark")?,
        occurred_at: get_instant(row, "occurred_at")?,
    })
}

fn log_from_row(row: &AnyRow) -> Result<ExecutionLog, RepositoryError> {
    Ok(ExecutionLog {
        id: get(row, "id")?,
        task_id: get(row, "task_id")?,
        group_id: get(row, "group_id")?,
        action: get_label(row, "action")?,
        message: get(row, "message")?,
        details: get_optional_json(row, "details")?,
        created_at: get_instant(row, "created_at")?,
    })
}

#[async_trait]
impl FlowRepository for SqlStore {
    async fn create(&self, flow: &Flow) -> Result<(), RepositoryError> {
        let sql = self.dialect.sql(
            "INSERT INTO flows (id, name, description, flow_type, version, definition, active,
                created_at, updated_at, created_by, updated_by)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        );
        sqlx::query(&sql)
            .bind(flow.id.clone())
            .bind(flow.name.clone())
            .bind(flow.description.clone())
            .bind(flow.flow_type.clone())
            .bind(i64::from(flow.version))
            .bind(flow.definition.clone())
            .bind(i64::from(flow.active))
            .bind(micros(flow.created_at))
            .bind(micros(flow.updated_at))
            .bind(flow.created_by.clone())
            .bind(flow.updated_by.clone())
            .execute(&self.pool)
            .await
            .map_err(|e| conflict_or_backend(e, format!("flow {}", flow.id)))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Flow>, RepositoryError> {
        let sql = self.dialect.sql("SELECT * FROM flows WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(flow_from_row).transpose()
    }

    async fn update(&self, flow: &Flow) -> Result<(), RepositoryError> {
        let sql = self.dialect.sql(
            "UPDATE flows SET name = ?, description = ?, flow_type = ?, version = ?, definition = ?,
                active = ?, updated_at = ?, created_by = ?, updated_by = ?
             WHERE id = ?",
        );
        let result = self
            .execute(
                sqlx::query(&sql)
                    .bind(flow.name.clone())
                    .bind(flow.description.clone())
                    .bind(flow.flow_type.clone())
                    .bind(i64::from(flow.version))
                    .bind(flow.definition.clone())
                    .bind(i64::from(flow.active))
                    .bind(micros(flow.updated_at))
                    .bind(flow.created_by.clone())
                    .bind(flow.updated_by.clone())
                    .bind(flow.id.clone()),
            )
            .await?;
        self.require_row("flows", &flow.id, result.rows_affected()).await
    }

    async fn list(&self, offset: usize, limit_rows: usize) -> Result<Page<Flow>, RepositoryError> {
        let sql = self.dialect.sql("SELECT * FROM flows ORDER BY seq LIMIT ? OFFSET ?");
        let rows = sqlx::query(&sql)
            .bind(limit(limit_rows))
            .bind(limit(offset))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        let flows = rows.iter().map(flow_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok((flows, self.count("SELECT COUNT(*) FROM flows").await?))
    }
}

#[async_trait]
impl InstanceRepository for SqlStore {
    async fn create(&self, instance: &Instance) -> Result<(), RepositoryError> {
        let sql = self.dialect.sql(
            "INSERT INTO instances (id, flow_id, status, attempt, params, created_at, updated_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        );
        sqlx::query(&sql)
            .bind(instance.id.clone())
            .bind(instance.flow_id.clone())
            .bind(label(&instance.status)?)
            .bind(i64::from(instance.attempt))
            .bind(json_text(&instance.params)?)
            .bind(micros(instance.created_at))
            .bind(micros(instance.updated_at))
            .bind(instance.completed_at.map(micros))
            .execute(&self.pool)
            .await
            .map_err(|e| conflict_or_backend(e, format!("instance {}", instance.id)))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Instance>, RepositoryError> {
        let sql = self.dialect.sql("SELECT * FROM instances WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(instance_from_row).transpose()
    }

    async fn update(&self, instance: &Instance) -> Result<(), RepositoryError> {
        let sql = self.dialect.sql(
            "UPDATE instances SET flow_id = ?, status = ?, attempt = ?, params = ?, updated_at = ?,
                completed_at = ?
             WHERE id = ?",
        );
        let result = self
            .execute(
                sqlx::query(&sql)
                    .bind(instance.flow_id.clone())
                    .bind(label(&instance.status)?)
                    .bind(i64::from(instance.attempt))
                    .bind(json_text(&instance.params)?)
                    .bind(micros(instance.updated_at))
                    .bind(instance.completed_at.map(micros))
                    .bind(instance.id.clone()),
            )
            .await?;
        self.require_row("instances", &instance.id, result.rows_affected()).await
    }

    async fn transition_if(
        &self,
        id: &str,
        from: InstanceStatus,
        to: InstanceStatus,
    ) -> Result<bool, RepositoryError> {
        let now = Utc::now();
        let completed_at = (to == InstanceStatus::Success).then(|| micros(now));
        let sql = self.dialect.sql(
            "UPDATE instances SET status = ?, updated_at = ?, completed_at = ? WHERE id = ? AND status = ?",
        );
        let result = self
            .execute(
                sqlx::query(&sql)
                    .bind(label(&to)?)
                    .bind(micros(now))
                    .bind(completed_at)
                    .bind(id.to_string())
                    .bind(label(&from)?),
            )
            .await?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match InstanceRepository::get(self, id).await? {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound(format!("instance {}", id))),
        }
    }

    async fn list(&self, offset: usize, limit_rows: usize) -> Result<Page<Instance>, RepositoryError> {
        let sql = self.dialect.sql("SELECT * FROM instances ORDER BY seq DESC LIMIT ? OFFSET ?");
        let rows = sqlx::query(&sql)
            .bind(limit(limit_rows))
            .bind(limit(offset))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        let instances = rows.iter().map(instance_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok((instances, self.count("SELECT COUNT(*) FROM instances").await?))
    }
}

#[async_trait]
impl TaskRepository for SqlStore {
    async fn create(&self, task: &Task) -> Result<(), RepositoryError> {
        let sql = self.dialect.sql(
            "INSERT INTO tasks (id, group_id, node_id, name, description, task_type, status,
                retry_count, max_retry, config, input, error_message, created_at, started_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        );
        let input = task.input.as_ref().map(json_text).transpose()?;
        sqlx::query(&sql)
            .bind(task.id.clone())
            .bind(task.group_id.clone())
            .bind(task.node_id.clone())
            .bind(task.name.clone())
            .bind(task.description.clone())
            .bind(task.task_type.clone())
            .bind(label(&task.status)?)
            .bind(i64::from(task.retry_count))
            .bind(i64::from(task.max_retry))
            .bind(json_text(&task.config)?)
            .bind(input)
            .bind(task.error_message.clone())
            .bind(micros(task.created_at))
            .bind(task.started_at.map(micros))
            .bind(task.completed_at.map(micros))
            .execute(&self.pool)
            .await
            .map_err(|e| conflict_or_backend(e, format!("task {}", task.id)))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, RepositoryError> {
        let sql = self.dialect.sql("SELECT * FROM tasks WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn update(&self, task: &Task) -> Result<(), RepositoryError> {
        let sql = self.dialect.sql(
            "UPDATE tasks SET status = ?, retry_count = ?, max_retry = ?, config = ?, input = ?,
                error_message = ?, started_at = ?, completed_at = ?
             WHERE id = ?",
        );
        let input = task.input.as_ref().map(json_text).transpose()?;
        let result = self
            .execute(
                sqlx::query(&sql)
                    .bind(label(&task.status)?)
                    .bind(i64::from(task.retry_count))
                    .bind(i64::from(task.max_retry))
                    .bind(json_text(&task.config)?)
                    .bind(input)
                    .bind(task.error_message.clone())
                    .bind(task.started_at.map(micros))
                    .bind(task.completed_at.map(micros))
                    .bind(task.id.clone()),
            )
            .await?;
        self.require_row("tasks", &task.id, result.rows_affected()).await
    }

    async fn list(&self, offset: usize, limit_rows: usize) -> Result<Page<Task>, RepositoryError> {
        let sql = self.dialect.sql("SELECT * FROM tasks ORDER BY seq LIMIT ? OFFSET ?");
        let rows = sqlx::query(&sql)
            .bind(limit(limit_rows))
            .bind(limit(offset))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        let tasks = rows.iter().map(task_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok((tasks, self.count("SELECT COUNT(*) FROM tasks").await?))
    }

    async fn list_by_group(&self, group_id: &str) -> Result<Vec<Task>, RepositoryError> {
        let sql = self.dialect.sql("SELECT * FROM tasks WHERE group_id = ? ORDER BY seq");
        let rows = sqlx::query(&sql)
            .bind(group_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(task_from_row).collect()
    }
}

#[async_trait]
impl ExceptionRepository for SqlStore {
    async fn create(&self, record: &ExceptionRecord) -> Result<i64, RepositoryError> {
        let error_kind = label(&record.error_kind)?;
        let strategy = label(&record.retry_strategy)?;
        let interval = i64::try_from(record.retry_interval).unwrap_or(i64::MAX);
        self.insert_returning_id(
            "INSERT INTO exception_records (group_id, group_name, task_id, task_name, error_kind,
                error_message, retry_strategy, retry_times, retry_max, retry_interval, retry_next_at,
                handled, handled_by, handled_at, handled_remark, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            |query| {
                query
                    .bind(record.group_id.clone())
                    .bind(record.group_name.clone())
                    .bind(record.task_id.clone())
                    .bind(record.task_name.clone())
                    .bind(error_kind)
                    .bind(record.error_message.clone())
                    .bind(strategy)
                    .bind(i64::from(record.retry_times))
                    .bind(i64::from(record.retry_max))
                    .bind(interval)
                    .bind(record.retry_next_at.map(micros))
                    .bind(i64::from(record.handled))
                    .bind(record.handled_by.clone())
                    .bind(record.handled_at.map(micros))
                    .bind(record.handled_remark.clone())
                    .bind(micros(record.occurred_at))
            },
        )
        .await
    }

    async fn get(&self, id: i64) -> Result<Option<ExceptionRecord>, RepositoryError> {
        let sql = self.dialect.sql("SELECT * FROM exception_records WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(exception_from_row).transpose()
    }

    async fn update(&self, record: &ExceptionRecord) -> Result<(), RepositoryError> {
        let sql = self.dialect.sql(
            "UPDATE exception_records SET retry_strategy = ?, retry_times = ?, retry_max = ?,
                retry_interval = ?, retry_next_at = ?, handled = ?, handled_by = ?, handled_at = ?,
                handled_remark = ?
             WHERE id = ?",
        );
        let result = self
            .execute(
                sqlx::query(&sql)
                    .bind(label(&record.retry_strategy)?)
                    .bind(i64::from(record.retry_times))
                    .bind(i64::from(record.retry_max))
                    .bind(i64::try_from(record.retry_interval).unwrap_or(i64::MAX))
                    .bind(record.retry_next_at.map(micros))
                    .bind(i64::from(record.handled))
                    .bind(record.handled_by.clone())
                    .bind(record.handled_at.map(micros))
                    .bind(record.handled_remark.clone())
                    .bind(record.id),
            )
            .await?;
        self.require_record(record.id, result.rows_affected()).await
    }

    async fn list(
        &self,
        offset: usize,
        limit_rows: usize,
        handled: Option<bool>,
    ) -> Result<Page<ExceptionRecord>, RepositoryError> {
        let filter = match handled {
            Some(true) => " WHERE handled = 1",
            Some(false) => " WHERE handled = 0",
            None => "",
        };
        let sql = self.dialect.sql(&format!(
            "SELECT * FROM exception_records{} ORDER BY id DESC LIMIT ? OFFSET ?",
            filter
        ));
        let rows = sqlx::query(&sql)
            .bind(limit(limit_rows))
            .bind(limit(offset))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        let records = rows.iter().map(exception_from_row).collect::<Result<Vec<_>, _>>()?;
        let total = self
            .count(&format!("SELECT COUNT(*) FROM exception_records{}", filter))
            .await?;
        Ok((records, total))
    }

    async fn get_pending_retry(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExceptionRecord>, RepositoryError> {
        let sql = self.dialect.sql(
            "SELECT * FROM exception_records
             WHERE retry_strategy = ? AND handled = 0 AND retry_times < retry_max
                AND (retry_next_at IS NULL OR retry_next_at <= ?)
             ORDER BY CASE WHEN retry_next_at IS NULL THEN 0 ELSE 1 END, retry_next_at, id",
        );
        let rows = sqlx::query(&sql)
            .bind(label(&RetryStrategy::Auto)?)
            .bind(micros(now))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(exception_from_row).collect()
    }

    async fn increment_retry(&self, id: i64, now: DateTime<Utc>) -> Result<(), RepositoryError> {
        let record = ExceptionRepository::get(self, id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("exception {}", id)))?;
        let sql = self.dialect.sql(
            "UPDATE exception_records SET retry_times = retry_times + 1, retry_next_at = ? WHERE id = ?",
        );
        self.execute(
            sqlx::query(&sql)
                .bind(micros(record.next_retry_after(now)))
                .bind(id),
        )
        .await?;
        Ok(())
    }

    async fn mark_retry_complete(&self, id: i64) -> Result<(), RepositoryError> {
        let sql = self.dialect.sql("UPDATE exception_records SET retry_times = retry_max WHERE id = ?");
        let result = self.execute(sqlx::query(&sql).bind(id)).await?;
        self.require_record(id, result.rows_affected()).await
    }
}

#[async_trait]
impl LogRepository for SqlStore {
    async fn create(&self, log: &ExecutionLog) -> Result<i64, RepositoryError> {
        let action = label(&log.action)?;
        let details = log.details.as_ref().map(json_text).transpose()?;
        self.insert_returning_id(
            "INSERT INTO execution_logs (task_id, group_id, action, message, details, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            |query| {
                query
                    .bind(log.task_id.clone())
                    .bind(log.group_id.clone())
                    .bind(action)
                    .bind(log.message.clone())
                    .bind(details)
                    .bind(micros(log.created_at))
            },
        )
        .await
    }

    async fn list_by_task(&self, task_id: &str) -> Result<Vec<ExecutionLog>, RepositoryError> {
        let sql = self.dialect.sql("SELECT * FROM execution_logs WHERE task_id = ? ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(task_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(log_from_row).collect()
    }

    async fn list_by_group(&self, group_id: &str) -> Result<Vec<ExecutionLog>, RepositoryError> {
        let sql = self.dialect.sql("SELECT * FROM execution_logs WHERE group_id = ? ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(group_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(log_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_follows_url_scheme() {
        assert_eq!(Dialect::for_url("postgres://localhost/tx"), Dialect::Postgres);
        assert_eq!(Dialect::for_url("mysql://localhost/tx"), Dialect::MySql);
        assert_eq!(Dialect::for_url("sqlite::memory:"), Dialect::Sqlite);
    }

    #[test]
    fn postgres_placeholders_are_numbered() {
        let sql = "UPDATE t SET a = ? WHERE id = ? AND b = ?";
        assert_eq!(Dialect::Sqlite.sql(sql), sql);
        assert_eq!(
            Dialect::Postgres.sql(sql),
            "UPDATE t SET a = $1 WHERE id = $2 AND b = $3"
        );
    }

    #[test]
    fn labels_use_serde_names() {
        assert_eq!(label(&RetryStrategy::NoRetry).unwrap(), "no_retry");
        assert_eq!(label(&InstanceStatus::Failed).unwrap(), "failed");
    }
}
