use crate::error::FailureKind;
use crate::flow::{RetryPolicy, RetryStrategy};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Flow template; `definition` holds the JSON flow document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Flow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub flow_type: String,
    pub version: u32,
    pub definition: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_by: String,
}

impl Flow {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        definition: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            flow_type: "transaction".to_string(),
            version: 1,
            definition: definition.into(),
            active: true,
            created_at: now,
            updated_at: now,
            created_by: String::new(),
            updated_by: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Success => "success",
            InstanceStatus::Failed => "failed",
        })
    }
}

/// One transaction, keyed by the caller's idempotency id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: String,
    pub flow_id: String,
    pub status: InstanceStatus,
    /// Full-flow attempt number, bumped by manual retries
    pub attempt: u32,
    /// Global params the transaction was started with
    pub params: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn new(id: impl Into<String>, flow_id: impl Into<String>, params: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            flow_id: flow_id.into(),
            status: InstanceStatus::Pending,
            attempt: 1,
            params,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn transition(&mut self, status: InstanceStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        self.completed_at = match status {
            InstanceStatus::Success => Some(now),
            _ => None,
        };
    }

    /// Task row id for a node of the current attempt
    pub fn task_id(&self, node_id: &str) -> String {
        if self.attempt <= 1 {
            format!("{}_{}", self.id, node_id)
        } else {
            format!("{}_{}_a{}", self.id, node_id, self.attempt)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
}

/// One execution attempt of one flow node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub group_id: String,
    pub node_id: String,
    /// Task definition name
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retry: u32,
    pub config: serde_json::Value,
    pub input: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// New row in `running` state
    pub fn running(
        id: impl Into<String>,
        group_id: impl Into<String>,
        node_id: impl Into<String>,
        name: impl Into<String>,
        task_type: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            group_id: group_id.into(),
            node_id: node_id.into(),
            name: name.into(),
            description: String::new(),
            task_type: task_type.into(),
            status: TaskStatus::Running,
            retry_count: 0,
            max_retry: RetryPolicy::default().max_attempts,
            config: serde_json::Value::Null,
            input: None,
            error_message: None,
            created_at: now,
            started_at: Some(now),
            completed_at: None,
        }
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error_message = Some(message.into());
    }

    pub fn succeed(&mut self) {
        self.status = TaskStatus::Success;
        self.completed_at = Some(Utc::now());
    }
}

/// Durable record of one task failure and its retry bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExceptionRecord {
    /// Assigned by the store on create
    pub id: i64,
    pub group_id: String,
    pub group_name: String,
    pub task_id: String,
    pub task_name: String,
    pub error_kind: FailureKind,
    pub error_message: String,
    pub retry_strategy: RetryStrategy,
    pub retry_times: u32,
    pub retry_max: u32,
    pub retry_interval: u64,
    pub retry_next_at: Option<DateTime<Utc>>,
    pub handled: bool,
    pub handled_by: Option<String>,
    pub handled_at: Option<DateTime<Utc>>,
    pub handled_remark: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl ExceptionRecord {
    pub fn new(
        group_id: impl Into<String>,
        task_id: impl Into<String>,
        task_name: impl Into<String>,
        error_kind: FailureKind,
        error_message: impl Into<String>,
        policy: &RetryPolicy,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            group_id: group_id.into(),
            group_name: String::new(),
            task_id: task_id.into(),
            task_name: task_name.into(),
            error_kind,
            error_message: error_message.into(),
            retry_strategy: policy.strategy,
            retry_times: 0,
            retry_max: policy.max_attempts,
            retry_interval: policy.interval_secs,
            retry_next_at: Some(after_secs(now, policy.interval_secs)),
            handled: false,
            handled_by: None,
            handled_at: None,
            handled_remark: None,
            occurred_at: now,
        }
    }

    pub fn with_group_name(mut self, name: impl Into<String>) -> Self {
        self.group_name = name.into();
        self
    }

    /// Eligible for the automatic retry scan at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.retry_strategy == RetryStrategy::Auto
            && !self.handled
            && self.retry_times < self.retry_max
            && self.retry_next_at.map_or(true, |at| at <= now)
    }

    pub fn next_retry_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        after_secs(now, self.retry_interval)
    }
}

/// `now + secs`, saturating at the latest representable instant
fn after_secs(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogAction {
    Start,
    Success,
    Failed,
    Retry,
}

/// Append-only audit entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionLog {
    pub id: i64,
    pub task_id: String,
    pub group_id: String,
    pub action: LogAction,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionLog {
    pub fn new(
        task_id: impl Into<String>,
        group_id: impl Into<String>,
        action: LogAction,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            task_id: task_id.into(),
            group_id: group_id.into(),
            action,
            message: message.into(),
            details: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_stay_unique_across_attempts() {
        let mut instance = Instance::new("order-1", "flow-1", serde_json::json!({}));
        assert_eq!(instance.task_id("t1"), "order-1_t1");
        instance.attempt = 2;
        assert_eq!(instance.task_id("t1"), "order-1_t1_a2");
    }

    #[test]
    fn only_success_stamps_completion() {
        let mut instance = Instance::new("order-1", "flow-1", serde_json::json!({}));
        instance.transition(InstanceStatus::Running);
        assert!(instance.completed_at.is_none());
        instance.transition(InstanceStatus::Success);
        assert!(instance.completed_at.is_some());
        instance.transition(InstanceStatus::Failed);
        assert!(instance.completed_at.is_none());
    }

    #[test]
    fn due_check_follows_scan_rules() {
        let policy = RetryPolicy { strategy: RetryStrategy::Auto, max_attempts: 3, interval_secs: 60 };
        let mut record = ExceptionRecord::new("g", "g_t1", "deduct", FailureKind::Execution, "boom", &policy);
        let now = Utc::now();

        assert!(!record.is_due(now), "next attempt is a minute away");
        assert!(record.is_due(now + TimeDelta::seconds(61)));

        record.retry_next_at = None;
        assert!(record.is_due(now));

        record.retry_times = 3;
        assert!(!record.is_due(now));

        record.retry_times = 0;
        record.handled = true;
        assert!(!record.is_due(now));

        record.handled = false;
        record.retry_strategy = RetryStrategy::Manual;
        assert!(!record.is_due(now));
    }

    #[test]
    fn huge_retry_interval_saturates_instead_of_overflowing() {
        let policy = RetryPolicy { strategy: RetryStrategy::Auto, max_attempts: 3, interval_secs: u64::MAX };
        let mut record = ExceptionRecord::new("g", "g_t1", "deduct", FailureKind::Execution, "boom", &policy);
        assert_eq!(record.retry_next_at, Some(DateTime::<Utc>::MAX_UTC));

        let now = Utc::now();
        record.retry_interval = 10_000_000_000_000;
        assert_eq!(record.next_retry_after(now), DateTime::<Utc>::MAX_UTC);
        assert!(!record.is_due(now));

        record.retry_interval = 30;
        assert_eq!(record.next_retry_after(now), now + TimeDelta::seconds(30));
    }
}
