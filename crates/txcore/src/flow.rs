use crate::task::ConfigMap;
use crate::DefinitionError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Parsed form of a flow's `definition` document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tasks: Vec<FlowTask>,
}

impl FlowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            tasks: Vec::new(),
        }
    }

    pub fn parse(document: &str) -> Result<Self, DefinitionError> {
        serde_json::from_str(document).map_err(|e| DefinitionError::Malformed(e.to_string()))
    }

    pub fn to_document(&self) -> Result<String, DefinitionError> {
        serde_json::to_string(self).map_err(|e| DefinitionError::Malformed(e.to_string()))
    }

    pub fn add_task(&mut self, task: FlowTask) -> &mut Self {
        self.tasks.push(task);
        self
    }

    pub fn find_task(&self, id: &str) -> Option<&FlowTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Reject retry intervals beyond [`MAX_RETRY_INTERVAL_SECS`]
    pub fn check_retry_intervals(&self) -> Result<(), DefinitionError> {
        for task in &self.tasks {
            if let Some(interval) = task.retry.as_ref().and_then(|r| r.interval) {
                if interval > MAX_RETRY_INTERVAL_SECS {
                    return Err(DefinitionError::RetryInterval {
                        node: task.id.clone(),
                        interval,
                    });
                }
            }
        }
        Ok(())
    }
}

/// One node of a flow definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowTask {
    pub id: String,
    pub task_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ConfigMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryOverride>,
}

impl FlowTask {
    pub fn new(id: impl Into<String>, task_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_name: task_name.into(),
            description: String::new(),
            depends_on: Vec::new(),
            config: None,
            retry: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn depends_on(mut self, node_id: impl Into<String>) -> Self {
        self.depends_on.push(node_id.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.config
            .get_or_insert_with(ConfigMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryOverride) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Node-level override if present, else the supplied defaults
    pub fn retry_policy(&self, defaults: &RetryPolicy) -> RetryPolicy {
        match &self.retry {
            Some(retry) => retry.resolve(defaults),
            None => defaults.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Manual,
    Auto,
    NoRetry,
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RetryStrategy::Manual => "manual",
            RetryStrategy::Auto => "auto",
            RetryStrategy::NoRetry => "no_retry",
        })
    }
}

/// Longest retry interval a flow may declare, in seconds (one year)
pub const MAX_RETRY_INTERVAL_SECS: u64 = 366 * 24 * 60 * 60;

/// Effective retry policy snapshotted onto exception records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub strategy: RetryStrategy,
    pub max_attempts: u32,
    pub interval_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Manual,
            max_attempts: 3,
            interval_secs: 60,
        }
    }
}

/// Retry block of a flow node; zero or missing values fall back to defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RetryStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
}

impl RetryOverride {
    pub fn auto(max_attempts: u32, interval: u64) -> Self {
        Self {
            strategy: Some(RetryStrategy::Auto),
            max_attempts: Some(max_attempts),
            interval: Some(interval),
        }
    }

    pub fn resolve(&self, defaults: &RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            strategy: self.strategy.unwrap_or(defaults.strategy),
            max_attempts: self
                .max_attempts
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_attempts),
            interval_secs: self
                .interval
                .filter(|n| *n > 0)
                .unwrap_or(defaults.interval_secs)
                .min(MAX_RETRY_INTERVAL_SECS),
        }
    }
}
