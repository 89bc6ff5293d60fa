use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// JSON config handed to executors after merging
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

/// Registry entry describing one kind of task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDefinition {
    pub name: String,
    /// Executor type: `rpc`, `mq`, `http` or `db`
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_fields: Vec<FieldSpec>,
    #[serde(default)]
    pub config: TaskConfig,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task_type: task_type.into(),
            description: String::new(),
            input_fields: Vec::new(),
            config: TaskConfig::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_field(mut self, field: FieldSpec) -> Self {
        self.input_fields.push(field);
        self
    }

    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }
}

/// Default executor settings carried by a task definition
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

impl TaskConfig {
    /// Render as a config map, leaving out unset keys
    pub fn to_map(&self) -> ConfigMap {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => ConfigMap::new(),
        }
    }
}

/// Shallow key merge; keys from `overrides` win
pub fn merge_config(base: &ConfigMap, overrides: Option<&ConfigMap>) -> ConfigMap {
    let mut merged = base.clone();
    if let Some(overrides) = overrides {
        for (key, value) in overrides {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// One declared input of a task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            default: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// Declared type tag of an input field
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldType {
    String,
    Int,
    Int64,
    Float,
    Float64,
    Bool,
    StringList,
    IntList,
    FloatList,
    Object,
    Array,
    Time,
    /// Unrecognized tag; values pass through untouched
    Any(String),
}

impl FieldType {
    pub fn as_str(&self) -> &str {
        match self {
            FieldType::String => "string",
            FieldType::Int => "int",
            FieldType::Int64 => "int64",
            FieldType::Float => "float",
            FieldType::Float64 => "float64",
            FieldType::Bool => "bool",
            FieldType::StringList => "[]string",
            FieldType::IntList => "[]int",
            FieldType::FloatList => "[]float",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Time => "time",
            FieldType::Any(tag) => tag,
        }
    }
}

impl From<&str> for FieldType {
    fn from(tag: &str) -> Self {
        match tag {
            "string" => FieldType::String,
            "int" => FieldType::Int,
            "int64" => FieldType::Int64,
            "float" => FieldType::Float,
            "float64" => FieldType::Float64,
            "bool" => FieldType::Bool,
            "[]string" => FieldType::StringList,
            "[]int" => FieldType::IntList,
            "[]float" => FieldType::FloatList,
            "object" => FieldType::Object,
            "array" => FieldType::Array,
            "time" => FieldType::Time,
            other => FieldType::Any(other.to_string()),
        }
    }
}

impl From<String> for FieldType {
    fn from(tag: String) -> Self {
        FieldType::from(tag.as_str())
    }
}

impl From<FieldType> for String {
    fn from(field_type: FieldType) -> Self {
        field_type.as_str().to_string()
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
