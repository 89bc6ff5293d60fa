//! Schema-driven coercion of loosely-typed task input.
//!
//! Every accepted (declared type, runtime kind) pair is spelled out in
//! [`convert`]; anything not listed there is a [`ValidationError`].

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use txcore::{FieldSpec, FieldType, Params, ValidationError, Value};

/// Outcome of [`validate_all`]: every field error, plus the params that did
/// convert
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    #[serde(serialize_with = "serialize_params")]
    pub params: Params,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

fn serialize_params<S: serde::Serializer>(params: &Params, s: S) -> Result<S::Ok, S::Error> {
    txcore::params_to_json(params).serialize(s)
}

/// Validate `input` against `schema`, stopping at the first bad field.
///
/// The result holds only schema-declared keys; anything else the caller sent
/// is dropped.
pub fn validate(schema: &[FieldSpec], input: &Params) -> Result<Params, ValidationError> {
    let mut result = Params::new();
    for field in schema {
        if let Some(value) = resolve_field(field, input)? {
            result.insert(field.name.clone(), value);
        }
    }
    Ok(result)
}

/// Validate every field and collect all errors instead of stopping early
pub fn validate_all(schema: &[FieldSpec], input: &Params) -> ValidationReport {
    let mut params = Params::new();
    let mut errors = Vec::new();
    for field in schema {
        match resolve_field(field, input) {
            Ok(Some(value)) => {
                params.insert(field.name.clone(), value);
            }
            Ok(None) => {}
            Err(e) => errors.push(ValidationIssue {
                field: e.field.clone(),
                message: e.to_string(),
            }),
        }
    }
    ValidationReport {
        valid: errors.is_empty(),
        errors,
        params,
    }
}

fn resolve_field(field: &FieldSpec, input: &Params) -> Result<Option<Value>, ValidationError> {
    match input.get(&field.name).filter(|v| !v.is_null()) {
        Some(value) => convert_field(&field.name, &field.field_type, value).map(Some),
        None => match &field.default {
            Some(default) => convert_field(&field.name, &field.field_type, default).map(Some),
            None if field.required => Err(ValidationError {
                field: field.name.clone(),
                reason: "required field missing".to_string(),
                actual: None,
                expected: field.field_type.clone(),
            }),
            None => Ok(None),
        },
    }
}

/// Coerce one value to a declared type
pub fn convert(field_type: &FieldType, value: &Value) -> Result<Value, ValidationError> {
    convert_field("", field_type, value)
}

fn convert_field(field: &str, field_type: &FieldType, value: &Value) -> Result<Value, ValidationError> {
    let fail = |reason: String| ValidationError {
        field: field.to_string(),
        reason,
        actual: Some(value.kind()),
        expected: field_type.clone(),
    };

    match field_type {
        FieldType::String => to_string(value).map(Value::String).map_err(fail),
        FieldType::Int | FieldType::Int64 => to_int(value).map(Value::Int).map_err(fail),
        FieldType::Float | FieldType::Float64 => to_float(value).map(Value::Float).map_err(fail),
        FieldType::Bool => to_bool(value).map(Value::Bool).map_err(fail),
        FieldType::Time => to_time(value).map(Value::Time).map_err(fail),
        FieldType::StringList => convert_list(field, field_type, value, |v| to_string(v).map(Value::String)),
        FieldType::IntList => convert_list(field, field_type, value, |v| to_int(v).map(Value::Int)),
        FieldType::FloatList => convert_list(field, field_type, value, |v| to_float(v).map(Value::Float)),
        FieldType::Object => match value {
            Value::Object(_) => Ok(value.clone()),
            Value::Null => Ok(Value::Object(HashMap::new())),
            Value::String(s) => match serde_json::from_str::<serde_json::Value>(s) {
                Ok(parsed @ serde_json::Value::Object(_)) => Ok(Value::from(parsed)),
                Ok(_) => Err(fail("string is not a JSON object".to_string())),
                Err(e) => Err(fail(format!("invalid JSON object: {}", e))),
            },
            _ => Err(fail("cannot convert to object".to_string())),
        },
        FieldType::Array => match value {
            Value::Array(_) => Ok(value.clone()),
            Value::Null => Ok(Value::Array(Vec::new())),
            Value::String(s) => match serde_json::from_str::<serde_json::Value>(s) {
                Ok(parsed @ serde_json::Value::Array(_)) => Ok(Value::from(parsed)),
                Ok(_) => Err(fail("string is not a JSON array".to_string())),
                Err(e) => Err(fail(format!("invalid JSON array: {}", e))),
            },
            _ => Err(fail("cannot convert to array".to_string())),
        },
        FieldType::Any(_) => Ok(value.clone()),
    }
}

fn convert_list<F>(field: &str, field_type: &FieldType, value: &Value, element: F) -> Result<Value, ValidationError>
where
    F: Fn(&Value) -> Result<Value, String>,
{
    let items: Vec<&Value> = match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().collect(),
        scalar => vec![scalar],
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            element(item).map_err(|reason| ValidationError {
                field: format!("{}[{}]", field, i),
                reason,
                actual: Some(item.kind()),
                expected: field_type.clone(),
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Value::Array)
}

fn to_string(value: &Value) -> Result<String, String> {
    Ok(match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Int(n) => n.to_string(),
        Value::Float(n) => n.to_string(),
        Value::Time(t) => t.to_rfc3339(),
        Value::Array(_) | Value::Object(_) => value.to_json().to_string(),
    })
}

fn to_int(value: &Value) -> Result<i64, String> {
    match value {
        Value::Int(n) => Ok(*n),
        Value::Float(n) => Ok(n.trunc() as i64),
        Value::String(s) => s.parse::<i64>().map_err(|e| e.to_string()),
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::Null => Ok(0),
        _ => Err("cannot convert to integer".to_string()),
    }
}

fn to_float(value: &Value) -> Result<f64, String> {
    match value {
        Value::Float(n) => Ok(*n),
        Value::Int(n) => Ok(*n as f64),
        Value::String(s) => s.parse::<f64>().map_err(|e| e.to_string()),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Null => Ok(0.0),
        _ => Err("cannot convert to float".to_string()),
    }
}

fn to_bool(value: &Value) -> Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Int(n) => Ok(*n != 0),
        Value::Float(n) => Ok(*n != 0.0),
        Value::String(s) => parse_bool(s).ok_or_else(|| format!("invalid boolean syntax: {:?}", s)),
        Value::Null => Ok(false),
        _ => Err("cannot convert to bool".to_string()),
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

fn to_time(value: &Value) -> Result<DateTime<Utc>, String> {
    match value {
        Value::Time(t) => Ok(*t),
        Value::Int(secs) => Utc
            .timestamp_opt(*secs, 0)
            .single()
            .ok_or_else(|| format!("timestamp out of range: {}", secs)),
        Value::String(s) => parse_time(s).ok_or_else(|| format!("unrecognized time format: {:?}", s)),
        _ => Err("cannot convert to time".to_string()),
    }
}

/// Tried in order; the first match wins
fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%SZ") {
        return Some(t.and_utc());
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(t.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
}
