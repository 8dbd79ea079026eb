use serde::{Deserialize, Serialize};

use super::record::Record;
use super::value::{parse_timestamp, Value};

/// Declared column types. Incoming values are coerced into these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
}

impl ColumnType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Int | ColumnType::Float)
    }

    /// Coerce a value into this type; `None` means the value is not coercible.
    /// Null is passed through, nullability is checked separately.
    pub fn coerce(&self, value: &Value) -> Option<Value> {
        if value.is_null() {
            return Some(Value::Null);
        }
        match (self, value) {
            (ColumnType::String, v) => v.render().map(Value::String),

            (ColumnType::Int, Value::Int(i)) => Some(Value::Int(*i)),
            // `as` saturates, so out-of-range floats must not reach the cast
            (ColumnType::Int, Value::Float(f))
                if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 =>
            {
                Some(Value::Int(*f as i64))
            }
            (ColumnType::Int, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::Int),

            (ColumnType::Float, Value::Int(i)) => Some(Value::Float(*i as f64)),
            (ColumnType::Float, Value::Float(f)) if f.is_finite() => Some(Value::Float(*f)),
            (ColumnType::Float, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Value::Float),

            (ColumnType::Bool, Value::Bool(b)) => Some(Value::Bool(*b)),
            (ColumnType::Bool, Value::Int(0)) => Some(Value::Bool(false)),
            (ColumnType::Bool, Value::Int(1)) => Some(Value::Bool(true)),
            (ColumnType::Bool, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Some(Value::Bool(true)),
                "false" | "0" => Some(Value::Bool(false)),
                _ => None,
            },

            (ColumnType::Timestamp, Value::Timestamp(ts)) => Some(Value::Timestamp(*ts)),
            (ColumnType::Timestamp, Value::String(s)) => parse_timestamp(s).map(Value::Timestamp),
            (ColumnType::Timestamp, Value::Int(_)) => value.as_timestamp().map(Value::Timestamp),

            _ => None,
        }
    }
}

/// Soft constraints. Violations keep the record and raise a warning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub nullable: bool,
    #[serde(default)]
    pub constraints: Constraints,
}

impl ColumnSpec {
    pub fn required(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            nullable: false,
            constraints: Constraints::default(),
        }
    }

    pub fn optional(name: &str, column_type: ColumnType) -> Self {
        Self {
            nullable: true,
            ..Self::required(name, column_type)
        }
    }

    pub fn with_min(mut self, min: f64) -> Self {
        self.constraints.min = Some(min);
        self
    }

    pub fn with_max(mut self, max: f64) -> Self {
        self.constraints.max = Some(max);
        self
    }

    pub fn with_pattern(mut self, pattern: &str) -> Self {
        self.constraints.pattern = Some(pattern.to_string());
        self
    }

    pub fn with_allowed(mut self, allowed: &[&str]) -> Self {
        self.constraints.allowed = Some(allowed.iter().map(|s| s.to_string()).collect());
        self
    }
}

/// Declared layout of one table version, as published by the schema registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub table_name: String,
    pub version: String,
    pub columns: Vec<ColumnSpec>,
}

impl Schema {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Best-effort typing of an already-validated record, e.g. one read back
    /// from the curated layer. Values that fail coercion are left untouched.
    pub fn retype(&self, record: &mut Record) {
        for spec in &self.columns {
            if let Some(value) = record.get(&spec.name) {
                if let Some(typed) = spec.column_type.coerce(value) {
                    record.set(spec.name.clone(), typed);
                }
            }
        }
    }
}
