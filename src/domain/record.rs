use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use super::value::Value;
use crate::common::constants::KEY_SEPARATOR;

/// Ordered mapping of column name to value. Column order is the order in
/// which columns were first set and is preserved through serialization.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut record = Record::new();
        for (column, value) in pairs {
            record.set(column, value);
        }
        record
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    /// Replace the value in place, or append a new trailing column.
    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        let column = column.into();
        match self.fields.iter_mut().find(|(c, _)| *c == column) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((column, value)),
        }
    }

    pub fn contains(&self, column: &str) -> bool {
        self.fields.iter().any(|(c, _)| c == column)
    }

    /// Absent and null cells both count as missing.
    pub fn is_missing(&self, column: &str) -> bool {
        self.get(column).map_or(true, Value::is_null)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(c, _)| c.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(c, v)| (c.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Composite key over the declared key columns; `None` when any part is missing.
    pub fn primary_key(&self, key_columns: &[String]) -> Option<String> {
        if key_columns.is_empty() {
            return None;
        }
        let parts = key_columns
            .iter()
            .map(|c| self.get(c).and_then(Value::render))
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join(KEY_SEPARATOR))
    }

    pub fn update_timestamp(&self, column: &str) -> Option<DateTime<Utc>> {
        self.get(column).and_then(Value::as_timestamp)
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (column, value) in &self.fields {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RecordVisitor;

        impl<'de> Visitor<'de> for RecordVisitor {
            type Value = Record;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of column values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Record, A::Error> {
                let mut record = Record::new();
                while let Some((column, value)) =
                    map.next_entry::<String, crate::domain::value::Value>()?
                {
                    record.set(column, value);
                }
                Ok(record)
            }
        }

        deserializer.deserialize_map(RecordVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_preserves_column_order() {
        let mut record = Record::new();
        record.set("b", Value::Int(1));
        record.set("a", Value::Int(2));
        record.set("b", Value::Int(3));
        let columns: Vec<&str> = record.columns().collect();
        assert_eq!(columns, vec!["b", "a"]);
        assert_eq!(record.get("b"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_composite_primary_key() {
        let record = Record::from_pairs([
            ("order_id", Value::String("ORD-1".to_string())),
            ("line", Value::Int(2)),
        ]);
        let key = record.primary_key(&["order_id".to_string(), "line".to_string()]);
        assert_eq!(key.as_deref(), Some("ORD-1|2"));
        assert_eq!(record.primary_key(&["missing".to_string()]), None);
    }

    #[test]
    fn test_serde_round_trip_keeps_order() {
        let record = Record::from_pairs([
            ("z", Value::String("last".to_string())),
            ("a", Value::Float(1.5)),
            ("m", Value::Null),
        ]);
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"z":"last","a":1.5,"m":null}"#);
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
