use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::domain::{Record, Schema, Value};

/// Summary statistics for one declared column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub column: String,
    pub missing_count: usize,
    pub missing_pct: f64,
    pub unique_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub std: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl ColumnStats {
    pub fn completeness(&self) -> f64 {
        1.0 - self.missing_pct / 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityProfile {
    pub row_count: usize,
    pub column_count: usize,
    /// Missing cells over all declared cells, in percent
    pub missing_pct: f64,
    pub missing_cells: usize,
    pub total_cells: usize,
    /// Records whose primary key already appeared earlier in the batch
    pub duplicate_count: usize,
    pub columns: Vec<ColumnStats>,
}

impl QualityProfile {
    /// Fraction of declared cells present; 1.0 for an empty batch.
    pub fn completeness(&self) -> f64 {
        if self.total_cells == 0 {
            1.0
        } else {
            1.0 - self.missing_cells as f64 / self.total_cells as f64
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnStats> {
        self.columns.iter().find(|c| c.column == name)
    }
}

fn pct(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

/// Profile a batch as read, over the schema's declared columns.
pub fn profile(records: &[Record], schema: &Schema, key_columns: &[String]) -> QualityProfile {
    let rows = records.len();
    let mut columns = Vec::with_capacity(schema.columns.len());
    let mut missing_cells = 0;

    for spec in &schema.columns {
        let mut missing = 0;
        let mut distinct: HashSet<String> = HashSet::new();
        let mut numbers: Vec<f64> = Vec::new();

        for record in records {
            match record.get(&spec.name) {
                None | Some(Value::Null) => missing += 1,
                Some(value) => {
                    if let Some(text) = value.render() {
                        distinct.insert(text);
                    }
                    if spec.column_type.is_numeric() {
                        if let Some(n) = spec.column_type.coerce(value).and_then(|v| v.as_f64()) {
                            numbers.push(n);
                        }
                    }
                }
            }
        }
        missing_cells += missing;

        let (mean, std, min, max) = numeric_summary(&numbers);
        columns.push(ColumnStats {
            column: spec.name.clone(),
            missing_count: missing,
            missing_pct: pct(missing, rows),
            unique_count: distinct.len(),
            mean,
            std,
            min,
            max,
        });
    }

    let mut seen: HashSet<String> = HashSet::with_capacity(rows);
    let duplicate_count = records
        .iter()
        .filter_map(|r| r.primary_key(key_columns))
        .filter(|key| !seen.insert(key.clone()))
        .count();

    let total_cells = rows * schema.columns.len();
    QualityProfile {
        row_count: rows,
        column_count: schema.columns.len(),
        missing_pct: pct(missing_cells, total_cells),
        missing_cells,
        total_cells,
        duplicate_count,
        columns,
    }
}

/// Mean, sample standard deviation, min and max.
fn numeric_summary(values: &[f64]) -> (Option<f64>, Option<f64>, Option<f64>, Option<f64>) {
    if values.is_empty() {
        return (None, None, None, None);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let std = (values.len() > 1).then(|| {
        let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
        (ss / (n - 1.0)).sqrt()
    });
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    (Some(mean), std, Some(min), Some(max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ColumnSpec, ColumnType};

    fn schema() -> Schema {
        Schema {
            table_name: "products".to_string(),
            version: "v1".to_string(),
            columns: vec![
                ColumnSpec::required("product_id", ColumnType::String),
                ColumnSpec::required("price", ColumnType::Float),
            ],
        }
    }

    fn product(id: &str, price: Value) -> Record {
        Record::from_pairs([("product_id", Value::String(id.to_string())), ("price", price)])
    }

    #[test]
    fn test_profile_counts_missing_and_duplicates() {
        let records = vec![
            product("P1", Value::Float(10.0)),
            product("P2", Value::Null),
            product("P1", Value::String("20".into())),
            Record::from_pairs([("product_id", Value::String("P3".into()))]),
        ];
        let p = profile(&records, &schema(), &["product_id".to_string()]);
        assert_eq!(p.row_count, 4);
        assert_eq!(p.column_count, 2);
        assert_eq!(p.missing_cells, 2);
        assert_eq!(p.total_cells, 8);
        assert_eq!(p.duplicate_count, 1);
        assert!((p.completeness() - 0.75).abs() < 1e-9);

        let price = p.column("price").unwrap();
        assert_eq!(price.missing_count, 2);
        assert_eq!(price.mean, Some(15.0));
        assert_eq!(price.min, Some(10.0));
        assert_eq!(price.max, Some(20.0));
        assert!((price.std.unwrap() - 7.0710678).abs() < 1e-6);
        assert!((price.completeness() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_batch_is_complete() {
        let p = profile(&[], &schema(), &[]);
        assert_eq!(p.completeness(), 1.0);
        assert_eq!(p.missing_pct, 0.0);
    }

    #[test]
    fn test_completeness_is_monotonic_in_missing_cells() {
        let full: Vec<Record> = (0..10).map(|i| product(&format!("P{i}"), Value::Float(1.0))).collect();
        let mut previous = profile(&full, &schema(), &[]).completeness();
        let mut records = full;
        for i in 0..10 {
            records[i].set("price", Value::Null);
            let current = profile(&records, &schema(), &[]).completeness();
            assert!(current < previous);
            previous = current;
        }
    }
}
