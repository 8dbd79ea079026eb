//! Domain data shapes shared across pipeline stages

pub mod record;
pub mod schema;
pub mod value;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use record::Record;
pub use schema::{ColumnSpec, ColumnType, Constraints, Schema};
pub use value::Value;

/// One extract file's worth of records, processed as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub batch_id: String,
    pub table_name: String,
    pub schema_version: String,
    pub source_partition_key: String,
    pub locator: String,
    pub records: Vec<Record>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Position of a record in the batch as read, plus its key when derivable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRef {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Reject,
    Warn,
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Reject
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    SchemaViolation,
    BusinessRuleViolation,
    DuplicateResolutionConflict,
    MaskingFailure,
}

/// A per-record (or batch-level, when `record_ref` is absent) finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_ref: Option<RecordRef>,
    pub rule_id: String,
    pub kind: IssueKind,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(
        kind: IssueKind,
        severity: Severity,
        rule_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            record_ref: None,
            rule_id: rule_id.into(),
            kind,
            severity,
            column: None,
            message: message.into(),
        }
    }

    pub fn for_record(mut self, record_ref: RecordRef) -> Self {
        self.record_ref = Some(record_ref);
        self
    }

    pub fn on_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    pub fn is_reject(&self) -> bool {
        self.severity == Severity::Reject
    }
}

/// Explicit per-record result of a validation step.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Accepted(Record),
    Warned(Vec<ValidationIssue>, Record),
    Rejected(Vec<ValidationIssue>),
}

/// A record that survived validation and dedup, tagged with its position in
/// the batch as read so issues raised later can still point back at it.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedRecord {
    pub index: usize,
    pub record: Record,
    pub warned: bool,
}

impl TrackedRecord {
    pub fn record_ref(&self, key_columns: &[String]) -> RecordRef {
        RecordRef {
            index: self.index,
            primary_key: self.record.primary_key(key_columns),
        }
    }
}

/// Record as persisted in the curated layer. Never modified after write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CuratedRecord {
    pub record: Record,
    pub quality_score: f64,
    pub is_anomaly: bool,
    pub anomaly_score: f64,
    pub processed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_builder() {
        let issue = ValidationIssue::new(
            IssueKind::SchemaViolation,
            Severity::Reject,
            "schema.missing_column",
            "missing required column 'order_id'",
        )
        .for_record(RecordRef { index: 3, primary_key: None })
        .on_column("order_id");

        assert!(issue.is_reject());
        assert_eq!(issue.record_ref.as_ref().map(|r| r.index), Some(3));
        let json = serde_json::to_value(&issue).unwrap();
        assert_eq!(json["kind"], "schema_violation");
        assert_eq!(json["severity"], "reject");
    }
}
