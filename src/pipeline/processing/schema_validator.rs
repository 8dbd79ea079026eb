use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, instrument};

use crate::common::error::{PipelineError, Result};
use crate::domain::{
    Batch, ColumnSpec, IssueKind, Record, RecordOutcome, RecordRef, Schema, Severity,
    TrackedRecord, ValidationIssue, Value,
};

/// Records that passed schema validation plus every issue raised on the way.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub valid: Vec<TrackedRecord>,
    pub issues: Vec<ValidationIssue>,
    pub rejected: usize,
    pub warned: usize,
}

/// Checks presence, type and nullability of every declared column.
///
/// Missing required columns, nulls in non-nullable columns and values that
/// cannot be coerced reject the record. Range, pattern and enumeration
/// constraints only warn.
pub struct SchemaValidator {
    schema: Schema,
    key_columns: Vec<String>,
    patterns: HashMap<String, Regex>,
}

impl SchemaValidator {
    pub fn new(schema: Schema, key_columns: Vec<String>) -> Result<Self> {
        let mut patterns = HashMap::new();
        for spec in &schema.columns {
            if let Some(pattern) = &spec.constraints.pattern {
                let regex = Regex::new(pattern).map_err(|e| {
                    PipelineError::Config(format!(
                        "invalid pattern for {}.{}: {e}",
                        schema.table_name, spec.name
                    ))
                })?;
                patterns.insert(spec.name.clone(), regex);
            }
        }
        Ok(Self {
            schema,
            key_columns,
            patterns,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    #[instrument(skip(self, batch), fields(table = %batch.table_name, batch_id = %batch.batch_id, records = batch.len()))]
    pub fn validate(&self, batch: &Batch) -> ValidationReport {
        let mut report = ValidationReport::default();

        if let Some(issue) = self.undeclared_columns(&batch.records) {
            report.issues.push(issue);
        }

        for (index, record) in batch.records.iter().enumerate() {
            match self.validate_record(index, record) {
                RecordOutcome::Accepted(record) => report.valid.push(TrackedRecord {
                    index,
                    record,
                    warned: false,
                }),
                RecordOutcome::Warned(issues, record) => {
                    report.warned += 1;
                    report.issues.extend(issues);
                    report.valid.push(TrackedRecord {
                        index,
                        record,
                        warned: true,
                    });
                }
                RecordOutcome::Rejected(issues) => {
                    debug!(index, issues = issues.len(), "Record rejected by schema validation");
                    report.rejected += 1;
                    report.issues.extend(issues);
                }
            }
        }

        info!(
            valid = report.valid.len(),
            rejected = report.rejected,
            warned = report.warned,
            "Schema validation complete"
        );
        report
    }

    /// Validate one record, producing a copy shaped to the schema: declared
    /// columns first in schema order, then any undeclared columns as read.
    pub fn validate_record(&self, index: usize, record: &Record) -> RecordOutcome {
        let record_ref = RecordRef {
            index,
            primary_key: record.primary_key(&self.key_columns),
        };
        let mut rejects = Vec::new();
        let mut warnings = Vec::new();
        let mut shaped = Record::new();

        for spec in &self.schema.columns {
            let issue = |rule: &str, severity: Severity, message: String| {
                ValidationIssue::new(IssueKind::SchemaViolation, severity, rule, message)
                    .for_record(record_ref.clone())
                    .on_column(spec.name.clone())
            };

            let raw = match record.get(&spec.name) {
                Some(value) => value,
                None if spec.nullable => {
                    shaped.set(spec.name.clone(), Value::Null);
                    continue;
                }
                None => {
                    rejects.push(issue(
                        "schema.missing_column",
                        Severity::Reject,
                        format!("required column '{}' is missing", spec.name),
                    ));
                    continue;
                }
            };

            if raw.is_null() {
                if !spec.nullable {
                    rejects.push(issue(
                        "schema.null_value",
                        Severity::Reject,
                        format!("column '{}' is not nullable", spec.name),
                    ));
                }
                shaped.set(spec.name.clone(), Value::Null);
                continue;
            }

            match spec.column_type.coerce(raw) {
                Some(typed) => {
                    for (rule, message) in self.constraint_violations(spec, &typed) {
                        warnings.push(issue(rule, Severity::Warn, message));
                    }
                    shaped.set(spec.name.clone(), typed);
                }
                None => rejects.push(issue(
                    "schema.type_mismatch",
                    Severity::Reject,
                    format!(
                        "{} value in column '{}' is not coercible to {:?}",
                        raw.type_name(),
                        spec.name,
                        spec.column_type
                    ),
                )),
            }
        }

        if !rejects.is_empty() {
            rejects.extend(warnings);
            return RecordOutcome::Rejected(rejects);
        }

        for (column, value) in record.iter() {
            if self.schema.column(column).is_none() {
                shaped.set(column, value.clone());
            }
        }

        if warnings.is_empty() {
            RecordOutcome::Accepted(shaped)
        } else {
            RecordOutcome::Warned(warnings, shaped)
        }
    }

    fn constraint_violations(&self, spec: &ColumnSpec, value: &Value) -> Vec<(&'static str, String)> {
        let mut found = Vec::new();
        let constraints = &spec.constraints;

        if let Some(n) = value.as_f64() {
            if let Some(min) = constraints.min {
                if n < min {
                    found.push((
                        "schema.below_min",
                        format!("column '{}' is below minimum {min}", spec.name),
                    ));
                }
            }
            if let Some(max) = constraints.max {
                if n > max {
                    found.push((
                        "schema.above_max",
                        format!("column '{}' is above maximum {max}", spec.name),
                    ));
                }
            }
        }

        if let (Some(regex), Some(text)) = (self.patterns.get(&spec.name), value.render()) {
            if !regex.is_match(&text) {
                found.push((
                    "schema.pattern_mismatch",
                    format!("column '{}' does not match its declared format", spec.name),
                ));
            }
        }

        if let (Some(allowed), Some(text)) = (&constraints.allowed, value.render()) {
            if !allowed.iter().any(|a| *a == text) {
                found.push((
                    "schema.not_allowed",
                    format!("column '{}' is outside its allowed values", spec.name),
                ));
            }
        }

        found
    }

    fn undeclared_columns(&self, records: &[Record]) -> Option<ValidationIssue> {
        let extras: BTreeSet<&str> = records
            .iter()
            .flat_map(|r| r.columns())
            .filter(|c| self.schema.column(c).is_none())
            .collect();
        if extras.is_empty() {
            return None;
        }
        let list = extras.into_iter().collect::<Vec<_>>().join(", ");
        Some(ValidationIssue::new(
            IssueKind::SchemaViolation,
            Severity::Warn,
            "schema.undeclared_columns",
            format!("batch carries undeclared columns: {list}"),
        ))
    }
}

/// Typing pass used when validation is switched off: every record is kept
/// and declared columns are coerced where possible.
pub fn passthrough(batch: &Batch, schema: &Schema) -> ValidationReport {
    let valid = batch
        .records
        .iter()
        .enumerate()
        .map(|(index, record)| {
            let mut record = record.clone();
            schema.retype(&mut record);
            TrackedRecord {
                index,
                record,
                warned: false,
            }
        })
        .collect();
    ValidationReport {
        valid,
        ..ValidationReport::default()
    }
}
