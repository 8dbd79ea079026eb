use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, instrument, warn};

use crate::common::error::{PipelineError, Result};
use crate::domain::{IssueKind, Record, Severity, TrackedRecord, ValidationIssue, Value};

fn default_epsilon() -> f64 {
    0.01
}

/// A declared table invariant. Loaded from registry bundles as JSON, e.g.
/// `{"id": "orders.total_positive", "kind": "non_negative", "column": "total"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessRule {
    pub id: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(flatten)]
    pub kind: RuleKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleKind {
    NonNegative {
        column: String,
    },
    Positive {
        column: String,
    },
    OneOf {
        column: String,
        values: Vec<String>,
    },
    Matches {
        column: String,
        pattern: String,
    },
    NotInFuture {
        column: String,
    },
    /// `total == Σ parts − Σ subtract`
    SumEquals {
        parts: Vec<String>,
        #[serde(default)]
        subtract: Vec<String>,
        total: String,
        #[serde(default = "default_epsilon")]
        epsilon: f64,
    },
    /// `total == quantity · unit_price − discount`
    LineTotalMatches {
        quantity: String,
        unit_price: String,
        #[serde(default)]
        discount: Option<String>,
        total: String,
        #[serde(default = "default_epsilon")]
        epsilon: f64,
    },
    NotGreaterThan {
        column: String,
        limit: String,
    },
    RequiredWhen {
        column: String,
        when_column: String,
        equals: String,
    },
    /// Cross-record: `total` equals the sum of `amount` over reference rows
    /// whose `reference_key` matches this record's `key`.
    GroupSumMatches {
        key: String,
        total: String,
        reference_table: String,
        reference_key: String,
        amount: String,
        #[serde(default = "default_epsilon")]
        epsilon: f64,
    },
    ReferenceExists {
        column: String,
        reference_table: String,
        reference_column: String,
    },
}

impl RuleKind {
    pub fn reference_table(&self) -> Option<&str> {
        match self {
            RuleKind::GroupSumMatches { reference_table, .. }
            | RuleKind::ReferenceExists { reference_table, .. } => Some(reference_table),
            _ => None,
        }
    }
}

/// Reference extracts supplied alongside a batch, keyed by table name.
pub type ReferenceData = HashMap<String, Vec<Record>>;

/// Survivors of rule evaluation. Records themselves are never modified.
#[derive(Debug, Clone, Default)]
pub struct RuleReport {
    pub survivors: Vec<TrackedRecord>,
    pub issues: Vec<ValidationIssue>,
    pub rejected: usize,
    pub warned: usize,
}

/// Per-rule state computed once per batch before records are visited.
enum Prepared<'a> {
    Plain,
    Pattern(Regex),
    Sums(HashMap<String, f64>),
    Keys(HashSet<String>),
    Skipped(&'a str),
}

pub struct BusinessRuleEngine {
    rules: Vec<BusinessRule>,
    key_columns: Vec<String>,
}

impl BusinessRuleEngine {
    pub fn new(rules: Vec<BusinessRule>, key_columns: Vec<String>) -> Result<Self> {
        for rule in &rules {
            if let RuleKind::Matches { pattern, .. } = &rule.kind {
                Regex::new(pattern).map_err(|e| {
                    PipelineError::Config(format!("rule '{}' has an invalid pattern: {e}", rule.id))
                })?;
            }
        }
        Ok(Self { rules, key_columns })
    }

    pub fn rules(&self) -> &[BusinessRule] {
        &self.rules
    }

    /// Evaluate every rule against every record. `now` anchors the
    /// `not_in_future` checks so a rerun sees the same clock.
    #[instrument(skip_all, fields(records = records.len(), rules = self.rules.len()))]
    pub fn evaluate(
        &self,
        records: Vec<TrackedRecord>,
        references: &ReferenceData,
        now: DateTime<Utc>,
    ) -> RuleReport {
        let mut report = RuleReport::default();
        let prepared = self.prepare(references, &mut report.issues);

        for mut tracked in records {
            let mut findings = Vec::new();
            for (rule, state) in self.rules.iter().zip(&prepared) {
                if let Some(message) = check(rule, state, &tracked.record, now) {
                    findings.push(
                        ValidationIssue::new(
                            IssueKind::BusinessRuleViolation,
                            rule.severity,
                            rule.id.clone(),
                            message,
                        )
                        .for_record(tracked.record_ref(&self.key_columns)),
                    );
                }
            }

            let rejected = findings.iter().any(ValidationIssue::is_reject);
            if rejected {
                debug!(index = tracked.index, "Record rejected by business rules");
                report.rejected += 1;
            } else {
                if !findings.is_empty() {
                    report.warned += 1;
                    tracked.warned = true;
                }
                report.survivors.push(tracked);
            }
            report.issues.extend(findings);
        }

        info!(
            survivors = report.survivors.len(),
            rejected = report.rejected,
            warned = report.warned,
            "Business rule evaluation complete"
        );
        report
    }

    fn prepare<'a>(
        &'a self,
        references: &ReferenceData,
        issues: &mut Vec<ValidationIssue>,
    ) -> Vec<Prepared<'a>> {
        self.rules
            .iter()
            .map(|rule| {
                if let Some(table) = rule.kind.reference_table() {
                    if !references.contains_key(table) {
                        warn!(rule = %rule.id, reference_table = table, "Reference data not supplied, skipping rule");
                        issues.push(ValidationIssue::new(
                            IssueKind::BusinessRuleViolation,
                            Severity::Warn,
                            rule.id.clone(),
                            format!("reference table '{table}' not supplied; rule skipped"),
                        ));
                        return Prepared::Skipped(table);
                    }
                }
                match &rule.kind {
                    // Validated in new()
                    RuleKind::Matches { pattern, .. } => match Regex::new(pattern) {
                        Ok(regex) => Prepared::Pattern(regex),
                        Err(_) => Prepared::Skipped("pattern"),
                    },
                    RuleKind::GroupSumMatches {
                        reference_table,
                        reference_key,
                        amount,
                        ..
                    } => {
                        let mut sums: HashMap<String, f64> = HashMap::new();
                        for row in references.get(reference_table).into_iter().flatten() {
                            let key = row.get(reference_key).and_then(Value::render);
                            let value = row.get(amount).and_then(Value::as_f64);
                            if let (Some(key), Some(value)) = (key, value) {
                                *sums.entry(key).or_insert(0.0) += value;
                            }
                        }
                        Prepared::Sums(sums)
                    }
                    RuleKind::ReferenceExists {
                        reference_table,
                        reference_column,
                        ..
                    } => Prepared::Keys(
                        references
                            .get(reference_table)
                            .into_iter()
                            .flatten()
                            .filter_map(|row| row.get(reference_column).and_then(Value::render))
                            .collect(),
                    ),
                    _ => Prepared::Plain,
                }
            })
            .collect()
    }
}

fn number(record: &Record, column: &str) -> Option<f64> {
    record.get(column).and_then(|v| match v {
        Value::String(s) => s.trim().parse::<f64>().ok(),
        other => other.as_f64(),
    })
}

/// Returns a violation message, or `None` when the rule holds or its
/// operands are null.
fn check(rule: &BusinessRule, state: &Prepared<'_>, record: &Record, now: DateTime<Utc>) -> Option<String> {
    if let Prepared::Skipped(_) = state {
        return None;
    }
    match &rule.kind {
        RuleKind::NonNegative { column } => {
            let v = number(record, column)?;
            (v < 0.0).then(|| format!("{column} must not be negative"))
        }
        RuleKind::Positive { column } => {
            let v = number(record, column)?;
            (v <= 0.0).then(|| format!("{column} must be greater than zero"))
        }
        RuleKind::OneOf { column, values } => {
            let v = record.get(column).and_then(Value::render)?;
            (!values.contains(&v)).then(|| format!("{column} is not one of {}", values.join("/")))
        }
        RuleKind::Matches { column, .. } => {
            let Prepared::Pattern(regex) = state else {
                return None;
            };
            let v = record.get(column).and_then(Value::render)?;
            (!regex.is_match(&v)).then(|| format!("{column} does not match the expected format"))
        }
        RuleKind::NotInFuture { column } => {
            let ts = record.update_timestamp(column)?;
            (ts > now).then(|| format!("{column} is in the future"))
        }
        RuleKind::SumEquals {
            parts,
            subtract,
            total,
            epsilon,
        } => {
            let mut expected = 0.0;
            for part in parts {
                expected += number(record, part)?;
            }
            for part in subtract {
                expected -= number(record, part)?;
            }
            let actual = number(record, total)?;
            ((expected - actual).abs() > *epsilon)
                .then(|| format!("{total} {actual:.2} does not match computed {expected:.2}"))
        }
        RuleKind::LineTotalMatches {
            quantity,
            unit_price,
            discount,
            total,
            epsilon,
        } => {
            let discount = match discount {
                Some(column) => number(record, column).unwrap_or(0.0),
                None => 0.0,
            };
            let expected = number(record, quantity)? * number(record, unit_price)? - discount;
            let actual = number(record, total)?;
            ((expected - actual).abs() > *epsilon)
                .then(|| format!("{total} {actual:.2} does not match line total {expected:.2}"))
        }
        RuleKind::NotGreaterThan { column, limit } => {
            let v = number(record, column)?;
            let cap = number(record, limit)?;
            (v > cap).then(|| format!("{column} exceeds {limit}"))
        }
        RuleKind::RequiredWhen {
            column,
            when_column,
            equals,
        } => {
            let trigger = record.get(when_column).and_then(Value::render)?;
            (trigger == *equals && record.is_missing(column))
                .then(|| format!("{column} is required when {when_column} is '{equals}'"))
        }
        RuleKind::GroupSumMatches {
            key,
            total,
            reference_table,
            epsilon,
            ..
        } => {
            let Prepared::Sums(sums) = state else {
                return None;
            };
            let key_value = record.get(key).and_then(Value::render)?;
            let actual = number(record, total)?;
            // A key with no reference rows sums to zero.
            let expected = sums.get(&key_value).copied().unwrap_or(0.0);
            ((expected - actual).abs() > *epsilon).then(|| {
                format!("{total} {actual:.2} does not match {reference_table} sum {expected:.2}")
            })
        }
        RuleKind::ReferenceExists {
            column,
            reference_table,
            ..
        } => {
            let Prepared::Keys(keys) = state else {
                return None;
            };
            let v = record.get(column).and_then(Value::render)?;
            (!keys.contains(&v)).then(|| format!("{column} has no matching {reference_table} row"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn tracked(records: Vec<Record>) -> Vec<TrackedRecord> {
        records
            .into_iter()
            .enumerate()
            .map(|(index, record)| TrackedRecord {
                index,
                record,
                warned: false,
            })
            .collect()
    }

    fn order(id: &str, total: f64) -> Record {
        Record::from_pairs([
            ("order_id", Value::String(id.to_string())),
            ("total", Value::Float(total)),
        ])
    }

    fn item(order_id: &str, total: f64) -> Record {
        Record::from_pairs([
            ("order_id", Value::String(order_id.to_string())),
            ("total", Value::Float(total)),
        ])
    }

    fn group_sum_rule() -> BusinessRule {
        BusinessRule {
            id: "orders.total_matches_items".to_string(),
            severity: Severity::Reject,
            kind: RuleKind::GroupSumMatches {
                key: "order_id".to_string(),
                total: "total".to_string(),
                reference_table: "order_items".to_string(),
                reference_key: "order_id".to_string(),
                amount: "total".to_string(),
                epsilon: 0.01,
            },
        }
    }

    #[test]
    fn test_rule_deserializes_from_bundle_json() {
        let rule: BusinessRule = serde_json::from_str(
            r#"{"id": "payments.amount_positive", "kind": "positive", "column": "amount"}"#,
        )
        .unwrap();
        assert_eq!(rule.severity, Severity::Reject);
        assert!(matches!(rule.kind, RuleKind::Positive { ref column } if column == "amount"));

        let rule: BusinessRule = serde_json::from_str(
            r#"{"id": "x", "severity": "warn", "kind": "sum_equals", "parts": ["a", "b"], "total": "c"}"#,
        )
        .unwrap();
        assert_eq!(rule.severity, Severity::Warn);
        assert!(matches!(rule.kind, RuleKind::SumEquals { epsilon, .. } if epsilon == 0.01));
    }

    #[test]
    fn test_order_total_mismatch_against_items_is_rejected() {
        let engine = BusinessRuleEngine::new(vec![group_sum_rule()], vec!["order_id".to_string()]).unwrap();
        let references = ReferenceData::from([(
            "order_items".to_string(),
            vec![item("ORD-1", 50.0), item("ORD-1", 30.0), item("ORD-2", 20.0)],
        )]);
        let report = engine.evaluate(
            tracked(vec![order("ORD-1", 100.0), order("ORD-2", 20.0)]),
            &references,
            now(),
        );

        assert_eq!(report.rejected, 1);
        assert_eq!(report.survivors.len(), 1);
        assert_eq!(
            report.survivors[0].record.get("order_id"),
            Some(&Value::String("ORD-2".to_string()))
        );
        let issue = &report.issues[0];
        assert_eq!(issue.kind, IssueKind::BusinessRuleViolation);
        assert_eq!(issue.record_ref.as_ref().unwrap().primary_key.as_deref(), Some("ORD-1"));
    }

    #[test]
    fn test_missing_reference_table_warns_once_and_skips() {
        let engine = BusinessRuleEngine::new(vec![group_sum_rule()], vec![]).unwrap();
        let report = engine.evaluate(
            tracked(vec![order("ORD-1", 100.0), order("ORD-2", 5.0)]),
            &ReferenceData::new(),
            now(),
        );
        assert_eq!(report.survivors.len(), 2);
        assert_eq!(report.issues.len(), 1);
        assert!(report.issues[0].record_ref.is_none());
        assert_eq!(report.issues[0].severity, Severity::Warn);
    }

    #[test]
    fn test_warn_rule_keeps_record_and_marks_it() {
        let rule = BusinessRule {
            id: "payments.completed_has_transaction".to_string(),
            severity: Severity::Warn,
            kind: RuleKind::RequiredWhen {
                column: "transaction_id".to_string(),
                when_column: "payment_status".to_string(),
                equals: "completed".to_string(),
            },
        };
        let engine = BusinessRuleEngine::new(vec![rule], vec![]).unwrap();
        let record = Record::from_pairs([
            ("payment_status", Value::String("completed".to_string())),
            ("transaction_id", Value::Null),
        ]);
        let report = engine.evaluate(tracked(vec![record]), &ReferenceData::new(), now());
        assert_eq!(report.survivors.len(), 1);
        assert!(report.survivors[0].warned);
        assert_eq!(report.warned, 1);
    }

    #[test]
    fn test_null_operands_skip_rule() {
        let rule = BusinessRule {
            id: "inventory.quantity_non_negative".to_string(),
            severity: Severity::Reject,
            kind: RuleKind::NonNegative {
                column: "quantity".to_string(),
            },
        };
        let engine = BusinessRuleEngine::new(vec![rule], vec![]).unwrap();
        let records = vec![
            Record::from_pairs([("quantity", Value::Null)]),
            Record::from_pairs([("quantity", Value::Int(-1))]),
        ];
        let report = engine.evaluate(tracked(records), &ReferenceData::new(), now());
        assert_eq!(report.survivors.len(), 1);
        assert_eq!(report.survivors[0].index, 0);
    }

    #[test]
    fn test_sum_and_line_total_rules() {
        let rules = vec![
            BusinessRule {
                id: "inventory.available".to_string(),
                severity: Severity::Reject,
                kind: RuleKind::SumEquals {
                    parts: vec!["quantity".to_string()],
                    subtract: vec!["reserved_quantity".to_string()],
                    total: "available_quantity".to_string(),
                    epsilon: 0.01,
                },
            },
            BusinessRule {
                id: "items.line_total".to_string(),
                severity: Severity::Reject,
                kind: RuleKind::LineTotalMatches {
                    quantity: "qty".to_string(),
                    unit_price: "price".to_string(),
                    discount: Some("discount".to_string()),
                    total: "line".to_string(),
                    epsilon: 0.01,
                },
            },
        ];
        let engine = BusinessRuleEngine::new(rules, vec![]).unwrap();
        let good = Record::from_pairs([
            ("quantity", Value::Int(10)),
            ("reserved_quantity", Value::Int(4)),
            ("available_quantity", Value::Int(6)),
            ("qty", Value::Int(3)),
            ("price", Value::Float(2.5)),
            ("discount", Value::Float(0.5)),
            ("line", Value::Float(7.0)),
        ]);
        let mut bad = good.clone();
        bad.set("available_quantity", Value::Int(7));
        let report = engine.evaluate(tracked(vec![good, bad]), &ReferenceData::new(), now());
        assert_eq!(report.survivors.len(), 1);
        assert_eq!(report.issues[0].rule_id, "inventory.available");
    }

    #[test]
    fn test_future_dates_and_references() {
        let rules = vec![
            BusinessRule {
                id: "orders.not_future".to_string(),
                severity: Severity::Reject,
                kind: RuleKind::NotInFuture {
                    column: "order_date".to_string(),
                },
            },
            BusinessRule {
                id: "orders.customer_exists".to_string(),
                severity: Severity::Reject,
                kind: RuleKind::ReferenceExists {
                    column: "customer_id".to_string(),
                    reference_table: "customers".to_string(),
                    reference_column: "customer_id".to_string(),
                },
            },
        ];
        let engine = BusinessRuleEngine::new(rules, vec![]).unwrap();
        let references = ReferenceData::from([(
            "customers".to_string(),
            vec![Record::from_pairs([("customer_id", Value::String("C1".to_string()))])],
        )]);
        let record = |date: &str, customer: &str| {
            Record::from_pairs([
                ("order_date", Value::String(date.to_string())),
                ("customer_id", Value::String(customer.to_string())),
            ])
        };
        let report = engine.evaluate(
            tracked(vec![
                record("2024-05-01", "C1"),
                record("2024-07-01", "C1"),
                record("2024-05-01", "C9"),
            ]),
            &references,
            now(),
        );
        assert_eq!(report.survivors.len(), 1);
        assert_eq!(report.rejected, 2);
    }

    #[test]
    fn test_invalid_rule_pattern_is_a_config_error() {
        let rule = BusinessRule {
            id: "bad".to_string(),
            severity: Severity::Reject,
            kind: RuleKind::Matches {
                column: "email".to_string(),
                pattern: "[".to_string(),
            },
        };
        assert!(BusinessRuleEngine::new(vec![rule], vec![]).is_err());
    }
}
