//! Batch quality scoring and the accept/quarantine checkpoint

pub mod profile;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::domain::Schema;
pub use profile::{profile, ColumnStats, QualityProfile};

const COMPLETENESS_WEIGHT: f64 = 0.3;
const VALIDITY_WEIGHT: f64 = 0.3;
const CONSISTENCY_WEIGHT: f64 = 0.2;
const UNIQUENESS_WEIGHT: f64 = 0.2;

/// Counts gathered along stage 1 that feed the composite score.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QualityInputs {
    /// Records as read
    pub read: usize,
    /// Records surviving schema validation and business rules
    pub validated: usize,
    /// Validated records carrying at least one warn-level issue
    pub warned: usize,
    /// Records removed by deduplication
    pub duplicates: usize,
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        1.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Composite quality score and its four components, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    pub composite: f64,
    pub completeness: f64,
    pub validity: f64,
    pub consistency: f64,
    pub uniqueness: f64,
}

impl QualityScore {
    pub fn compute(profile: &QualityProfile, inputs: &QualityInputs) -> Self {
        let completeness = profile.completeness();
        let validity = ratio(inputs.validated, inputs.read);
        let consistency = ratio(inputs.validated.saturating_sub(inputs.warned), inputs.validated);
        let uniqueness = ratio(inputs.validated.saturating_sub(inputs.duplicates), inputs.validated);
        let composite = COMPLETENESS_WEIGHT * completeness
            + VALIDITY_WEIGHT * validity
            + CONSISTENCY_WEIGHT * consistency
            + UNIQUENESS_WEIGHT * uniqueness;
        Self {
            composite: composite.clamp(0.0, 1.0),
            completeness,
            validity,
            consistency,
            uniqueness,
        }
    }
}

/// Quality Gate decision for a batch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QualityDecision {
    /// Batch meets quality standards and is written to the curated layer
    Accept,
    /// Batch is written, but its score is below the warning threshold
    AcceptWithWarnings,
    /// Batch fails quality checks and is quarantined for review
    Quarantine,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub decision: QualityDecision,
    pub score: QualityScore,
    pub reasons: Vec<String>,
}

/// Configuration for Quality Gate thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityGateConfig {
    pub fail_threshold: f64,
    pub warn_threshold: f64,
}

impl Default for QualityGateConfig {
    fn default() -> Self {
        Self {
            fail_threshold: 0.70,
            warn_threshold: 0.90,
        }
    }
}

/// Trait for implementing Quality Gate assessment logic
pub trait QualityGate {
    fn assess(
        &self,
        schema: &Schema,
        profile: &QualityProfile,
        score: QualityScore,
        survivors: usize,
    ) -> QualityAssessment;
}

pub struct DefaultQualityGate {
    pub config: QualityGateConfig,
}

impl DefaultQualityGate {
    pub fn new() -> Self {
        Self {
            config: QualityGateConfig::default(),
        }
    }

    pub fn with_config(config: QualityGateConfig) -> Self {
        Self { config }
    }
}

impl Default for DefaultQualityGate {
    fn default() -> Self {
        Self::new()
    }
}

impl QualityGate for DefaultQualityGate {
    #[instrument(skip_all, fields(composite = score.composite, survivors = survivors))]
    fn assess(
        &self,
        schema: &Schema,
        profile: &QualityProfile,
        score: QualityScore,
        survivors: usize,
    ) -> QualityAssessment {
        let fail = self.config.fail_threshold;
        let mut reasons = Vec::new();

        if score.composite < fail {
            reasons.push(format!(
                "composite score {:.3} below fail threshold {fail:.2}",
                score.composite
            ));
        }
        for spec in schema.columns.iter().filter(|c| !c.nullable) {
            if let Some(stats) = profile.column(&spec.name) {
                let completeness = stats.completeness();
                if completeness < fail {
                    reasons.push(format!(
                        "required column '{}' only {:.1}% complete",
                        spec.name,
                        completeness * 100.0
                    ));
                }
            }
        }
        if profile.row_count > 0 && survivors == 0 {
            reasons.push("no record survived validation".to_string());
        }

        let decision = if !reasons.is_empty() {
            warn!(reasons = ?reasons, "Batch quarantined by quality gate");
            QualityDecision::Quarantine
        } else if score.composite < self.config.warn_threshold {
            reasons.push(format!(
                "composite score {:.3} below warn threshold {:.2}",
                score.composite, self.config.warn_threshold
            ));
            QualityDecision::AcceptWithWarnings
        } else {
            QualityDecision::Accept
        };

        info!(decision = ?decision, "Quality gate assessment complete");
        QualityAssessment {
            decision,
            score,
            reasons,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ColumnSpec, ColumnType, Record, Value};

    fn schema() -> Schema {
        Schema {
            table_name: "orders".to_string(),
            version: "v1".to_string(),
            columns: vec![
                ColumnSpec::required("order_id", ColumnType::String),
                ColumnSpec::required("customer_id", ColumnType::String),
                ColumnSpec::optional("notes", ColumnType::String),
            ],
        }
    }

    fn rows(n: usize, missing_customer: usize) -> Vec<Record> {
        (0..n)
            .map(|i| {
                let customer = if i < missing_customer {
                    Value::Null
                } else {
                    Value::String(format!("C{i}"))
                };
                Record::from_pairs([
                    ("order_id", Value::String(format!("O{i}"))),
                    ("customer_id", customer),
                    ("notes", Value::String("ok".to_string())),
                ])
            })
            .collect()
    }

    #[test]
    fn test_weights_sum_to_one() {
        let total = COMPLETENESS_WEIGHT + VALIDITY_WEIGHT + CONSISTENCY_WEIGHT + UNIQUENESS_WEIGHT;
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_perfect_batch_scores_one_and_is_accepted() {
        let records = rows(20, 0);
        let profile = profile(&records, &schema(), &[]);
        let inputs = QualityInputs { read: 20, validated: 20, warned: 0, duplicates: 0 };
        let score = QualityScore::compute(&profile, &inputs);
        assert!((score.composite - 1.0).abs() < 1e-12);
        let verdict = DefaultQualityGate::new().assess(&schema(), &profile, score, 20);
        assert_eq!(verdict.decision, QualityDecision::Accept);
        assert!(verdict.reasons.is_empty());
    }

    #[test]
    fn test_components() {
        let records = rows(10, 0);
        let profile = profile(&records, &schema(), &[]);
        let inputs = QualityInputs { read: 10, validated: 8, warned: 2, duplicates: 2 };
        let score = QualityScore::compute(&profile, &inputs);
        assert!((score.validity - 0.8).abs() < 1e-12);
        assert!((score.consistency - 0.75).abs() < 1e-12);
        assert!((score.uniqueness - 0.75).abs() < 1e-12);
        let expected = 0.3 * 1.0 + 0.3 * 0.8 + 0.2 * 0.75 + 0.2 * 0.75;
        assert!((score.composite - expected).abs() < 1e-12);
    }

    #[test]
    fn test_empty_batch_scores_one() {
        let profile = profile(&[], &schema(), &[]);
        let score = QualityScore::compute(&profile, &QualityInputs::default());
        assert_eq!(score.composite, 1.0);
        let verdict = DefaultQualityGate::new().assess(&schema(), &profile, score, 0);
        assert_eq!(verdict.decision, QualityDecision::Accept);
    }

    #[test]
    fn test_sparse_required_column_quarantines() {
        // 35% of customer_id missing; those rows fail validation
        let records = rows(100, 35);
        let profile = profile(&records, &schema(), &[]);
        let inputs = QualityInputs { read: 100, validated: 65, warned: 0, duplicates: 0 };
        let score = QualityScore::compute(&profile, &inputs);
        assert!(score.composite > 0.70);
        let verdict = DefaultQualityGate::new().assess(&schema(), &profile, score, 65);
        assert_eq!(verdict.decision, QualityDecision::Quarantine);
        assert!(verdict.reasons[0].contains("customer_id"));
    }

    #[test]
    fn test_warn_band() {
        let records = rows(10, 0);
        let profile = profile(&records, &schema(), &[]);
        let inputs = QualityInputs { read: 10, validated: 8, warned: 4, duplicates: 0 };
        let score = QualityScore::compute(&profile, &inputs);
        assert!(score.composite >= 0.70 && score.composite < 0.90);
        let verdict = DefaultQualityGate::new().assess(&schema(), &profile, score, 8);
        assert_eq!(verdict.decision, QualityDecision::AcceptWithWarnings);
    }

    #[test]
    fn test_no_survivors_quarantines() {
        let records = rows(10, 0);
        let profile = profile(&records, &schema(), &[]);
        let score = QualityScore::compute(
            &profile,
            &QualityInputs { read: 10, validated: 10, warned: 0, duplicates: 0 },
        );
        let verdict = DefaultQualityGate::new().assess(&schema(), &profile, score, 0);
        assert_eq!(verdict.decision, QualityDecision::Quarantine);
    }
}
