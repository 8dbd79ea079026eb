//! Unsupervised outlier flagging over a batch's numeric columns.
//!
//! Features are median-filled and standardized per batch, scored by a
//! pluggable [`OutlierScorer`], and exactly the top `round(contamination·n)`
//! records are flagged. Records are annotated, never dropped.

pub mod isolation_forest;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::config::AnomalyConfig;
use crate::domain::{Record, Schema};
pub use isolation_forest::IsolationForest;

/// Row-major numeric features, one row per record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureMatrix {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl FeatureMatrix {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() || self.rows.is_empty()
    }
}

/// A fitted outlier model. Higher scores are more anomalous.
pub trait OutlierModel: Send + Sync {
    fn score(&self, matrix: &FeatureMatrix) -> Vec<f64>;
}

pub trait OutlierScorer: Send + Sync {
    fn name(&self) -> &'static str;
    fn fit(&self, matrix: &FeatureMatrix) -> Box<dyn OutlierModel>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub is_anomaly: bool,
    pub anomaly_score: f64,
}

impl AnomalyResult {
    pub const NOT_SCORED: AnomalyResult = AnomalyResult {
        is_anomaly: false,
        anomaly_score: 0.0,
    };
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

/// Build the standardized feature matrix from the schema's numeric columns,
/// leaving out key columns.
pub fn build_features(records: &[Record], schema: &Schema, key_columns: &[String]) -> FeatureMatrix {
    let specs: Vec<_> = schema
        .columns
        .iter()
        .filter(|c| c.column_type.is_numeric() && !key_columns.contains(&c.name))
        .collect();

    let mut columns = Vec::with_capacity(specs.len());
    let mut data: Vec<Vec<f64>> = Vec::with_capacity(specs.len());
    for spec in specs {
        let raw: Vec<Option<f64>> = records
            .iter()
            .map(|r| r.get(&spec.name).and_then(|v| spec.column_type.coerce(v)).and_then(|v| v.as_f64()))
            .collect();
        let mut present: Vec<f64> = raw.iter().flatten().copied().collect();
        let fill = median(&mut present).unwrap_or(0.0);
        let filled: Vec<f64> = raw.into_iter().map(|v| v.unwrap_or(fill)).collect();

        let n = filled.len().max(1) as f64;
        let mean = filled.iter().sum::<f64>() / n;
        let std = (filled.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
        let standardized = filled
            .iter()
            .map(|v| if std > f64::EPSILON { (v - mean) / std } else { 0.0 })
            .collect();

        columns.push(spec.name.clone());
        data.push(standardized);
    }

    let rows = (0..records.len())
        .map(|i| data.iter().map(|column| column[i]).collect())
        .collect();
    FeatureMatrix { columns, rows }
}

pub struct AnomalyDetector {
    config: AnomalyConfig,
    scorer: Box<dyn OutlierScorer>,
}

impl AnomalyDetector {
    /// Detector backed by an isolation forest seeded from configuration.
    pub fn new(config: AnomalyConfig) -> Self {
        let scorer = IsolationForest {
            trees: config.trees,
            sample_size: config.sample_size,
            seed: config.seed,
        };
        Self::with_scorer(config, Box::new(scorer))
    }

    pub fn with_scorer(config: AnomalyConfig, scorer: Box<dyn OutlierScorer>) -> Self {
        Self { config, scorer }
    }

    #[instrument(skip_all, fields(records = records.len(), scorer = self.scorer.name()))]
    pub fn detect(&self, records: &[Record], schema: &Schema, key_columns: &[String]) -> Vec<AnomalyResult> {
        let n = records.len();
        if n < self.config.min_records {
            debug!(min_records = self.config.min_records, "Batch too small for anomaly scoring");
            return vec![AnomalyResult::NOT_SCORED; n];
        }
        let features = build_features(records, schema, key_columns);
        if features.is_empty() {
            debug!("No numeric feature columns, skipping anomaly scoring");
            return vec![AnomalyResult::NOT_SCORED; n];
        }

        let model = self.scorer.fit(&features);
        let scores = model.score(&features);
        let flagged = top_k(&scores, self.config.contamination_rate);

        let results: Vec<AnomalyResult> = scores
            .iter()
            .zip(flagged)
            .map(|(score, is_anomaly)| AnomalyResult {
                is_anomaly,
                anomaly_score: *score,
            })
            .collect();
        info!(
            features = features.columns.len(),
            anomalies = results.iter().filter(|r| r.is_anomaly).count(),
            "Anomaly detection complete"
        );
        results
    }
}

/// Flags exactly the `round(contamination·n)` highest scores; earlier rows
/// win ties.
fn top_k(scores: &[f64], contamination: f64) -> Vec<bool> {
    let n = scores.len();
    let k = ((contamination * n as f64).round() as usize).min(n);
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
    let mut flagged = vec![false; n];
    for &i in order.iter().take(k) {
        flagged[i] = true;
    }
    flagged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ColumnSpec, ColumnType, Value};

    fn schema() -> Schema {
        Schema {
            table_name: "order_items".to_string(),
            version: "v1".to_string(),
            columns: vec![
                ColumnSpec::required("item_id", ColumnType::Int),
                ColumnSpec::required("quantity", ColumnType::Int),
                ColumnSpec::required("unit_price", ColumnType::Float),
                ColumnSpec::optional("sku", ColumnType::String),
            ],
        }
    }

    fn keys() -> Vec<String> {
        vec!["item_id".to_string()]
    }

    fn item(id: i64, quantity: i64, price: f64) -> Record {
        Record::from_pairs([
            ("item_id", Value::Int(id)),
            ("quantity", Value::Int(quantity)),
            ("unit_price", Value::Float(price)),
            ("sku", Value::String("S".to_string())),
        ])
    }

    /// 1000 records, every tenth one scaled tenfold.
    fn injected() -> Vec<Record> {
        (0..1000)
            .map(|i| {
                let quantity = 5 + (i * 7919 % 11) as i64;
                let price = 20.0 + ((i * 104_729) % 17) as f64;
                if i % 10 == 0 {
                    item(i as i64, quantity * 10, price * 10.0)
                } else {
                    item(i as i64, quantity, price)
                }
            })
            .collect()
    }

    #[test]
    fn test_features_exclude_keys_and_fill_missing() {
        let mut records = vec![item(1, 1, 10.0), item(2, 3, 30.0), item(3, 5, 20.0)];
        records[1].set("unit_price", Value::Null);
        let m = build_features(&records, &schema(), &keys());
        assert_eq!(m.columns, vec!["quantity", "unit_price"]);
        // median fill puts row 1 on the column mean, so it standardizes to 0
        assert!(m.rows[1][1].abs() < 1e-9);
        let mean: f64 = m.rows.iter().map(|r| r[0]).sum::<f64>() / 3.0;
        assert!(mean.abs() < 1e-9);
    }

    #[test]
    fn test_small_batches_are_not_scored() {
        let records: Vec<Record> = (0..9).map(|i| item(i, 1, 1.0)).collect();
        let results = AnomalyDetector::new(AnomalyConfig::default()).detect(&records, &schema(), &keys());
        assert!(results.iter().all(|r| *r == AnomalyResult::NOT_SCORED));
    }

    #[test]
    fn test_injected_outliers_are_flagged() {
        let records = injected();
        let results = AnomalyDetector::new(AnomalyConfig::default()).detect(&records, &schema(), &keys());
        let flagged: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_anomaly)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(flagged.len(), 100);
        let hits = flagged.iter().filter(|i| *i % 10 == 0).count();
        assert!(hits >= 90, "only {hits} of 100 injected outliers flagged");
    }

    #[test]
    fn test_detection_is_stable_under_fixed_seed() {
        let records = injected();
        let detector = AnomalyDetector::new(AnomalyConfig::default());
        assert_eq!(
            detector.detect(&records, &schema(), &keys()),
            detector.detect(&records, &schema(), &keys())
        );
    }

    #[test]
    fn test_top_k_breaks_ties_by_row_order() {
        assert_eq!(top_k(&[0.5, 0.9, 0.9, 0.1], 0.5), vec![false, true, true, false]);
        assert_eq!(top_k(&[0.7, 0.7, 0.7, 0.7], 0.25), vec![true, false, false, false]);
        assert_eq!(top_k(&[], 0.1), Vec::<bool>::new());
    }

    struct Constant;
    struct ConstantModel;

    impl OutlierModel for ConstantModel {
        fn score(&self, matrix: &FeatureMatrix) -> Vec<f64> {
            vec![0.5; matrix.rows.len()]
        }
    }

    impl OutlierScorer for Constant {
        fn name(&self) -> &'static str {
            "constant"
        }

        fn fit(&self, _matrix: &FeatureMatrix) -> Box<dyn OutlierModel> {
            Box::new(ConstantModel)
        }
    }

    #[test]
    fn test_scorer_is_pluggable() {
        let records: Vec<Record> = (0..20).map(|i| item(i, i, 1.0)).collect();
        let detector = AnomalyDetector::with_scorer(AnomalyConfig::default(), Box::new(Constant));
        let results = detector.detect(&records, &schema(), &keys());
        assert_eq!(results.iter().filter(|r| r.is_anomaly).count(), 2);
        assert!(results[0].is_anomaly && results[1].is_anomaly);
    }
}
