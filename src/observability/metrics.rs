//! Pipeline metrics, recorded through the `metrics` facade and exposed in
//! Prometheus text format.
//!
//! Without an installed recorder every call is a no-op, so library code and
//! tests record unconditionally.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::fmt;
use tracing::info;

/// Every metric the pipeline emits. No metric name appears as a bare string
/// anywhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Stage 1
    RecordsRead,
    RecordsRejected,
    RecordsDeduplicated,
    DedupConflicts,
    RecordsMaskDropped,
    RecordsAnomalous,
    RecordsCurated,
    QualityScore,
    BatchesCompleted,
    StageDuration,

    // Stage 2
    PartitionsWritten,
    ProdRecordsWritten,
    CatalogNotifications,

    // I/O
    RetriesAttempted,
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::RecordsRead => "curator_records_read_total",
            MetricName::RecordsRejected => "curator_records_rejected_total",
            MetricName::RecordsDeduplicated => "curator_records_deduplicated_total",
            MetricName::DedupConflicts => "curator_dedup_conflicts_total",
            MetricName::RecordsMaskDropped => "curator_records_mask_dropped_total",
            MetricName::RecordsAnomalous => "curator_records_anomalous_total",
            MetricName::RecordsCurated => "curator_records_curated_total",
            MetricName::QualityScore => "curator_quality_score",
            MetricName::BatchesCompleted => "curator_batches_completed_total",
            MetricName::StageDuration => "curator_stage_duration_seconds",
            MetricName::PartitionsWritten => "curator_partitions_written_total",
            MetricName::ProdRecordsWritten => "curator_prod_records_written_total",
            MetricName::CatalogNotifications => "curator_catalog_notifications_total",
            MetricName::RetriesAttempted => "curator_retries_attempted_total",
        }
    }

    pub fn all_metrics() -> impl Iterator<Item = MetricName> {
        use MetricName::*;
        [
            RecordsRead,
            RecordsRejected,
            RecordsDeduplicated,
            DedupConflicts,
            RecordsMaskDropped,
            RecordsAnomalous,
            RecordsCurated,
            QualityScore,
            BatchesCompleted,
            StageDuration,
            PartitionsWritten,
            ProdRecordsWritten,
            CatalogNotifications,
            RetriesAttempted,
        ]
        .into_iter()
    }

    /// Help text published with the exposition.
    pub fn description(&self) -> &'static str {
        match self {
            MetricName::RecordsRead => "Records parsed from raw extracts",
            MetricName::RecordsRejected => "Records dropped by validation, by stage",
            MetricName::RecordsDeduplicated => "Records removed as superseded duplicates",
            MetricName::DedupConflicts => "Duplicate keys resolved on a timestamp tie",
            MetricName::RecordsMaskDropped => "Records dropped because a sensitive value could not be masked",
            MetricName::RecordsAnomalous => "Records flagged by the anomaly detector",
            MetricName::RecordsCurated => "Records committed to the curated layer",
            MetricName::QualityScore => "Composite quality score per batch",
            MetricName::BatchesCompleted => "Stage 1 batches by final status",
            MetricName::StageDuration => "Wall time per pipeline stage",
            MetricName::PartitionsWritten => "Prod partition objects written",
            MetricName::ProdRecordsWritten => "Records written to the prod layer",
            MetricName::CatalogNotifications => "Catalog refresh notifications by result",
            MetricName::RetriesAttempted => "Transient I/O failures retried, by operation",
        }
    }

    fn is_histogram(&self) -> bool {
        matches!(self, MetricName::QualityScore | MetricName::StageDuration)
    }
}

static HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder. Safe to call more than once.
pub fn init() -> anyhow::Result<()> {
    if HANDLE.get().is_some() {
        return Ok(());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))?;

    for name in MetricName::all_metrics() {
        if name.is_histogram() {
            ::metrics::describe_histogram!(name.as_str(), name.description());
        } else {
            ::metrics::describe_counter!(name.as_str(), name.description());
        }
    }

    let _ = HANDLE.set(handle);
    info!("Metrics recorder installed");
    Ok(())
}

/// Current exposition text, when the recorder is installed.
pub fn render() -> Option<String> {
    HANDLE.get().map(PrometheusHandle::render)
}

// ============================================================================
// Stage 1
// ============================================================================

pub mod extract {
    use super::MetricName;

    pub fn records_read(table: &str, count: usize) {
        ::metrics::counter!(MetricName::RecordsRead.as_str(), "table" => table.to_string())
            .increment(count as u64);
    }
}

pub mod validation {
    use super::MetricName;

    /// `stage` is `schema`, `rules` or `masking`.
    pub fn records_rejected(table: &str, stage: &'static str, count: usize) {
        if count == 0 {
            return;
        }
        ::metrics::counter!(
            MetricName::RecordsRejected.as_str(),
            "table" => table.to_string(),
            "stage" => stage
        )
        .increment(count as u64);
    }
}

pub mod dedup {
    use super::MetricName;

    pub fn duplicates_removed(table: &str, count: usize) {
        ::metrics::counter!(MetricName::RecordsDeduplicated.as_str(), "table" => table.to_string())
            .increment(count as u64);
    }

    pub fn conflicts(table: &str, count: usize) {
        ::metrics::counter!(MetricName::DedupConflicts.as_str(), "table" => table.to_string())
            .increment(count as u64);
    }
}

pub mod masking {
    use super::MetricName;

    pub fn records_dropped(table: &str, count: usize) {
        ::metrics::counter!(MetricName::RecordsMaskDropped.as_str(), "table" => table.to_string())
            .increment(count as u64);
    }
}

pub mod anomaly {
    use super::MetricName;

    pub fn records_flagged(table: &str, count: usize) {
        ::metrics::counter!(MetricName::RecordsAnomalous.as_str(), "table" => table.to_string())
            .increment(count as u64);
    }
}

pub mod quality {
    use super::MetricName;

    pub fn score(table: &str, composite: f64) {
        ::metrics::histogram!(MetricName::QualityScore.as_str(), "table" => table.to_string())
            .record(composite);
    }
}

pub mod pipeline {
    use super::MetricName;

    pub fn records_curated(table: &str, count: usize) {
        ::metrics::counter!(MetricName::RecordsCurated.as_str(), "table" => table.to_string())
            .increment(count as u64);
    }

    /// `status` is `success`, `quarantined` or `failed`.
    pub fn batch_completed(table: &str, status: &'static str) {
        ::metrics::counter!(
            MetricName::BatchesCompleted.as_str(),
            "table" => table.to_string(),
            "status" => status
        )
        .increment(1);
    }

    pub fn stage_duration(stage: &'static str, secs: f64) {
        ::metrics::histogram!(MetricName::StageDuration.as_str(), "stage" => stage).record(secs);
    }

    pub fn retry_attempted(operation: &str) {
        ::metrics::counter!(MetricName::RetriesAttempted.as_str(), "operation" => operation.to_string())
            .increment(1);
    }
}

// ============================================================================
// Stage 2
// ============================================================================

pub mod prod {
    use super::MetricName;

    pub fn partition_written(table: &str, records: usize) {
        ::metrics::counter!(MetricName::PartitionsWritten.as_str(), "table" => table.to_string())
            .increment(1);
        ::metrics::counter!(MetricName::ProdRecordsWritten.as_str(), "table" => table.to_string())
            .increment(records as u64);
    }

    pub fn catalog_notified(table: &str, ok: bool) {
        let result = if ok { "success" } else { "error" };
        ::metrics::counter!(
            MetricName::CatalogNotifications.as_str(),
            "table" => table.to_string(),
            "result" => result
        )
        .increment(1);
    }
}
