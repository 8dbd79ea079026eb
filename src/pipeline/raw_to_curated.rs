//! Stage 1: raw extract to curated batch.
//!
//! read, profile, validate, rules, dedup, mask, anomaly, score and gate,
//! then commit (or quarantine) and announce.

use chrono::{DateTime, Utc};
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

use crate::common::error::{PipelineError, Result};
use crate::config::PipelineConfig;
use crate::domain::{Batch, CuratedRecord, ValidationIssue};
use crate::observability::metrics;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::ingestion::extract_reader::{read_extract, read_references, ExtractRequest};
use crate::pipeline::outcome::{BatchCounts, PipelineOutcome, PipelineStatus};
use crate::pipeline::processing::anomaly::AnomalyDetector;
use crate::pipeline::processing::business_rules::ReferenceData;
use crate::pipeline::processing::dedup::{deduplicate, DedupOutcome};
use crate::pipeline::processing::quality_gate::{
    profile, QualityAssessment, QualityDecision, QualityGate, QualityInputs, QualityProfile, QualityScore,
};
use crate::pipeline::processing::schema_validator::passthrough;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::storage::curated_writer::{CuratedDocument, CuratedWriter, QuarantineDocument, ReadErrorDocument};
use crate::registry::ResolvedTable;

/// Everything stage 1 decides about a batch before anything is written.
#[derive(Debug, Clone)]
pub struct Curation {
    pub counts: BatchCounts,
    pub issues: Vec<ValidationIssue>,
    pub profile: QualityProfile,
    pub assessment: QualityAssessment,
    pub records: Vec<CuratedRecord>,
}

fn timed<T>(stage: &'static str, f: impl FnOnce() -> T) -> T {
    let started = Instant::now();
    let out = f();
    metrics::pipeline::stage_duration(stage, started.elapsed().as_secs_f64());
    out
}

/// The pure part of stage 1. Deterministic for a given batch, references,
/// configuration and `now`.
#[instrument(skip_all, fields(table = %batch.table_name, batch_id = %batch.batch_id, records = batch.len()))]
pub fn curate(
    table: &ResolvedTable,
    config: &PipelineConfig,
    gate: &dyn QualityGate,
    batch: &Batch,
    references: &ReferenceData,
    now: DateTime<Utc>,
) -> Curation {
    let schema = table.schema();
    let keys = table.key_columns();
    let table_name = batch.table_name.as_str();
    let mut counts = BatchCounts {
        read: batch.len(),
        ..BatchCounts::default()
    };
    let mut issues = Vec::new();

    let raw_profile = timed("profile", || profile(&batch.records, schema, keys));

    // Validation
    let (validated, schema_rejected) = timed("validate", || {
        if config.validation_enabled {
            let report = table.validator.validate(batch);
            let rejected = report.rejected;
            issues.extend(report.issues);
            let rules = table.rules.evaluate(report.valid, references, now);
            counts.rule_rejected = rules.rejected;
            issues.extend(rules.issues);
            (rules.survivors, rejected)
        } else {
            warn!("Validation disabled, records are only retyped");
            (passthrough(batch, schema).valid, 0)
        }
    });
    counts.schema_rejected = schema_rejected;
    counts.warned = validated.iter().filter(|t| t.warned).count();
    metrics::validation::records_rejected(table_name, "schema", counts.schema_rejected);
    metrics::validation::records_rejected(table_name, "rules", counts.rule_rejected);
    let validated_count = validated.len();

    // Dedup
    let timestamp_column = table.bundle.timestamp_column.as_deref().unwrap_or_default();
    let dedup = timed("dedup", || {
        if config.deduplication_enabled {
            deduplicate(validated, keys, timestamp_column)
        } else {
            DedupOutcome {
                records: validated,
                ..DedupOutcome::default()
            }
        }
    });
    counts.duplicates = dedup.duplicate_count;
    counts.dedup_conflicts = dedup.conflicts.len();
    issues.extend(dedup.conflicts);
    metrics::dedup::duplicates_removed(table_name, counts.duplicates);
    metrics::dedup::conflicts(table_name, counts.dedup_conflicts);

    // Masking
    let survivors = timed("mask", || {
        if config.masking_enabled {
            let masked = table.masker.apply(dedup.records);
            counts.mask_dropped = masked.dropped;
            issues.extend(masked.issues);
            masked.records
        } else {
            if !table.masker.policy().is_empty() {
                warn!("Masking disabled, sensitive columns are written as read");
            }
            dedup.records
        }
    });
    metrics::masking::records_dropped(table_name, counts.mask_dropped);

    // Anomaly annotation
    let records: Vec<_> = survivors.into_iter().map(|t| t.record).collect();
    let detector = AnomalyDetector::new(config.anomaly.clone());
    let anomalies = timed("anomaly", || detector.detect(&records, schema, keys));
    counts.anomalies = anomalies.iter().filter(|a| a.is_anomaly).count();
    metrics::anomaly::records_flagged(table_name, counts.anomalies);

    // Score and gate, after dedup and masking
    let score = QualityScore::compute(
        &raw_profile,
        &QualityInputs {
            read: counts.read,
            validated: validated_count,
            warned: counts.warned,
            duplicates: counts.duplicates,
        },
    );
    let assessment = gate.assess(schema, &raw_profile, score, records.len());
    metrics::quality::score(table_name, score.composite);

    let records = records
        .into_iter()
        .zip(anomalies)
        .map(|(record, anomaly)| CuratedRecord {
            record,
            quality_score: score.composite,
            is_anomaly: anomaly.is_anomaly,
            anomaly_score: anomaly.anomaly_score,
            processed_at: now,
        })
        .collect();

    info!(
        read = counts.read,
        schema_rejected = counts.schema_rejected,
        rule_rejected = counts.rule_rejected,
        duplicates = counts.duplicates,
        mask_dropped = counts.mask_dropped,
        anomalies = counts.anomalies,
        composite = score.composite,
        decision = ?assessment.decision,
        "Batch curated"
    );

    Curation {
        counts,
        issues,
        profile: raw_profile,
        assessment,
        records,
    }
}

async fn read_inputs(
    ctx: &PipelineContext,
    request: &ExtractRequest,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<(Batch, ReferenceData)> {
    let today = now.date_naive();
    let batch = read_extract(ctx.store.as_ref(), request, policy, today).await?;
    metrics::extract::records_read(&batch.table_name, batch.len());
    let references = read_references(ctx.store.as_ref(), request, policy, today).await?;
    Ok((batch, references))
}

/// A read error that survived its retries diverts the extract to quarantine.
/// The marker names the locator and the error, never any of its contents.
async fn quarantine_unreadable(
    writer: &CuratedWriter,
    request: &ExtractRequest,
    error: PipelineError,
) -> Result<PipelineOutcome> {
    let document = ReadErrorDocument {
        table_name: request.table_name.clone(),
        schema_version: request.schema_version.clone(),
        locator: request.locator.clone(),
        error: error.to_string(),
        retryable: error.is_retryable(),
    };
    let key = writer.write_read_error(&document).await?;
    let mut outcome = PipelineOutcome::failed(&request.table_name, &request.locator, document.error);
    outcome.status = PipelineStatus::Quarantined;
    outcome.object_key = Some(key);
    Ok(outcome)
}

async fn try_process(ctx: &PipelineContext, request: &ExtractRequest, now: DateTime<Utc>) -> Result<PipelineOutcome> {
    let table = ctx.registry.get(&request.table_name)?;
    if request.schema_version != table.schema().version {
        warn!(
            requested = %request.schema_version,
            registered = %table.schema().version,
            "Schema version differs from the registered bundle"
        );
    }

    let policy = ctx.retry_policy();
    let writer = CuratedWriter::new(ctx.store.clone(), ctx.events.clone(), policy);
    let (batch, references) = match read_inputs(ctx, request, &policy, now).await {
        Ok(inputs) => inputs,
        Err(e @ PipelineError::Read { .. }) => return quarantine_unreadable(&writer, request, e).await,
        Err(e) => return Err(e),
    };

    let curation = curate(&table, &ctx.config, ctx.gate.as_ref(), &batch, &references, now);
    writer.write_issues(&batch.table_name, &batch.batch_id, &curation.issues).await?;

    let mut outcome = PipelineOutcome {
        table_name: batch.table_name.clone(),
        locator: batch.locator.clone(),
        batch_id: Some(batch.batch_id.clone()),
        status: PipelineStatus::Success,
        counts: curation.counts,
        quality: Some(curation.assessment.clone()),
        issues: curation.issues,
        object_key: None,
        error: None,
        event: None,
    };

    if curation.assessment.decision == QualityDecision::Quarantine {
        let document = QuarantineDocument {
            table_name: batch.table_name.clone(),
            schema_version: batch.schema_version.clone(),
            batch_id: batch.batch_id.clone(),
            locator: batch.locator.clone(),
            assessment: curation.assessment.clone(),
            profile: curation.profile,
            counts: curation.counts,
            records: curation.records.into_iter().map(|c| c.record).collect(),
        };
        let key = writer.write_quarantine(&document).await?;
        let gate_failure = PipelineError::QualityGate {
            batch_id: batch.batch_id.clone(),
            reason: curation.assessment.reasons.join("; "),
        };
        outcome.status = PipelineStatus::Quarantined;
        outcome.object_key = Some(key);
        outcome.error = Some(gate_failure.to_string());
        return Ok(outcome);
    }

    if curation.records.is_empty() {
        info!("Empty extract, nothing to commit");
        return Ok(outcome);
    }

    let document = CuratedDocument {
        table_name: batch.table_name.clone(),
        schema_version: batch.schema_version.clone(),
        batch_id: batch.batch_id.clone(),
        source_partition_key: batch.source_partition_key.clone(),
        quality_score: curation.assessment.score.composite,
        processed_at: now,
        records: curation.records,
    };
    let event = writer.write_curated(&document).await?;
    outcome.counts.written = event.record_count;
    outcome.object_key = Some(event.object_key.clone());
    outcome.event = Some(event);
    metrics::pipeline::records_curated(&batch.table_name, outcome.counts.written);
    Ok(outcome)
}

/// Run stage 1 for one extract. Never returns an error: failures become a
/// `failed` outcome so sibling batches carry on.
#[instrument(skip_all, fields(table = %request.table_name, locator = %request.locator))]
pub async fn process_batch(ctx: &PipelineContext, request: &ExtractRequest, now: DateTime<Utc>) -> PipelineOutcome {
    let outcome = match try_process(ctx, request, now).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(error = %e, retryable = e.is_retryable(), "Batch failed");
            PipelineOutcome::failed(&request.table_name, &request.locator, e.to_string())
        }
    };
    metrics::pipeline::batch_completed(&outcome.table_name, outcome.status.as_str());
    info!(
        status = outcome.status.as_str(),
        quality_score = ?outcome.quality_score(),
        object_key = ?outcome.object_key,
        "Stage 1 finished"
    );
    outcome
}

/// Process every request concurrently, one task per batch. Results come back
/// in request order.
pub async fn process_manifest(
    ctx: &PipelineContext,
    requests: Vec<ExtractRequest>,
    now: DateTime<Utc>,
) -> Vec<PipelineOutcome> {
    let mut tasks = JoinSet::new();
    for (position, request) in requests.iter().cloned().enumerate() {
        let ctx = ctx.clone();
        tasks.spawn(async move { (position, process_batch(&ctx, &request, now).await) });
    }

    let mut slots: Vec<Option<PipelineOutcome>> = vec![None; requests.len()];
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((position, outcome)) => slots[position] = Some(outcome),
            Err(e) => error!(error = %e, "Batch task aborted"),
        }
    }

    slots
        .into_iter()
        .zip(&requests)
        .map(|(slot, request)| {
            slot.unwrap_or_else(|| {
                PipelineOutcome::failed(&request.table_name, &request.locator, "batch task aborted".to_string())
            })
        })
        .collect()
}
