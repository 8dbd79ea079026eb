//! Stage 2: curated batches to analytics partitions.

use std::collections::BTreeSet;
use tracing::{error, info, instrument};

use crate::common::constants::CURATED_PREFIX;
use crate::common::error::{PipelineError, Result};
use crate::domain::{CuratedRecord, Record, Value};
use crate::observability::metrics;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::events::CompletionEvent;
use crate::pipeline::outcome::ProdOutcome;
use crate::pipeline::retry::with_retry;
use crate::pipeline::storage::curated_writer::{read_curated, CuratedDocument};
use crate::pipeline::storage::partition_writer::{group_partitions, PartitionWriter};
use crate::registry::{PartitionKey, ResolvedTable};

/// Partition directory for one curated record, e.g. `ingest_date=2024-01-15`.
pub fn partition_for(partition: &PartitionKey, curated: &CuratedRecord, record: &Record) -> String {
    match partition {
        PartitionKey::IngestDate => format!("ingest_date={}", curated.processed_at.format("%Y-%m-%d")),
        PartitionKey::Column(column) => match record.update_timestamp(column) {
            Some(ts) => format!("{column}={}", ts.format("%Y-%m-%d")),
            None => format!("{column}=unknown"),
        },
    }
}

/// Typed, transformed and annotated row as written to prod.
pub fn prod_row(table: &ResolvedTable, curated: &CuratedRecord) -> Record {
    let mut record = curated.record.clone();
    table.schema().retype(&mut record);
    table.bundle.transform.apply(&mut record, curated.processed_at);
    record.set("quality_score", Value::Float(curated.quality_score));
    record.set("is_anomaly", Value::Bool(curated.is_anomaly));
    record.set("anomaly_score", Value::Float(curated.anomaly_score));
    record.set("processed_at", Value::Timestamp(curated.processed_at));
    record
}

async fn promote_document(
    ctx: &PipelineContext,
    table: &ResolvedTable,
    document: &CuratedDocument,
    notified: &mut BTreeSet<String>,
    outcome: &mut ProdOutcome,
) -> Result<()> {
    let rows = document.records.iter().map(|curated| {
        let row = prod_row(table, curated);
        (partition_for(&table.bundle.partition, curated, &row), row)
    });
    let partitions = group_partitions(rows, table.bundle.sort_column.as_deref(), table.key_columns());

    let policy = ctx.retry_policy();
    let writer = PartitionWriter::new(ctx.store.clone(), policy, ctx.config.batch_size);
    for partition in &partitions {
        let write = writer.write(&document.table_name, &document.batch_id, partition).await?;
        metrics::prod::partition_written(&document.table_name, write.record_count);
        outcome.records += write.record_count;
        outcome.object_keys.extend(write.object_keys);

        if notified.insert(write.partition_path.clone()) {
            let notifier = ctx.notifier.as_ref();
            let (table_name, path) = (document.table_name.as_str(), write.partition_path.as_str());
            let result = with_retry(&policy, "catalog_notify", || async move {
                notifier.notify(table_name, path).await
            })
            .await;
            metrics::prod::catalog_notified(table_name, result.is_ok());
            result?;
            outcome.partitions.push(write.partition_path);
        }
    }
    Ok(())
}

/// Promote the given curated objects of one table. Fails on the first
/// write or notification that exhausts its retries; rerunning is safe.
#[instrument(skip(ctx, object_keys), fields(objects = object_keys.len()))]
pub async fn promote(ctx: &PipelineContext, table_name: &str, object_keys: &[String]) -> Result<ProdOutcome> {
    let table = ctx.registry.get(table_name)?;
    let policy = ctx.retry_policy();
    let mut outcome = ProdOutcome {
        table_name: table_name.to_string(),
        ..ProdOutcome::default()
    };
    let mut notified = BTreeSet::new();

    for key in object_keys {
        let document = read_curated(ctx.store.as_ref(), key, &policy).await?;
        if document.table_name != table_name {
            return Err(PipelineError::Read {
                locator: key.clone(),
                reason: format!("curated object belongs to table '{}'", document.table_name),
                retryable: false,
            });
        }
        promote_document(ctx, &table, &document, &mut notified, &mut outcome).await?;
        outcome.curated_objects += 1;
    }

    info!(
        curated_objects = outcome.curated_objects,
        records = outcome.records,
        partitions = outcome.partitions.len(),
        "Stage 2 finished"
    );
    Ok(outcome)
}

/// Event-triggered run for a single committed batch.
pub async fn handle_event(ctx: &PipelineContext, event: &CompletionEvent) -> Result<ProdOutcome> {
    let result = promote(ctx, &event.table_name, std::slice::from_ref(&event.object_key)).await;
    if let Err(e) = &result {
        error!(object_key = %event.object_key, error = %e, "Promotion failed");
    }
    result
}

/// Re-promote every curated object of a table.
pub async fn backfill(ctx: &PipelineContext, table_name: &str) -> Result<ProdOutcome> {
    let prefix = format!("{CURATED_PREFIX}/{table_name}/");
    let store = ctx.store.as_ref();
    let prefix_ref = prefix.as_str();
    let keys = with_retry(&ctx.retry_policy(), "curated_list", || async move {
        store.list(prefix_ref).await.map_err(|e| PipelineError::Read {
            locator: prefix_ref.to_string(),
            reason: e.to_string(),
            retryable: e.is_transient(),
        })
    })
    .await?;
    let keys: Vec<String> = keys.into_iter().filter(|k| k.ends_with(".json")).collect();
    info!(table = table_name, objects = keys.len(), "Backfilling from curated layer");
    promote(ctx, table_name, &keys).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TableRegistry;
    use chrono::{TimeZone, Utc};

    fn curated(record: Record) -> CuratedRecord {
        CuratedRecord {
            record,
            quality_score: 0.95,
            is_anomaly: true,
            anomaly_score: 0.71,
            processed_at: Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_prod_row_is_typed_transformed_and_annotated() {
        let registry = TableRegistry::builtin().unwrap();
        let products = registry.get("products").unwrap();
        let row = prod_row(
            &products,
            &curated(Record::from_pairs([
                ("product_id", Value::String("P1".into())),
                ("price", Value::String("40".into())),
                ("cost", Value::Float(30.0)),
            ])),
        );
        assert_eq!(row.get("price"), Some(&Value::Float(40.0)));
        assert_eq!(row.get("profit_margin"), Some(&Value::Float(25.0)));
        assert_eq!(row.get("price_category"), Some(&Value::String("economy".into())));
        assert_eq!(row.get("is_anomaly"), Some(&Value::Bool(true)));
        assert!(matches!(row.get("processed_at"), Some(Value::Timestamp(_))));
    }

    #[test]
    fn test_partition_paths() {
        let record = Record::from_pairs([("order_date", Value::String("2024-01-02".into()))]);
        let c = curated(record.clone());
        assert_eq!(partition_for(&PartitionKey::IngestDate, &c, &record), "ingest_date=2024-03-20");
        assert_eq!(
            partition_for(&PartitionKey::Column("order_date".into()), &c, &record),
            "order_date=2024-01-02"
        );
        assert_eq!(
            partition_for(&PartitionKey::Column("shipped_at".into()), &c, &record),
            "shipped_at=unknown"
        );
    }
}
