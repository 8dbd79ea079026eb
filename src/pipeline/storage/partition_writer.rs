//! Gzip-compressed NDJSON partitions for the prod layer.

use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::app::ports::ObjectStore;
use crate::common::constants::PROD_PREFIX;
use crate::common::error::{PipelineError, Result};
use crate::domain::{Record, Value};
use crate::pipeline::retry::{with_retry, RetryPolicy};

/// Records bound for one partition directory, already in write order.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    /// e.g. `ingest_date=2024-01-15`
    pub key: String,
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionWrite {
    pub partition_path: String,
    pub object_keys: Vec<String>,
    pub record_count: usize,
}

pub fn partition_path(table_name: &str, partition_key: &str) -> String {
    format!("{PROD_PREFIX}/{table_name}/{partition_key}")
}

pub fn chunk_key(table_name: &str, partition_key: &str, batch_id: &str, chunk: usize) -> String {
    format!(
        "{}/part-{batch_id}-{chunk:05}.ndjson.gz",
        partition_path(table_name, partition_key)
    )
}

/// Total order over cell values: null first, then timestamps, numbers and
/// finally rendered text.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Timestamp(x), Value::Timestamp(y)) => x.cmp(y),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            _ => a.render().cmp(&b.render()),
        },
    }
}

/// Group `(partition_key, record)` pairs and order each group by the sort
/// column, then by primary key.
pub fn group_partitions(
    rows: impl IntoIterator<Item = (String, Record)>,
    sort_column: Option<&str>,
    key_columns: &[String],
) -> Vec<Partition> {
    let mut groups: BTreeMap<String, Vec<Record>> = BTreeMap::new();
    for (key, record) in rows {
        groups.entry(key).or_default().push(record);
    }

    groups
        .into_iter()
        .map(|(key, mut records)| {
            records.sort_by(|a, b| {
                let by_column = match sort_column {
                    Some(column) => compare_values(
                        a.get(column).unwrap_or(&Value::Null),
                        b.get(column).unwrap_or(&Value::Null),
                    ),
                    None => Ordering::Equal,
                };
                by_column.then_with(|| a.primary_key(key_columns).cmp(&b.primary_key(key_columns)))
            });
            Partition { key, records }
        })
        .collect()
}

pub fn encode_chunk(records: &[Record]) -> Result<Vec<u8>> {
    // Zero mtime keeps rerun output byte-identical
    let mut encoder = GzBuilder::new().mtime(0).write(Vec::new(), Compression::default());
    for record in records {
        serde_json::to_writer(&mut encoder, record)?;
        encoder.write_all(b"\n")?;
    }
    Ok(encoder.finish()?)
}

pub fn decode_chunk(bytes: &[u8]) -> Result<Vec<serde_json::Value>> {
    let mut text = String::new();
    GzDecoder::new(bytes).read_to_string(&mut text)?;
    text.lines()
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_str(line).map_err(PipelineError::from))
        .collect()
}

/// Writes partitions in `chunk_size` pieces with deterministic names, so a
/// rerun overwrites the same objects.
#[derive(Clone)]
pub struct PartitionWriter {
    store: Arc<dyn ObjectStore>,
    policy: RetryPolicy,
    chunk_size: usize,
}

impl PartitionWriter {
    pub fn new(store: Arc<dyn ObjectStore>, policy: RetryPolicy, chunk_size: usize) -> Self {
        Self {
            store,
            policy,
            chunk_size: chunk_size.max(1),
        }
    }

    #[instrument(skip_all, fields(table = table_name, partition = %partition.key, records = partition.records.len()))]
    pub async fn write(&self, table_name: &str, batch_id: &str, partition: &Partition) -> Result<PartitionWrite> {
        let mut object_keys = Vec::new();
        for (chunk, records) in partition.records.chunks(self.chunk_size).enumerate() {
            let key = chunk_key(table_name, &partition.key, batch_id, chunk);
            let bytes = encode_chunk(records)?;
            let store = self.store.as_ref();
            let (k, b) = (key.as_str(), bytes.as_slice());
            with_retry(&self.policy, "prod_write", || async move {
                store.put(k, b).await.map_err(|e| PipelineError::Write {
                    object_key: k.to_string(),
                    reason: e.to_string(),
                    retryable: e.is_transient(),
                })
            })
            .await?;
            debug!(object_key = %key, records = records.len(), bytes = bytes.len(), "Chunk written");
            object_keys.push(key);
        }

        let write = PartitionWrite {
            partition_path: partition_path(table_name, &partition.key),
            object_keys,
            record_count: partition.records.len(),
        };
        info!(
            partition_path = %write.partition_path,
            chunks = write.object_keys.len(),
            "Partition written"
        );
        Ok(write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::memory_store::InMemoryObjectStore;
    use chrono::{TimeZone, Utc};

    fn row(id: &str, day: u32) -> Record {
        Record::from_pairs([
            ("order_id", Value::String(id.to_string())),
            (
                "order_date",
                Value::Timestamp(Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()),
            ),
        ])
    }

    fn keys() -> Vec<String> {
        vec!["order_id".to_string()]
    }

    #[test]
    fn test_grouping_and_ordering() {
        let rows = vec![
            ("ingest_date=2024-01-16".to_string(), row("B", 3)),
            ("ingest_date=2024-01-15".to_string(), row("C", 2)),
            ("ingest_date=2024-01-16".to_string(), row("A", 3)),
            ("ingest_date=2024-01-16".to_string(), row("D", 1)),
        ];
        let partitions = group_partitions(rows, Some("order_date"), &keys());
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0].key, "ingest_date=2024-01-15");
        let ids: Vec<_> = partitions[1]
            .records
            .iter()
            .map(|r| r.get("order_id").and_then(Value::render).unwrap())
            .collect();
        assert_eq!(ids, vec!["D", "A", "B"]);
    }

    #[test]
    fn test_value_ordering() {
        assert_eq!(compare_values(&Value::Null, &Value::Int(1)), Ordering::Less);
        assert_eq!(compare_values(&Value::Int(2), &Value::Float(10.0)), Ordering::Less);
        assert_eq!(
            compare_values(&Value::String("b".into()), &Value::String("a".into())),
            Ordering::Greater
        );
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let records = vec![row("A", 1), row("B", 2)];
        let first = encode_chunk(&records).unwrap();
        assert_eq!(first, encode_chunk(&records).unwrap());
        let decoded = decode_chunk(&first).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1]["order_id"], "B");
    }

    #[tokio::test]
    async fn test_chunking_by_size() {
        let store = InMemoryObjectStore::new();
        let writer = PartitionWriter::new(Arc::new(store.clone()), RetryPolicy::default(), 2);
        let partition = Partition {
            key: "ingest_date=2024-01-15".to_string(),
            records: (1..=5).map(|d| row(&format!("O{d}"), d)).collect(),
        };
        let write = writer.write("orders", "abc", &partition).await.unwrap();
        assert_eq!(write.partition_path, "prod/orders/ingest_date=2024-01-15");
        assert_eq!(
            write.object_keys.last().unwrap(),
            "prod/orders/ingest_date=2024-01-15/part-abc-00002.ndjson.gz"
        );
        assert_eq!(store.len(), 3);
    }
}
