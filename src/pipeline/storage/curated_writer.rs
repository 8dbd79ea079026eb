use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::app::ports::{EventSink, ObjectStore};
use crate::common::constants::{BATCH_ID_LEN, CURATED_PREFIX, ERRORS_PREFIX, QUARANTINE_PREFIX};
use crate::common::error::{PipelineError, Result};
use crate::domain::{CuratedRecord, Record, ValidationIssue};
use crate::pipeline::events::CompletionEvent;
use crate::pipeline::outcome::BatchCounts;
use crate::pipeline::processing::quality_gate::profile::QualityProfile;
use crate::pipeline::processing::quality_gate::QualityAssessment;
use crate::pipeline::retry::{with_retry, RetryPolicy};

pub fn curated_key(table_name: &str, source_partition_key: &str, batch_id: &str) -> String {
    format!("{CURATED_PREFIX}/{table_name}/{source_partition_key}/{table_name}-{batch_id}.json")
}

pub fn quarantine_key(table_name: &str, batch_id: &str) -> String {
    format!("{QUARANTINE_PREFIX}/{table_name}/{batch_id}.json")
}

/// Unreadable extracts have no batch id, so the marker is keyed by the locator.
pub fn read_error_key(table_name: &str, locator: &str) -> String {
    let mut hash = hex::encode(Sha256::digest(locator.as_bytes()));
    hash.truncate(BATCH_ID_LEN);
    format!("{QUARANTINE_PREFIX}/{table_name}/{hash}.read_error.json")
}

pub fn issues_key(table_name: &str, batch_id: &str) -> String {
    format!("{ERRORS_PREFIX}/{table_name}/{batch_id}.issues.json")
}

/// One committed batch in the curated layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CuratedDocument {
    pub table_name: String,
    pub schema_version: String,
    pub batch_id: String,
    pub source_partition_key: String,
    pub quality_score: f64,
    pub processed_at: DateTime<Utc>,
    pub records: Vec<CuratedRecord>,
}

impl CuratedDocument {
    pub fn object_key(&self) -> String {
        curated_key(&self.table_name, &self.source_partition_key, &self.batch_id)
    }
}

/// A batch held back by the quality gate. Only masked records are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineDocument {
    pub table_name: String,
    pub schema_version: String,
    pub batch_id: String,
    pub locator: String,
    pub assessment: QualityAssessment,
    pub profile: QualityProfile,
    pub counts: BatchCounts,
    pub records: Vec<Record>,
}

/// Marker left for an extract that could not be read once retries ran out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadErrorDocument {
    pub table_name: String,
    pub schema_version: String,
    pub locator: String,
    pub error: String,
    pub retryable: bool,
}

/// Per-record findings for a batch, without any record values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuesDocument {
    pub table_name: String,
    pub batch_id: String,
    pub issue_count: usize,
    pub issues: Vec<ValidationIssue>,
}

/// Writes stage-1 results and announces committed batches.
#[derive(Clone)]
pub struct CuratedWriter {
    store: Arc<dyn ObjectStore>,
    events: Arc<dyn EventSink>,
    policy: RetryPolicy,
}

impl CuratedWriter {
    pub fn new(store: Arc<dyn ObjectStore>, events: Arc<dyn EventSink>, policy: RetryPolicy) -> Self {
        Self { store, events, policy }
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<usize> {
        let bytes = serde_json::to_vec_pretty(value)?;
        let store = self.store.as_ref();
        let bytes = bytes.as_slice();
        with_retry(&self.policy, "curated_write", || async move {
            store.put(key, bytes).await.map_err(|e| PipelineError::Write {
                object_key: key.to_string(),
                reason: e.to_string(),
                retryable: e.is_transient(),
            })
        })
        .await?;
        Ok(bytes.len())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let store = self.store.as_ref();
        with_retry(&self.policy, "curated_exists", || async move {
            store.exists(key).await.map_err(|e| PipelineError::Read {
                locator: key.to_string(),
                reason: e.to_string(),
                retryable: e.is_transient(),
            })
        })
        .await
    }

    /// Commit the batch, then publish its completion event. The event is only
    /// published once the object is in place.
    ///
    /// Curated objects are immutable: when the batch is already committed the
    /// stored document is kept and its event is published again.
    #[instrument(skip_all, fields(table = %document.table_name, batch_id = %document.batch_id))]
    pub async fn write_curated(&self, document: &CuratedDocument) -> Result<CompletionEvent> {
        let key = document.object_key();
        let existing = if self.exists(&key).await? {
            Some(read_curated(self.store.as_ref(), &key, &self.policy).await?)
        } else {
            None
        };
        let committed = match &existing {
            Some(stored) => {
                info!(
                    object_key = %key,
                    processed_at = %stored.processed_at,
                    "Batch already committed, keeping the stored object"
                );
                stored
            }
            None => {
                let bytes = self.put_json(&key, document).await?;
                info!(object_key = %key, records = document.records.len(), bytes, "Curated batch committed");
                document
            }
        };

        let event = CompletionEvent::curated_batch_written(
            &committed.table_name,
            &key,
            committed.records.len(),
            committed.quality_score,
            committed.processed_at,
        );
        let events = self.events.as_ref();
        let published = &event;
        with_retry(&self.policy, "event_publish", || async move { events.publish(published).await }).await?;
        Ok(event)
    }

    #[instrument(skip_all, fields(table = %document.table_name, batch_id = %document.batch_id))]
    pub async fn write_quarantine(&self, document: &QuarantineDocument) -> Result<String> {
        let key = quarantine_key(&document.table_name, &document.batch_id);
        self.put_json(&key, document).await?;
        warn!(
            object_key = %key,
            composite = document.assessment.score.composite,
            reasons = ?document.assessment.reasons,
            "Batch quarantined"
        );
        Ok(key)
    }

    #[instrument(skip_all, fields(table = %document.table_name, locator = %document.locator))]
    pub async fn write_read_error(&self, document: &ReadErrorDocument) -> Result<String> {
        let key = read_error_key(&document.table_name, &document.locator);
        self.put_json(&key, document).await?;
        warn!(object_key = %key, retryable = document.retryable, "Unreadable extract quarantined");
        Ok(key)
    }

    /// Skipped when there is nothing to report.
    pub async fn write_issues(&self, table_name: &str, batch_id: &str, issues: &[ValidationIssue]) -> Result<Option<String>> {
        if issues.is_empty() {
            return Ok(None);
        }
        let key = issues_key(table_name, batch_id);
        let document = IssuesDocument {
            table_name: table_name.to_string(),
            batch_id: batch_id.to_string(),
            issue_count: issues.len(),
            issues: issues.to_vec(),
        };
        self.put_json(&key, &document).await?;
        info!(object_key = %key, issues = issues.len(), "Issue report written");
        Ok(Some(key))
    }
}

/// Load a curated batch back for stage 2.
pub async fn read_curated(store: &dyn ObjectStore, key: &str, policy: &RetryPolicy) -> Result<CuratedDocument> {
    let bytes = with_retry(policy, "curated_read", || async move {
        store.get(key).await.map_err(|e| PipelineError::Read {
            locator: key.to_string(),
            reason: e.to_string(),
            retryable: e.is_transient(),
        })
    })
    .await?;
    serde_json::from_slice(&bytes).map_err(|e| PipelineError::Read {
        locator: key.to_string(),
        reason: format!("not a curated document: {e}"),
        retryable: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IssueKind, Severity, Value};
    use crate::infra::event_log::InMemoryEventSink;
    use crate::infra::memory_store::InMemoryObjectStore;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap()
    }

    fn document() -> CuratedDocument {
        CuratedDocument {
            table_name: "orders".to_string(),
            schema_version: "v1".to_string(),
            batch_id: "0123456789abcdef".to_string(),
            source_partition_key: "year=2024/month=01/day=15".to_string(),
            quality_score: 0.98,
            processed_at: ts(),
            records: vec![CuratedRecord {
                record: Record::from_pairs([("order_id", Value::String("O1".to_string()))]),
                quality_score: 0.98,
                is_anomaly: false,
                anomaly_score: 0.0,
                processed_at: ts(),
            }],
        }
    }

    fn writer() -> (CuratedWriter, InMemoryObjectStore, InMemoryEventSink) {
        let store = InMemoryObjectStore::new();
        let events = InMemoryEventSink::new();
        let writer = CuratedWriter::new(Arc::new(store.clone()), Arc::new(events.clone()), RetryPolicy::default());
        (writer, store, events)
    }

    #[test]
    fn test_object_keys() {
        assert_eq!(
            document().object_key(),
            "curated/orders/year=2024/month=01/day=15/orders-0123456789abcdef.json"
        );
        assert_eq!(quarantine_key("orders", "abc"), "quarantine/orders/abc.json");
        assert_eq!(issues_key("orders", "abc"), "errors/orders/abc.issues.json");
    }

    #[tokio::test]
    async fn test_event_follows_the_commit() {
        let (writer, store, events) = writer();
        let event = writer.write_curated(&document()).await.unwrap();

        assert!(store.exists(&event.object_key).await.unwrap());
        assert_eq!(events.events(), vec![event.clone()]);
        assert_eq!(event.record_count, 1);

        let back = read_curated(&store, &event.object_key, &RetryPolicy::default()).await.unwrap();
        assert_eq!(back, document());
    }

    #[tokio::test]
    async fn test_committed_batch_is_never_rewritten() {
        let (writer, store, events) = writer();
        let first = writer.write_curated(&document()).await.unwrap();
        let stored = store.get(&first.object_key).await.unwrap();

        let mut later = document();
        later.processed_at = ts() + chrono::Duration::days(1);
        later.quality_score = 0.5;
        let second = writer.write_curated(&later).await.unwrap();

        assert_eq!(store.get(&first.object_key).await.unwrap(), stored);
        assert_eq!(second, first);
        assert_eq!(events.events(), vec![first.clone(), first]);
    }

    #[tokio::test]
    async fn test_read_error_marker_is_keyed_by_locator() {
        let (writer, store, _) = writer();
        let document = ReadErrorDocument {
            table_name: "orders".to_string(),
            schema_version: "v1".to_string(),
            locator: "raw/orders/bad.ndjson".to_string(),
            error: "line 2: expected value".to_string(),
            retryable: false,
        };
        let key = writer.write_read_error(&document).await.unwrap();
        assert_eq!(key, read_error_key("orders", "raw/orders/bad.ndjson"));
        assert!(key.starts_with("quarantine/orders/"));
        assert!(key.ends_with(".read_error.json"));
        assert_ne!(key, read_error_key("orders", "raw/orders/other.ndjson"));

        let back: ReadErrorDocument = serde_json::from_slice(&store.get(&key).await.unwrap()).unwrap();
        assert_eq!(back, document);
    }

    #[tokio::test]
    async fn test_no_issue_report_for_a_clean_batch() {
        let (writer, store, _) = writer();
        assert_eq!(writer.write_issues("orders", "abc", &[]).await.unwrap(), None);
        assert!(store.is_empty());

        let issue = ValidationIssue::new(IssueKind::SchemaViolation, Severity::Reject, "schema.null_value", "null");
        let key = writer.write_issues("orders", "abc", &[issue]).await.unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&store.get(&key).await.unwrap()).unwrap();
        assert_eq!(json["issue_count"], 1);
    }

    #[tokio::test]
    async fn test_reading_garbage_is_permanent() {
        let store = InMemoryObjectStore::new();
        store.put("curated/orders/x.json", b"[]").await.unwrap();
        let err = read_curated(&store, "curated/orders/x.json", &RetryPolicy::default())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
