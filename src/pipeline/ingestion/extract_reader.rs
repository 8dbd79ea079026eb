use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{info, instrument};

use crate::app::ports::ObjectStore;
use crate::common::constants::BATCH_ID_LEN;
use crate::common::error::{PipelineError, Result};
use crate::domain::{Batch, Record, Value};
use crate::pipeline::processing::business_rules::ReferenceData;
use crate::pipeline::retry::{with_retry, RetryPolicy};

static PARTITION_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(year|month|day)=(\d{1,4})$").expect("static partition pattern"));

/// One unit of stage-1 work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractRequest {
    pub locator: String,
    pub table_name: String,
    pub schema_version: String,
    /// Extra extracts for cross-record rules, keyed by table name
    #[serde(default)]
    pub references: BTreeMap<String, String>,
}

impl ExtractRequest {
    pub fn new(locator: &str, table_name: &str, schema_version: &str) -> Self {
        Self {
            locator: locator.to_string(),
            table_name: table_name.to_string(),
            schema_version: schema_version.to_string(),
            references: BTreeMap::new(),
        }
    }

    pub fn with_reference(mut self, table_name: &str, locator: &str) -> Self {
        self.references.insert(table_name.to_string(), locator.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Columnar,
    Rows,
}

fn encoding_for(locator: &str) -> Option<Encoding> {
    let lower = locator.to_ascii_lowercase();
    if lower.ends_with(".ndjson") || lower.ends_with(".jsonl") {
        Some(Encoding::Rows)
    } else if lower.ends_with(".json") {
        Some(Encoding::Columnar)
    } else {
        None
    }
}

/// Content-derived id: the same extract always gets the same id.
pub fn batch_id(table_name: &str, schema_version: &str, bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(table_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(schema_version.as_bytes());
    hasher.update([0u8]);
    hasher.update(bytes);
    let mut id = hex::encode(hasher.finalize());
    id.truncate(BATCH_ID_LEN);
    id
}

/// `year=/month=/day=` segments of the locator, or the fallback date.
pub fn source_partition_key(locator: &str, fallback: NaiveDate) -> String {
    let mut parts: BTreeMap<&str, u32> = BTreeMap::new();
    for segment in locator.split('/') {
        if let Some(caps) = PARTITION_SEGMENT.captures(segment) {
            if let (Some(name), Some(value)) = (caps.get(1), caps.get(2)) {
                if let Ok(v) = value.as_str().parse::<u32>() {
                    parts.insert(name.as_str(), v);
                }
            }
        }
    }
    let date = match (parts.get("year"), parts.get("month"), parts.get("day")) {
        (Some(&y), Some(&m), Some(&d)) => NaiveDate::from_ymd_opt(y as i32, m, d).unwrap_or(fallback),
        _ => fallback,
    };
    date.format("year=%Y/month=%m/day=%d").to_string()
}

fn parse_error(locator: &str, reason: impl Into<String>) -> PipelineError {
    PipelineError::Read {
        locator: locator.to_string(),
        reason: reason.into(),
        retryable: false,
    }
}

fn parse_columnar(locator: &str, bytes: &[u8]) -> Result<Vec<Record>> {
    let doc: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| parse_error(locator, e.to_string()))?;
    let columns = match doc.get("columns") {
        Some(serde_json::Value::Object(columns)) => columns,
        _ => doc
            .as_object()
            .ok_or_else(|| parse_error(locator, "columnar extract must be a JSON object"))?,
    };

    let mut arrays = Vec::with_capacity(columns.len());
    for (name, values) in columns {
        let values = values
            .as_array()
            .ok_or_else(|| parse_error(locator, format!("column '{name}' is not an array")))?;
        arrays.push((name.as_str(), values));
    }
    let rows = arrays.first().map_or(0, |(_, v)| v.len());
    if let Some((name, v)) = arrays.iter().find(|(_, v)| v.len() != rows) {
        return Err(parse_error(
            locator,
            format!("column '{name}' has {} values, expected {rows}", v.len()),
        ));
    }

    Ok((0..rows)
        .map(|i| Record::from_pairs(arrays.iter().map(|(name, v)| (*name, Value::from_json(&v[i])))))
        .collect())
}

fn parse_rows(locator: &str, bytes: &[u8]) -> Result<Vec<Record>> {
    let text = std::str::from_utf8(bytes).map_err(|e| parse_error(locator, e.to_string()))?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            let row: serde_json::Value = serde_json::from_str(line)
                .map_err(|e| parse_error(locator, format!("line {}: {e}", n + 1)))?;
            let object = row
                .as_object()
                .ok_or_else(|| parse_error(locator, format!("line {} is not a JSON object", n + 1)))?;
            Ok(Record::from_pairs(
                object.iter().map(|(k, v)| (k.as_str(), Value::from_json(v))),
            ))
        })
        .collect()
}

/// Parse extract bytes into a batch. No validation happens here.
pub fn parse_extract(request: &ExtractRequest, bytes: &[u8], fallback_date: NaiveDate) -> Result<Batch> {
    let locator = request.locator.as_str();
    let records = match encoding_for(locator) {
        Some(Encoding::Columnar) => parse_columnar(locator, bytes)?,
        Some(Encoding::Rows) => parse_rows(locator, bytes)?,
        None => return Err(parse_error(locator, "unsupported extract encoding")),
    };
    Ok(Batch {
        batch_id: batch_id(&request.table_name, &request.schema_version, bytes),
        table_name: request.table_name.clone(),
        schema_version: request.schema_version.clone(),
        source_partition_key: source_partition_key(locator, fallback_date),
        locator: request.locator.clone(),
        records,
    })
}

/// Fetch under the retry policy, then parse. Parse failures are not retried.
pub async fn fetch(store: &dyn ObjectStore, locator: &str, policy: &RetryPolicy) -> Result<Vec<u8>> {
    with_retry(policy, "extract_read", || async move {
        store.get(locator).await.map_err(|e| PipelineError::Read {
            locator: locator.to_string(),
            reason: e.to_string(),
            retryable: e.is_transient(),
        })
    })
    .await
}

#[instrument(skip(store, policy), fields(locator = %request.locator, table = %request.table_name))]
pub async fn read_extract(
    store: &dyn ObjectStore,
    request: &ExtractRequest,
    policy: &RetryPolicy,
    fallback_date: NaiveDate,
) -> Result<Batch> {
    let bytes = fetch(store, &request.locator, policy).await?;
    let batch = parse_extract(request, &bytes, fallback_date)?;
    info!(
        batch_id = %batch.batch_id,
        records = batch.len(),
        bytes = bytes.len(),
        "Extract read"
    );
    Ok(batch)
}

/// Read every reference extract named by the request.
pub async fn read_references(
    store: &dyn ObjectStore,
    request: &ExtractRequest,
    policy: &RetryPolicy,
    fallback_date: NaiveDate,
) -> Result<ReferenceData> {
    let mut references = ReferenceData::new();
    for (table, locator) in &request.references {
        let reference = ExtractRequest::new(locator, table, &request.schema_version);
        let batch = read_extract(store, &reference, policy, fallback_date).await?;
        references.insert(table.clone(), batch.records);
    }
    Ok(references)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::memory_store::InMemoryObjectStore;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
    }

    fn request(locator: &str) -> ExtractRequest {
        ExtractRequest::new(locator, "orders", "v1")
    }

    #[test]
    fn test_columnar_document() {
        let bytes = br#"{"columns": {"order_id": ["O1", "O2"], "total": [10.5, null], "qty": [1, 2]}}"#;
        let batch = parse_extract(&request("raw/orders/part.json"), bytes, date()).unwrap();
        assert_eq!(batch.len(), 2);
        let columns: Vec<&str> = batch.records[0].columns().collect();
        assert_eq!(columns, vec!["order_id", "total", "qty"]);
        assert_eq!(batch.records[1].get("total"), Some(&Value::Null));
        assert_eq!(batch.records[1].get("qty"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_bare_columnar_object() {
        let bytes = br#"{"order_id": ["O1"], "total": [3]}"#;
        let batch = parse_extract(&request("raw/orders.JSON"), bytes, date()).unwrap();
        assert_eq!(batch.records[0].get("total"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_ragged_columns_are_corrupt() {
        let bytes = br#"{"columns": {"a": [1, 2], "b": [1]}}"#;
        let err = parse_extract(&request("raw/x.json"), bytes, date()).unwrap_err();
        assert!(matches!(err, PipelineError::Read { retryable: false, .. }));
    }

    #[test]
    fn test_ndjson_rows_skip_blank_lines() {
        let bytes = b"{\"order_id\":\"O1\",\"meta\":{\"a\":1}}\n\n{\"order_id\":\"O2\"}\n";
        let batch = parse_extract(&request("raw/orders/cdc.ndjson"), bytes, date()).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records[0].get("meta"), Some(&Value::String("{\"a\":1}".to_string())));
    }

    #[test]
    fn test_corrupt_rows_name_the_line() {
        let bytes = b"{\"order_id\":\"O1\"}\n{not json\n";
        let err = parse_extract(&request("raw/orders/cdc.jsonl"), bytes, date()).unwrap_err();
        assert!(err.to_string().contains("line 2"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        assert!(parse_extract(&request("raw/orders.parquet"), b"PAR1", date()).is_err());
    }

    #[test]
    fn test_manifest_requests_deserialize() {
        let requests: Vec<ExtractRequest> =
            serde_json::from_str(include_str!("../../../demos/manifest.json")).unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].references.is_empty());
        assert_eq!(requests[1].references.len(), 2);
        assert!(requests[1].references.contains_key("order_items"));
    }

    #[test]
    fn test_batch_id_is_content_derived() {
        let a = batch_id("orders", "v1", b"same");
        assert_eq!(a.len(), 16);
        assert_eq!(a, batch_id("orders", "v1", b"same"));
        assert_ne!(a, batch_id("orders", "v2", b"same"));
        assert_ne!(a, batch_id("payments", "v1", b"same"));
    }

    #[test]
    fn test_partition_key_from_locator() {
        assert_eq!(
            source_partition_key("raw/orders/year=2024/month=1/day=15/part-0.json", date()),
            "year=2024/month=01/day=15"
        );
        assert_eq!(source_partition_key("raw/orders/part-0.json", date()), "year=2024/month=02/day=29");
        assert_eq!(
            source_partition_key("raw/year=2024/month=13/day=1/x.json", date()),
            "year=2024/month=02/day=29"
        );
    }

    #[tokio::test]
    async fn test_missing_object_is_a_permanent_read_error() {
        let store = InMemoryObjectStore::new();
        let err = read_extract(&store, &request("raw/none.json"), &RetryPolicy::default(), date())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Read { retryable: false, .. }));
    }

    #[tokio::test]
    async fn test_references_are_read_per_table() {
        let store = InMemoryObjectStore::new();
        store
            .put("raw/order_items/items.ndjson", b"{\"order_id\":\"O1\",\"total\":5}\n")
            .await
            .unwrap();
        let req = request("raw/orders/o.json").with_reference("order_items", "raw/order_items/items.ndjson");
        let refs = read_references(&store, &req, &RetryPolicy::default(), date()).await.unwrap();
        assert_eq!(refs["order_items"].len(), 1);
    }
}
