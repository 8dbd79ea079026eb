use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::common::constants::CURATED_BATCH_WRITTEN;

/// Published once a curated batch is committed; triggers stage 2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub event_type: String,
    pub table_name: String,
    pub object_key: String,
    pub record_count: usize,
    pub quality_score: f64,
    #[serde(with = "rfc3339")]
    pub timestamp: DateTime<Utc>,
}

impl CompletionEvent {
    pub fn curated_batch_written(
        table_name: &str,
        object_key: &str,
        record_count: usize,
        quality_score: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: CURATED_BATCH_WRITTEN.to_string(),
            table_name: table_name.to_string(),
            object_key: object_key.to_string(),
            record_count,
            quality_score,
            timestamp,
        }
    }
}

mod rfc3339 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
