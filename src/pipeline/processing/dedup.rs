use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, info, instrument};

use crate::domain::{IssueKind, RecordRef, Severity, TrackedRecord, ValidationIssue};

#[derive(Debug, Clone, Default)]
pub struct DedupOutcome {
    pub records: Vec<TrackedRecord>,
    pub duplicate_count: usize,
    pub conflicts: Vec<ValidationIssue>,
}

/// Keep one record per primary key: the one with the latest update
/// timestamp, later arrivals winning exact ties. A missing timestamp sorts
/// before any real one. Output follows the first appearance of each key;
/// records with no derivable key pass through untouched.
#[instrument(skip_all, fields(records = records.len()))]
pub fn deduplicate(
    records: Vec<TrackedRecord>,
    key_columns: &[String],
    timestamp_column: &str,
) -> DedupOutcome {
    let total = records.len();
    // slot index in `kept` per key
    let mut slots: HashMap<String, usize> = HashMap::with_capacity(total);
    let mut kept: Vec<(Option<DateTime<Utc>>, TrackedRecord)> = Vec::with_capacity(total);
    let mut conflicts = Vec::new();

    for tracked in records {
        let Some(key) = tracked.record.primary_key(key_columns) else {
            kept.push((None, tracked));
            continue;
        };
        let ts = tracked.record.update_timestamp(timestamp_column);

        match slots.get(&key).copied() {
            None => {
                slots.insert(key, kept.len());
                kept.push((ts, tracked));
            }
            Some(slot) => {
                let (current_ts, current) = &kept[slot];
                if ts == *current_ts {
                    debug!(key = %key, "Duplicate key with identical timestamp, keeping later record");
                    conflicts.push(
                        ValidationIssue::new(
                            IssueKind::DuplicateResolutionConflict,
                            Severity::Warn,
                            "dedup.timestamp_tie",
                            format!(
                                "records {} and {} share key and {timestamp_column}; later record kept",
                                current.index, tracked.index
                            ),
                        )
                        .for_record(RecordRef {
                            index: tracked.index,
                            primary_key: Some(key.clone()),
                        }),
                    );
                }
                if ts >= *current_ts {
                    kept[slot] = (ts, tracked);
                }
            }
        }
    }

    let records: Vec<TrackedRecord> = kept.into_iter().map(|(_, r)| r).collect();
    let duplicate_count = total - records.len();
    info!(
        kept = records.len(),
        duplicates = duplicate_count,
        conflicts = conflicts.len(),
        "Deduplication complete"
    );
    DedupOutcome {
        records,
        duplicate_count,
        conflicts,
    }
}
