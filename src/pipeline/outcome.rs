use serde::{Deserialize, Serialize};

use crate::domain::ValidationIssue;
use crate::pipeline::events::CompletionEvent;
use crate::pipeline::processing::quality_gate::{QualityAssessment, QualityDecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Success,
    Quarantined,
    Failed,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Success => "success",
            PipelineStatus::Quarantined => "quarantined",
            PipelineStatus::Failed => "failed",
        }
    }
}

/// Record counts at each stage of one stage-1 run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub read: usize,
    pub schema_rejected: usize,
    pub rule_rejected: usize,
    pub warned: usize,
    pub duplicates: usize,
    pub dedup_conflicts: usize,
    pub mask_dropped: usize,
    pub anomalies: usize,
    pub written: usize,
}

/// Result of one stage-1 invocation. Failures are reported here rather than
/// propagated so that one batch never takes down its siblings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub table_name: String,
    pub locator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub status: PipelineStatus,
    pub counts: BatchCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityAssessment>,
    pub issues: Vec<ValidationIssue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Published when the batch was committed; stage 2 is driven from it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<CompletionEvent>,
}

impl PipelineOutcome {
    pub fn failed(table_name: &str, locator: &str, error: String) -> Self {
        Self {
            table_name: table_name.to_string(),
            locator: locator.to_string(),
            batch_id: None,
            status: PipelineStatus::Failed,
            counts: BatchCounts::default(),
            quality: None,
            issues: Vec::new(),
            object_key: None,
            error: Some(error),
            event: None,
        }
    }

    pub fn quality_score(&self) -> Option<f64> {
        self.quality.as_ref().map(|q| q.score.composite)
    }

    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Success
    }

    pub fn warned(&self) -> bool {
        matches!(
            self.quality.as_ref().map(|q| q.decision),
            Some(QualityDecision::AcceptWithWarnings)
        )
    }
}

/// Result of one stage-2 invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProdOutcome {
    pub table_name: String,
    pub curated_objects: usize,
    pub records: usize,
    pub partitions: Vec<String>,
    pub object_keys: Vec<String>,
}
