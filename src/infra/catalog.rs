use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

use crate::app::ports::CatalogNotifier;
use crate::common::error::PipelineError;

/// Logs each refresh request and keeps a copy of it.
#[derive(Debug, Clone, Default)]
pub struct LoggingCatalogNotifier {
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl LoggingCatalogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(table_name, partition_path)` notified so far.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl CatalogNotifier for LoggingCatalogNotifier {
    async fn notify(&self, table_name: &str, partition_path: &str) -> Result<(), PipelineError> {
        info!(table = table_name, partition = partition_path, "Catalog refresh requested");
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((table_name.to_string(), partition_path.to_string()));
        Ok(())
    }
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    table_name: &'a str,
    partition_path: &'a str,
}

/// POSTs `{"table_name", "partition_path"}` to a catalog webhook.
#[derive(Debug, Clone)]
pub struct WebhookCatalogNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookCatalogNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl CatalogNotifier for WebhookCatalogNotifier {
    async fn notify(&self, table_name: &str, partition_path: &str) -> Result<(), PipelineError> {
        let failed = |reason: String| PipelineError::Notify {
            table_name: table_name.to_string(),
            partition_path: partition_path.to_string(),
            reason,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&RefreshRequest {
                table_name,
                partition_path,
            })
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("webhook returned HTTP {}", status.as_u16())));
        }
        info!(table = table_name, partition = partition_path, "Catalog webhook notified");
        Ok(())
    }
}
