use async_trait::async_trait;

use crate::common::error::{PipelineError, StoreError};
use crate::pipeline::events::CompletionEvent;

/// Key/value object storage for the raw, curated and prod layers.
/// Keys are `/`-separated relative paths.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Atomic: readers see either the previous object or the complete new one.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// All keys under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
}

/// Destination for stage-1 completion events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &CompletionEvent) -> Result<(), PipelineError>;
}

/// Signals an external catalog that a prod partition changed.
#[async_trait]
pub trait CatalogNotifier: Send + Sync {
    async fn notify(&self, table_name: &str, partition_path: &str) -> Result<(), PipelineError>;
}
