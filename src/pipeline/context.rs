use std::sync::Arc;
use tracing::info;

use crate::app::ports::{CatalogNotifier, EventSink, ObjectStore};
use crate::common::error::Result;
use crate::config::PipelineConfig;
use crate::infra::catalog::{LoggingCatalogNotifier, WebhookCatalogNotifier};
use crate::infra::event_log::NdjsonEventSink;
use crate::infra::local_store::LocalObjectStore;
use crate::pipeline::processing::quality_gate::{DefaultQualityGate, QualityGate, QualityGateConfig};
use crate::pipeline::retry::RetryPolicy;
use crate::registry::TableRegistry;

/// Immutable configuration and collaborators handed to every invocation.
/// Cloning is cheap; each batch task gets its own copy.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<PipelineConfig>,
    pub registry: TableRegistry,
    pub store: Arc<dyn ObjectStore>,
    pub events: Arc<dyn EventSink>,
    pub notifier: Arc<dyn CatalogNotifier>,
    pub gate: Arc<dyn QualityGate + Send + Sync>,
}

impl PipelineContext {
    pub fn new(
        config: PipelineConfig,
        registry: TableRegistry,
        store: Arc<dyn ObjectStore>,
        events: Arc<dyn EventSink>,
        notifier: Arc<dyn CatalogNotifier>,
    ) -> Self {
        let gate = DefaultQualityGate::with_config(QualityGateConfig {
            fail_threshold: config.quality_fail_threshold,
            warn_threshold: config.quality_warn_threshold,
        });
        Self {
            config: Arc::new(config),
            registry,
            store,
            events,
            notifier,
            gate: Arc::new(gate),
        }
    }

    /// Local filesystem store and event log from the storage settings; a
    /// webhook notifier when one is configured.
    pub fn from_config(config: PipelineConfig, registry: TableRegistry) -> Result<Self> {
        let store = Arc::new(LocalObjectStore::new(&config.storage.root));
        let events = Arc::new(NdjsonEventSink::new(&config.storage.event_log));
        let notifier: Arc<dyn CatalogNotifier> = match &config.catalog.webhook_url {
            Some(url) => Arc::new(WebhookCatalogNotifier::new(url.clone(), config.retry.timeout())?),
            None => Arc::new(LoggingCatalogNotifier::new()),
        };
        info!(
            root = %config.storage.root.display(),
            event_log = %config.storage.event_log.display(),
            webhook = config.catalog.webhook_url.is_some(),
            "Pipeline context ready"
        );
        Ok(Self::new(config, registry, store, events, notifier))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config.retry)
    }
}
