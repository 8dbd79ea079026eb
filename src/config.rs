use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::error::PipelineError;

/// Immutable configuration handed to every pipeline invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum records per prod part file
    pub batch_size: usize,
    pub validation_enabled: bool,
    pub deduplication_enabled: bool,
    pub masking_enabled: bool,
    pub anomaly: AnomalyConfig,
    pub quality_fail_threshold: f64,
    pub quality_warn_threshold: f64,
    pub retry: RetryConfig,
    pub storage: StorageConfig,
    pub catalog: CatalogConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    pub contamination_rate: f64,
    pub seed: u64,
    pub min_records: usize,
    pub trees: usize,
    pub sample_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory of the local object store
    pub root: PathBuf,
    /// Append-only log of completion events
    pub event_log: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// When set, catalog refreshes are POSTed here; otherwise they are only logged
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub file_name: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            validation_enabled: true,
            deduplication_enabled: true,
            masking_enabled: true,
            anomaly: AnomalyConfig::default(),
            quality_fail_threshold: 0.70,
            quality_warn_threshold: 0.90,
            retry: RetryConfig::default(),
            storage: StorageConfig::default(),
            catalog: CatalogConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            contamination_rate: 0.10,
            seed: 42,
            min_records: 10,
            trees: 100,
            sample_size: 256,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            timeout_secs: 30,
        }
    }
}

impl RetryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            event_log: PathBuf::from("data/events/completion.ndjson"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            file_name: "curator.log".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load from an optional TOML file, then apply `CURATOR_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let content = fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config file '{}'", p.display()))?;
                toml::from_str::<PipelineConfig>(&content)
                    .with_context(|| format!("Failed to parse config file '{}'", p.display()))?
            }
            None => PipelineConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides from a key lookup; split out so tests need not touch the process env.
    pub fn apply_env<F>(&mut self, lookup: F) -> std::result::Result<(), PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: String) -> std::result::Result<T, PipelineError> {
            raw.trim()
                .parse::<T>()
                .map_err(|_| PipelineError::Config(format!("{key} has invalid value '{raw}'")))
        }

        if let Some(v) = lookup("CURATOR_BATCH_SIZE") {
            self.batch_size = parse("CURATOR_BATCH_SIZE", v)?;
        }
        if let Some(v) = lookup("CURATOR_VALIDATION_ENABLED") {
            self.validation_enabled = parse("CURATOR_VALIDATION_ENABLED", v)?;
        }
        if let Some(v) = lookup("CURATOR_DEDUPLICATION_ENABLED") {
            self.deduplication_enabled = parse("CURATOR_DEDUPLICATION_ENABLED", v)?;
        }
        if let Some(v) = lookup("CURATOR_MASKING_ENABLED") {
            self.masking_enabled = parse("CURATOR_MASKING_ENABLED", v)?;
        }
        if let Some(v) = lookup("CURATOR_ANOMALY_CONTAMINATION_RATE") {
            self.anomaly.contamination_rate = parse("CURATOR_ANOMALY_CONTAMINATION_RATE", v)?;
        }
        if let Some(v) = lookup("CURATOR_QUALITY_FAIL_THRESHOLD") {
            self.quality_fail_threshold = parse("CURATOR_QUALITY_FAIL_THRESHOLD", v)?;
        }
        if let Some(v) = lookup("CURATOR_QUALITY_WARN_THRESHOLD") {
            self.quality_warn_threshold = parse("CURATOR_QUALITY_WARN_THRESHOLD", v)?;
        }
        if let Some(v) = lookup("CURATOR_RETRY_ATTEMPTS") {
            self.retry.attempts = parse("CURATOR_RETRY_ATTEMPTS", v)?;
        }
        if let Some(v) = lookup("CURATOR_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(v);
        }
        if let Some(v) = lookup("CURATOR_CATALOG_WEBHOOK_URL") {
            self.catalog.webhook_url = Some(v).filter(|s| !s.trim().is_empty());
        }
        Ok(())
    }

    pub fn validate(&self) -> std::result::Result<(), PipelineError> {
        let fail = self.quality_fail_threshold;
        let warn = self.quality_warn_threshold;
        if !(0.0..=1.0).contains(&fail) || !(0.0..=1.0).contains(&warn) || fail > warn {
            return Err(PipelineError::Config(format!(
                "quality thresholds must satisfy 0 <= fail ({fail}) <= warn ({warn}) <= 1"
            )));
        }
        let rate = self.anomaly.contamination_rate;
        if !(rate > 0.0 && rate <= 0.5) {
            return Err(PipelineError::Config(format!(
                "anomaly contamination rate must be in (0, 0.5], got {rate}"
            )));
        }
        if self.retry.attempts == 0 {
            return Err(PipelineError::Config("retry attempts must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(PipelineError::Config("batch_size must be at least 1".to_string()));
        }
        if self.anomaly.trees == 0 || self.anomaly.sample_size < 2 {
            return Err(PipelineError::Config(
                "anomaly detector needs at least one tree and a sample size of 2".to_string(),
            ));
        }
        Ok(())
    }
}
