//! Per-table rule bundles, resolved once when the pipeline is configured.

pub mod builtin;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::common::error::{PipelineError, Result};
use crate::domain::Schema;
use crate::pipeline::processing::business_rules::{BusinessRule, BusinessRuleEngine};
use crate::pipeline::processing::masking::{MaskingPolicy, SensitiveFieldMasker};
use crate::pipeline::processing::schema_validator::SchemaValidator;
use crate::pipeline::processing::transform::TransformKind;

/// How stage 2 groups curated records into prod partitions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKey {
    /// `ingest_date=YYYY-MM-DD` from the record's `processed_at`
    #[default]
    IngestDate,
    /// `{column}=YYYY-MM-DD` from a declared timestamp column
    Column(String),
}

/// Everything the pipeline needs to know about one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableBundle {
    pub schema: Schema,
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub timestamp_column: Option<String>,
    #[serde(default)]
    pub rules: Vec<BusinessRule>,
    #[serde(default)]
    pub masking: MaskingPolicy,
    #[serde(default)]
    pub transform: TransformKind,
    #[serde(default)]
    pub partition: PartitionKey,
    #[serde(default)]
    pub sort_column: Option<String>,
}

impl TableBundle {
    pub fn table_name(&self) -> &str {
        &self.schema.table_name
    }

    /// Every column the bundle refers to must be declared by its schema.
    fn check_columns(&self) -> Result<()> {
        let declared = |column: &str| self.schema.column(column).is_some();
        let mut referenced: Vec<(&str, &str)> =
            self.primary_key.iter().map(|c| ("primary key", c.as_str())).collect();
        referenced.extend(self.timestamp_column.iter().map(|c| ("timestamp column", c.as_str())));
        referenced.extend(self.sort_column.iter().map(|c| ("sort column", c.as_str())));
        referenced.extend(self.masking.keys().map(|c| ("masked column", c.as_str())));
        if let PartitionKey::Column(column) = &self.partition {
            referenced.push(("partition column", column.as_str()));
        }

        match referenced.into_iter().find(|(_, column)| !declared(column)) {
            Some((role, column)) => Err(PipelineError::Config(format!(
                "table '{}': {role} '{column}' is not declared in the schema",
                self.table_name()
            ))),
            None if self.primary_key.is_empty() => Err(PipelineError::Config(format!(
                "table '{}' declares no primary key",
                self.table_name()
            ))),
            None => Ok(()),
        }
    }
}

/// A bundle with its stage engines built. Shared read-only across batches.
pub struct ResolvedTable {
    pub bundle: TableBundle,
    pub validator: SchemaValidator,
    pub rules: BusinessRuleEngine,
    pub masker: SensitiveFieldMasker,
}

impl ResolvedTable {
    pub fn resolve(bundle: TableBundle) -> Result<Self> {
        bundle.check_columns()?;
        let keys = bundle.primary_key.clone();
        Ok(Self {
            validator: SchemaValidator::new(bundle.schema.clone(), keys.clone())?,
            rules: BusinessRuleEngine::new(bundle.rules.clone(), keys.clone())?,
            masker: SensitiveFieldMasker::new(bundle.masking.clone(), keys),
            bundle,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.bundle.schema
    }

    pub fn key_columns(&self) -> &[String] {
        &self.bundle.primary_key
    }
}

#[derive(Clone, Default)]
pub struct TableRegistry {
    tables: HashMap<String, Arc<ResolvedTable>>,
}

impl TableRegistry {
    pub fn from_bundles(bundles: impl IntoIterator<Item = TableBundle>) -> Result<Self> {
        let mut tables = HashMap::new();
        for bundle in bundles {
            let resolved = ResolvedTable::resolve(bundle)?;
            tables.insert(resolved.bundle.table_name().to_string(), Arc::new(resolved));
        }
        Ok(Self { tables })
    }

    /// The six warehouse tables with their default rules and masks.
    pub fn builtin() -> Result<Self> {
        Self::from_bundles(builtin::bundles())
    }

    /// Built-in bundles, replaced or extended by every `*.json` bundle in `dir`.
    pub fn load_from_directory<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(PipelineError::Config(format!(
                "registry directory does not exist: {}",
                dir.display()
            )));
        }

        let mut bundles: HashMap<String, TableBundle> = builtin::bundles()
            .into_iter()
            .map(|b| (b.table_name().to_string(), b))
            .collect();

        let mut paths = fs::read_dir(dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()?;
        paths.sort();

        for path in paths {
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            let bundle: TableBundle = serde_json::from_str(&content).map_err(|e| {
                PipelineError::Config(format!("failed to parse bundle {}: {e}", path.display()))
            })?;
            debug!(table = bundle.table_name(), path = %path.display(), "Loaded table bundle");
            bundles.insert(bundle.table_name().to_string(), bundle);
        }

        let registry = Self::from_bundles(bundles.into_values())?;
        info!(tables = registry.tables.len(), dir = %dir.display(), "Table registry loaded");
        Ok(registry)
    }

    /// Directory overrides when given, the built-in bundles otherwise.
    pub fn load(dir: Option<&Path>) -> Result<Self> {
        match dir {
            Some(dir) => Self::load_from_directory(dir),
            None => Self::builtin(),
        }
    }

    pub fn get(&self, table_name: &str) -> Result<Arc<ResolvedTable>> {
        self.tables
            .get(table_name)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownTable(table_name.to_string()))
    }

    pub fn table_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tables.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
