//! Sinks receiving the items of each sync batch.

mod console;
mod csv_file;
mod json_file;
mod postgres;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::db::{DbError, DbPool};
use crate::types::config::output::OutputTarget;
use crate::types::items::{Item, ItemType};

pub use console::ConsoleExporter;
pub use csv_file::CsvFileExporter;
pub use json_file::JsonFileExporter;
pub use postgres::{reorg_tables, table_spec, PostgresExporter, TableSpec};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid output configuration: {0}")]
    Config(String),
}

impl ExportError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ExportError::Database(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[async_trait]
pub trait ItemExporter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Write one batch of items. Implementations either persist the whole
    /// batch or return an error.
    async fn export_items(&self, items: &[Item]) -> Result<(), ExportError>;
}

/// Group items by type, keeping their relative order.
pub(crate) fn group_by_type(items: &[Item]) -> BTreeMap<ItemType, Vec<&Item>> {
    let mut groups: BTreeMap<ItemType, Vec<&Item>> = BTreeMap::new();
    for item in items {
        groups.entry(item.item_type()).or_default().push(item);
    }
    groups
}

/// Fans a batch out to every configured sink in order.
pub struct CompositeExporter {
    exporters: Vec<Box<dyn ItemExporter>>,
}

impl CompositeExporter {
    pub fn new(exporters: Vec<Box<dyn ItemExporter>>) -> Self {
        Self { exporters }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.exporters.iter().map(|e| e.name()).collect()
    }

    pub async fn export_items(&self, items: &[Item]) -> Result<(), ExportError> {
        if items.is_empty() {
            return Ok(());
        }
        for exporter in &self.exporters {
            if let Err(e) = exporter.export_items(items).await {
                tracing::error!("Exporter {} failed on {} items: {}", exporter.name(), items.len(), e);
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Build one exporter per output target. A Postgres target needs `pool`.
pub fn create_exporters(
    targets: &[OutputTarget],
    pool: Option<Arc<DbPool>>,
) -> Result<CompositeExporter, ExportError> {
    if targets.is_empty() {
        return Err(ExportError::Config("at least one output is required".to_string()));
    }

    let mut exporters: Vec<Box<dyn ItemExporter>> = Vec::with_capacity(targets.len());
    for target in targets {
        let exporter: Box<dyn ItemExporter> = match target {
            OutputTarget::Console => Box::new(ConsoleExporter),
            OutputTarget::Postgres(_) => {
                let pool = pool.clone().ok_or_else(|| {
                    ExportError::Config("postgres output configured without a database connection".to_string())
                })?;
                Box::new(PostgresExporter::new(pool))
            }
            OutputTarget::JsonFile(dir) => Box::new(JsonFileExporter::new(dir)?),
            OutputTarget::CsvFile(dir) => Box::new(CsvFileExporter::new(dir)?),
        };
        exporters.push(exporter);
    }

    Ok(CompositeExporter::new(exporters))
}
