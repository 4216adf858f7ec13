use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{group_by_type, ExportError, ItemExporter};
use crate::types::items::{Item, ItemType};

/// Appends items to `<dir>/<item_type>.csv`, writing the header only when
/// the file is created.
pub struct CsvFileExporter {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl CsvFileExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ExportError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn file_path(dir: &Path, item_type: ItemType) -> PathBuf {
        dir.join(format!("{}.csv", item_type.as_str()))
    }
}

#[async_trait]
impl ItemExporter for CsvFileExporter {
    fn name(&self) -> &'static str {
        "csvfile"
    }

    async fn export_items(&self, items: &[Item]) -> Result<(), ExportError> {
        let _guard = self.write_lock.lock().await;
        for (item_type, group) in group_by_type(items) {
            let path = Self::file_path(&self.dir, item_type);
            let is_new = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
            let file = OpenOptions::new().create(true).append(true).open(&path)?;

            let mut writer = csv::WriterBuilder::new().has_headers(is_new).from_writer(file);
            for item in group {
                writer.serialize(item)?;
            }
            writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::Address;

    use super::*;
    use crate::types::items::fixtures;

    #[tokio::test]
    async fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = CsvFileExporter::new(dir.path()).unwrap();
        let token = Address::repeat_byte(1);
        let transfer = |block| {
            Item::TokenTransfer(fixtures::erc20_transfer(block, token, Address::repeat_byte(2), Address::repeat_byte(3), 7))
        };

        exporter.export_items(&[transfer(1), transfer(2)]).await.unwrap();
        exporter.export_items(&[transfer(3)]).await.unwrap();

        let content = fs::read_to_string(dir.path().join("token_transfer.csv")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("transaction_hash,log_index,block_number"));
        assert_eq!(lines.iter().filter(|l| l.starts_with("transaction_hash")).count(), 1);
    }
}
