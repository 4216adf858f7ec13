use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{group_by_type, ExportError, ItemExporter};
use crate::types::items::{Item, ItemType};

/// Appends items as JSON lines to `<dir>/<item_type>.json`.
pub struct JsonFileExporter {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ExportError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn file_path(dir: &Path, item_type: ItemType) -> PathBuf {
        dir.join(format!("{}.json", item_type.as_str()))
    }
}

#[async_trait]
impl ItemExporter for JsonFileExporter {
    fn name(&self) -> &'static str {
        "jsonfile"
    }

    async fn export_items(&self, items: &[Item]) -> Result<(), ExportError> {
        let _guard = self.write_lock.lock().await;
        for (item_type, group) in group_by_type(items) {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(Self::file_path(&self.dir, item_type))?;
            let mut writer = BufWriter::new(file);
            for item in group {
                serde_json::to_writer(&mut writer, item)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::items::fixtures;

    #[tokio::test]
    async fn test_appends_one_line_per_item() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = JsonFileExporter::new(dir.path()).unwrap();

        exporter.export_items(&[Item::Block(fixtures::block(1, 1, 0))]).await.unwrap();
        exporter.export_items(&[Item::Block(fixtures::block(2, 2, 1))]).await.unwrap();

        let content = fs::read_to_string(dir.path().join("block.json")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let value: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        let item = Item::from_json(ItemType::Block, value).unwrap();
        assert_eq!(item.block_number(), 2);
        assert!(!dir.path().join("log.json").exists());
    }
}
