//! Re-export of JSON-lines files written by the `jsonfile://` sink.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::exporters::{CompositeExporter, ExportError, JsonFileExporter};
use crate::types::items::{Item, ItemType};

const LOAD_CHUNK: usize = 5_000;

/// Read every item of `item_type` from `dir`; a missing file yields nothing.
pub fn read_items(dir: &Path, item_type: ItemType) -> Result<Vec<Item>, ExportError> {
    let path = JsonFileExporter::file_path(dir, item_type);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let reader = BufReader::new(File::open(&path)?);
    let mut items = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(&line)?;
        items.push(Item::from_json(item_type, value)?);
    }
    Ok(items)
}

/// Feed the files of `types` through `exporter` in chunks. Returns the
/// number of items loaded.
pub async fn load_dir(
    dir: &Path,
    types: &BTreeSet<ItemType>,
    exporter: &CompositeExporter,
) -> Result<usize, ExportError> {
    let mut loaded = 0;
    for item_type in types {
        let items = read_items(dir, *item_type)?;
        for chunk in items.chunks(LOAD_CHUNK) {
            exporter.export_items(chunk).await?;
        }
        tracing::info!("Loaded {} {} items from {}", items.len(), item_type, dir.display());
        loaded += items.len();
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporters::ItemExporter;
    use crate::types::items::fixtures;

    #[tokio::test]
    async fn test_reads_back_jsonfile_output() {
        let dir = tempfile::tempdir().unwrap();
        let writer = JsonFileExporter::new(dir.path()).unwrap();
        let items = vec![
            Item::Block(fixtures::block(1, 1, 0)),
            Item::Block(fixtures::block(2, 2, 1)),
            Item::Log(fixtures::log(2, 0, alloy::primitives::Address::ZERO, vec![], Default::default())),
        ];
        writer.export_items(&items).await.unwrap();

        let blocks = read_items(dir.path(), ItemType::Block).unwrap();
        assert_eq!(blocks, items[..2].to_vec());
        assert!(read_items(dir.path(), ItemType::Trace).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_dir_filters_types() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let writer = JsonFileExporter::new(source.path()).unwrap();
        writer
            .export_items(&[
                Item::Block(fixtures::block(1, 1, 0)),
                Item::Log(fixtures::log(1, 0, alloy::primitives::Address::ZERO, vec![], Default::default())),
            ])
            .await
            .unwrap();

        let exporter = CompositeExporter::new(vec![Box::new(JsonFileExporter::new(target.path()).unwrap())]);
        let types: BTreeSet<ItemType> = [ItemType::Log].into_iter().collect();
        let loaded = load_dir(source.path(), &types, &exporter).await.unwrap();

        assert_eq!(loaded, 1);
        assert!(target.path().join("log.json").exists());
        assert!(!target.path().join("block.json").exists());
    }
}
