use std::io::Write;

use async_trait::async_trait;

use super::{ExportError, ItemExporter};
use crate::types::items::Item;

/// Prints each item as a JSON line tagged with its type.
pub struct ConsoleExporter;

#[async_trait]
impl ItemExporter for ConsoleExporter {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn export_items(&self, items: &[Item]) -> Result<(), ExportError> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for item in items {
            writeln!(out, "{}", render(item)?)?;
        }
        Ok(())
    }
}

fn render(item: &Item) -> Result<String, ExportError> {
    let mut value = serde_json::to_value(item)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("item_type".to_string(), serde_json::Value::from(item.item_type().as_str()));
    }
    Ok(serde_json::to_string(&value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::items::fixtures;

    #[test]
    fn test_render_tags_item_type() {
        let line = render(&Item::Block(fixtures::block(3, 3, 2))).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["item_type"], "block");
        assert_eq!(value["number"], 3);
    }
}
