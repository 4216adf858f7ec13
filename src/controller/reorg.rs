//! Soft deletion of reorganized block ranges.

use std::sync::Arc;

use crate::db::{DbError, DbOperation, DbPool, DbValue, WhereClause};
use crate::error::HemeraError;
use crate::exporters::reorg_tables;
use crate::jobs::BlockRange;

use super::sync_recorder::SyncRecorder;

/// Flags rows of a reorganized range with `reorg = true` and rewinds the
/// sync cursor to just before it.
pub struct ReorgController {
    pool: Option<Arc<DbPool>>,
}

impl ReorgController {
    pub fn new(pool: Option<Arc<DbPool>>) -> Self {
        Self { pool }
    }

    /// Range covered by the `reorg` command: `ranges` blocks ending at
    /// `block_number`.
    pub fn command_range(block_number: u64, ranges: u64) -> BlockRange {
        let ranges = ranges.max(1);
        BlockRange::new(block_number.saturating_sub(ranges - 1), block_number)
    }

    /// Range flagged when the block after `start - 1` no longer links to it.
    pub fn detected_range(start: u64, depth: u64) -> BlockRange {
        BlockRange::new(start.saturating_sub(depth.max(1)), start.saturating_sub(1))
    }

    pub fn flag_operations(range: BlockRange) -> Result<Vec<DbOperation>, DbError> {
        let now = chrono::Utc::now().timestamp();
        let (low, high) = (DbValue::u64(range.start)?, DbValue::u64(range.end)?);
        Ok(reorg_tables()
            .into_iter()
            .map(|(table, block_column)| DbOperation::Update {
                table: table.to_string(),
                set_columns: vec![
                    ("reorg".to_string(), DbValue::Bool(true)),
                    ("update_time".to_string(), DbValue::Timestamp(now)),
                ],
                where_clause: WhereClause::Between(block_column.to_string(), low.clone(), high.clone()),
            })
            .collect())
    }

    /// Flag `range` and move the cursor back to `range.start - 1` unless it
    /// already points earlier. Returns the new cursor.
    pub async fn handle_reorg(
        &self,
        range: BlockRange,
        recorder: &dyn SyncRecorder,
    ) -> Result<Option<u64>, HemeraError> {
        match &self.pool {
            Some(pool) => {
                pool.execute_transaction(Self::flag_operations(range)?).await?;
                tracing::warn!("Flagged blocks {} as reorganized", range);
            }
            None => tracing::warn!("Reorg at {} with no database configured, only rewinding", range),
        }

        let current = recorder.get_last_synced_block().await?;
        let cursor = rewound_cursor(current, range);
        recorder.set_last_synced_block(cursor).await?;
        tracing::info!("Sync cursor rewound from {:?} to {:?}", current, cursor);
        Ok(cursor)
    }
}

fn rewound_cursor(current: Option<u64>, range: BlockRange) -> Option<u64> {
    let before = range.start.checked_sub(1);
    match current {
        Some(c) if before.map_or(false, |b| c < b) => Some(c),
        None => None,
        _ => before,
    }
}
