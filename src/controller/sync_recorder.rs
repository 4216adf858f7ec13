//! Persistence of the sync cursor, keyed by mission and entity types.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::{DbError, DbOperation, DbPool, DbValue};
use crate::error::HemeraError;
use crate::types::entity::EntityTypes;

/// Mission name used when none is given.
pub const DEFAULT_MISSION: &str = "stream";

#[async_trait]
pub trait SyncRecorder: Send + Sync {
    /// Last fully exported block, `None` when nothing was synced yet.
    async fn get_last_synced_block(&self) -> Result<Option<u64>, HemeraError>;

    async fn set_last_synced_block(&self, block: Option<u64>) -> Result<(), HemeraError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileRecord {
    last_block_number: i64,
    update_time: String,
}

/// JSON file holding one record per `<mission>:<entity bits>` key.
pub struct FileSyncRecorder {
    path: PathBuf,
    key: String,
}

impl FileSyncRecorder {
    pub fn new(path: impl Into<PathBuf>, mission_type: &str, entity_types: EntityTypes) -> Self {
        Self {
            path: path.into(),
            key: format!("{}:{}", mission_type, entity_types.bits()),
        }
    }

    fn read_all(&self) -> Result<BTreeMap<String, FileRecord>, HemeraError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).map_err(|e| {
            HemeraError::Config(format!("corrupt sync record file {}: {}", self.path.display(), e))
        })
    }
}

#[async_trait]
impl SyncRecorder for FileSyncRecorder {
    async fn get_last_synced_block(&self) -> Result<Option<u64>, HemeraError> {
        let records = self.read_all()?;
        Ok(records
            .get(&self.key)
            .and_then(|r| u64::try_from(r.last_block_number).ok()))
    }

    async fn set_last_synced_block(&self, block: Option<u64>) -> Result<(), HemeraError> {
        let mut records = self.read_all()?;
        records.insert(
            self.key.clone(),
            FileRecord {
                last_block_number: to_stored(block)?,
                update_time: chrono::Utc::now().to_rfc3339(),
            },
        );
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&records)
            .map_err(|e| HemeraError::Config(format!("failed to encode sync record: {}", e)))?;

        // replace atomically
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Row in `sync_records`.
pub struct PgSyncRecorder {
    pool: Arc<DbPool>,
    mission_type: String,
    entity_types: EntityTypes,
}

impl PgSyncRecorder {
    pub fn new(pool: Arc<DbPool>, mission_type: &str, entity_types: EntityTypes) -> Self {
        Self {
            pool,
            mission_type: mission_type.to_string(),
            entity_types,
        }
    }
}

#[async_trait]
impl SyncRecorder for PgSyncRecorder {
    async fn get_last_synced_block(&self) -> Result<Option<u64>, HemeraError> {
        let bits = self.entity_types.bits() as i64;
        let row = self
            .pool
            .query_opt(
                "SELECT last_block_number FROM sync_records WHERE mission_type = $1 AND entity_types = $2",
                &[&self.mission_type, &bits],
            )
            .await?;
        let stored: Option<i64> = row
            .map(|r| r.try_get(0))
            .transpose()
            .map_err(DbError::from)?;
        Ok(stored.and_then(|b| u64::try_from(b).ok()))
    }

    async fn set_last_synced_block(&self, block: Option<u64>) -> Result<(), HemeraError> {
        let op = DbOperation::Upsert {
            table: "sync_records".to_string(),
            columns: vec![
                "mission_type".to_string(),
                "entity_types".to_string(),
                "last_block_number".to_string(),
                "update_time".to_string(),
            ],
            values: vec![
                DbValue::Text(self.mission_type.clone()),
                DbValue::Int64(self.entity_types.bits() as i64),
                DbValue::Int64(to_stored(block)?),
                DbValue::Timestamp(chrono::Utc::now().timestamp()),
            ],
            conflict_columns: vec!["mission_type".to_string(), "entity_types".to_string()],
            update_columns: vec!["last_block_number".to_string(), "update_time".to_string()],
        };
        self.pool.execute_transaction(vec![op]).await?;
        Ok(())
    }
}

/// -1 stands for "nothing synced".
fn to_stored(block: Option<u64>) -> Result<i64, DbError> {
    block.map_or(Ok(-1), |b| i64::try_from(b).map_err(|_| DbError::OutOfRange(b)))
}

/// Build a recorder from `file:<path>` or `pg:<mission>`.
pub fn create_recorder(
    spec: &str,
    entity_types: EntityTypes,
    pool: Option<Arc<DbPool>>,
) -> Result<Box<dyn SyncRecorder>, HemeraError> {
    if let Some(path) = spec.strip_prefix("file:") {
        if path.is_empty() {
            return Err(HemeraError::Config(format!("sync recorder '{}' is missing a path", spec)));
        }
        return Ok(Box::new(FileSyncRecorder::new(Path::new(path), DEFAULT_MISSION, entity_types)));
    }
    if let Some(mission) = spec.strip_prefix("pg:") {
        let pool = pool.ok_or_else(|| {
            HemeraError::Config("pg sync recorder requires a postgres connection".to_string())
        })?;
        let mission = if mission.is_empty() { DEFAULT_MISSION } else { mission };
        return Ok(Box::new(PgSyncRecorder::new(pool, mission, entity_types)));
    }
    Err(HemeraError::Config(format!("unsupported sync recorder '{}'", spec)))
}

/// `pg:<mission>` when Postgres is available, otherwise `file:sync_record`.
pub fn default_recorder_spec(has_postgres: bool) -> String {
    if has_postgres {
        format!("pg:{}", DEFAULT_MISSION)
    } else {
        "file:sync_record".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_recorder_upserts_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync_record");
        let base = FileSyncRecorder::new(&path, "stream", EntityTypes::EXPLORER_BASE);
        let token = FileSyncRecorder::new(&path, "stream", EntityTypes::EXPLORER_TOKEN);

        assert_eq!(base.get_last_synced_block().await.unwrap(), None);

        base.set_last_synced_block(Some(10)).await.unwrap();
        base.set_last_synced_block(Some(25)).await.unwrap();
        token.set_last_synced_block(Some(7)).await.unwrap();

        assert_eq!(base.get_last_synced_block().await.unwrap(), Some(25));
        assert_eq!(token.get_last_synced_block().await.unwrap(), Some(7));

        let content = std::fs::read_to_string(&path).unwrap();
        let records: BTreeMap<String, FileRecord> = serde_json::from_str(&content).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_file_recorder_rewind_to_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = FileSyncRecorder::new(dir.path().join("nested/record"), "stream", EntityTypes::EXPLORER_BASE);
        recorder.set_last_synced_block(Some(3)).await.unwrap();
        recorder.set_last_synced_block(None).await.unwrap();
        assert_eq!(recorder.get_last_synced_block().await.unwrap(), None);
    }

    #[test]
    fn test_stored_cursor_rejects_overflow() {
        assert_eq!(to_stored(None).unwrap(), -1);
        assert_eq!(to_stored(Some(7)).unwrap(), 7);
        assert!(to_stored(Some(u64::MAX)).is_err());
    }

    #[test]
    fn test_create_recorder_specs() {
        assert!(create_recorder("file:/tmp/x", EntityTypes::EXPLORER_BASE, None).is_ok());
        assert!(matches!(
            create_recorder("pg:stream", EntityTypes::EXPLORER_BASE, None).err(),
            Some(HemeraError::Config(_))
        ));
        assert!(create_recorder("redis:x", EntityTypes::EXPLORER_BASE, None).is_err());
        assert!(create_recorder("file:", EntityTypes::EXPLORER_BASE, None).is_err());
        assert_eq!(default_recorder_spec(true), "pg:stream");
        assert_eq!(default_recorder_spec(false), "file:sync_record");
    }
}
