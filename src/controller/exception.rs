use std::fmt;
use std::sync::Arc;

use crate::db::{DbError, DbOperation, DbPool, DbValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionLevel {
    Warning,
    Error,
}

impl fmt::Display for ExceptionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionLevel::Warning => f.write_str("warning"),
            ExceptionLevel::Error => f.write_str("error"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExceptionRecord {
    pub job_name: String,
    pub block_number: Option<u64>,
    pub stage: String,
    pub level: ExceptionLevel,
    pub message: String,
}

impl ExceptionRecord {
    fn into_operation(self, record_time: i64) -> Result<DbOperation, DbError> {
        Ok(DbOperation::Insert {
            table: "exception_records".to_string(),
            columns: ["job_name", "block_number", "stage", "level", "message", "record_time"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            values: vec![
                DbValue::Text(self.job_name),
                DbValue::opt_u64(self.block_number)?,
                DbValue::Text(self.stage),
                DbValue::Text(self.level.to_string()),
                DbValue::Text(self.message),
                DbValue::Timestamp(record_time),
            ],
        })
    }
}

/// Logs failures and, with Postgres configured, keeps them in
/// `exception_records`.
#[derive(Clone)]
pub struct ExceptionRecorder {
    pool: Option<Arc<DbPool>>,
}

impl ExceptionRecorder {
    pub fn new(pool: Option<Arc<DbPool>>) -> Self {
        Self { pool }
    }

    pub async fn record(&self, record: ExceptionRecord) {
        match record.level {
            ExceptionLevel::Warning => tracing::warn!(
                "[{}] {} at block {:?}: {}",
                record.stage,
                record.job_name,
                record.block_number,
                record.message
            ),
            ExceptionLevel::Error => tracing::error!(
                "[{}] {} at block {:?}: {}",
                record.stage,
                record.job_name,
                record.block_number,
                record.message
            ),
        }

        let Some(pool) = &self.pool else {
            return;
        };
        let persisted = match record.into_operation(chrono::Utc::now().timestamp()) {
            Ok(op) => pool.execute_transaction(vec![op]).await,
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            tracing::warn!("Failed to persist exception record: {}", e);
        }
    }
}
