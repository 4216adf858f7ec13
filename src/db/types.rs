use alloy::primitives::{Address, Bytes, B256, U256};
use serde_json::Value as JsonValue;

use super::error::DbError;

/// A value that can be stored in the database.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    /// NULL value
    Null,
    Bool(bool),
    /// Signed 64-bit integer (BIGINT)
    Int64(i64),
    /// Signed 16-bit integer (SMALLINT)
    Int16(i16),
    /// Text (unlimited length)
    Text(String),
    /// Raw bytes (BYTEA). Addresses and hashes are stored this way.
    Bytes(Vec<u8>),
    /// Numeric string for uint256 values (stored as NUMERIC)
    Numeric(String),
    /// Unix timestamp in seconds (stored as TIMESTAMP)
    Timestamp(i64),
    /// JSONB value
    Json(JsonValue),
}

impl DbValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DbValue::Null)
    }

    /// BIGINT column value; fails instead of wrapping past `i64::MAX`.
    pub fn u64(v: u64) -> Result<Self, DbError> {
        i64::try_from(v).map(DbValue::Int64).map_err(|_| DbError::OutOfRange(v))
    }

    pub fn opt_u64(v: Option<u64>) -> Result<Self, DbError> {
        v.map_or(Ok(DbValue::Null), Self::u64)
    }

    pub fn timestamp(secs: u64) -> Result<Self, DbError> {
        i64::try_from(secs).map(DbValue::Timestamp).map_err(|_| DbError::OutOfRange(secs))
    }

    pub fn address(a: &Address) -> Self {
        DbValue::Bytes(a.to_vec())
    }

    pub fn opt_address(a: Option<&Address>) -> Self {
        a.map(Self::address).unwrap_or(DbValue::Null)
    }

    pub fn hash(h: &B256) -> Self {
        DbValue::Bytes(h.to_vec())
    }

    pub fn opt_hash(h: Option<&B256>) -> Self {
        h.map(Self::hash).unwrap_or(DbValue::Null)
    }

    pub fn bytes(b: &Bytes) -> Self {
        DbValue::Bytes(b.to_vec())
    }

    pub fn numeric(v: &U256) -> Self {
        DbValue::Numeric(v.to_string())
    }

    pub fn opt_numeric(v: Option<&U256>) -> Self {
        v.map(Self::numeric).unwrap_or(DbValue::Null)
    }

    pub fn opt_text(v: Option<&str>) -> Self {
        v.map(|s| DbValue::Text(s.to_string())).unwrap_or(DbValue::Null)
    }
}

/// What an insert does when it hits an existing row.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictAction {
    /// Plain INSERT without a conflict target.
    Append,
    /// ON CONFLICT (...) DO NOTHING
    DoNothing,
    /// ON CONFLICT (...) DO UPDATE SET col = EXCLUDED.col [WHERE condition]
    DoUpdate {
        update_columns: Vec<String>,
        condition: Option<String>,
    },
}

/// Database operation, executed in order inside one transaction.
#[derive(Debug, Clone)]
pub enum DbOperation {
    /// INSERT with ON CONFLICT DO UPDATE (upsert) of a single row
    Upsert {
        table: String,
        columns: Vec<String>,
        values: Vec<DbValue>,
        /// Columns that form the unique constraint
        conflict_columns: Vec<String>,
        /// Columns to update on conflict
        update_columns: Vec<String>,
    },
    /// Multi-row insert; split into several statements when the rows exceed
    /// the bind parameter limit.
    BulkUpsert {
        table: String,
        columns: Vec<String>,
        rows: Vec<Vec<DbValue>>,
        conflict_columns: Vec<String>,
        action: ConflictAction,
    },
    /// Simple INSERT
    Insert {
        table: String,
        columns: Vec<String>,
        values: Vec<DbValue>,
    },
    /// UPDATE with WHERE clause
    Update {
        table: String,
        set_columns: Vec<(String, DbValue)>,
        where_clause: WhereClause,
    },
}

/// WHERE clause for UPDATE operations.
#[derive(Debug, Clone)]
pub enum WhereClause {
    /// column = value
    Eq(String, DbValue),
    /// column1 = value1 AND column2 = value2 AND ...
    And(Vec<(String, DbValue)>),
    /// column BETWEEN low AND high (inclusive)
    Between(String, DbValue, DbValue),
}
