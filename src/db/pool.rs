use std::collections::HashMap;
use std::path::Path;

use bytes::BytesMut;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;

use super::error::DbError;
use super::types::{ConflictAction, DbOperation, DbValue, WhereClause};

/// Postgres caps bind parameters per statement at u16::MAX.
const MAX_BIND_PARAMS: usize = 65_535;

pub struct DbPool {
    pool: Pool,
}

impl DbPool {
    pub async fn new(database_url: &str, max_size: usize) -> Result<Self, DbError> {
        let config = database_url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| DbError::InvalidConnectionString(e.to_string()))?;

        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let manager = Manager::from_config(config, NoTls, manager_config);

        let pool = Pool::builder(manager)
            .max_size(max_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(DbError::BuildError)?;

        let _conn = pool.get().await?;
        tracing::info!("Database connection pool created (max_size={})", max_size);

        Ok(Self { pool })
    }

    pub fn inner(&self) -> &Pool {
        &self.pool
    }

    pub async fn execute_transaction(&self, operations: Vec<DbOperation>) -> Result<(), DbError> {
        if operations.is_empty() {
            return Ok(());
        }

        let mut statements = Vec::new();
        for op in operations {
            statements.extend(build_statements(op)?);
        }

        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;

        for (sql, params) in &statements {
            let params_refs: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

            if let Err(e) = transaction.execute(sql.as_str(), &params_refs[..]).await {
                let db_err: DbError = e.into();
                tracing::error!("SQL execution failed\n  SQL: {}\n  Error: {}", truncate_sql(sql), db_err);
                return Err(db_err);
            }
        }

        transaction.commit().await?;
        Ok(())
    }

    /// Run a multi-statement SQL script inside one transaction.
    pub async fn execute_script(&self, sql: &str) -> Result<(), DbError> {
        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;
        transaction.batch_execute(sql).await?;
        transaction.commit().await?;
        Ok(())
    }

    pub async fn run_migrations(&self, dir: &Path) -> Result<(), DbError> {
        super::migrations::run(&self.pool, dir).await
    }

    pub async fn query(
        &self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<tokio_postgres::Row>, DbError> {
        let client = self.pool.get().await?;
        let rows = client.query(query, params).await?;
        Ok(rows)
    }

    pub async fn query_opt(
        &self,
        query: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<tokio_postgres::Row>, DbError> {
        let client = self.pool.get().await?;
        let row = client.query_opt(query, params).await?;
        Ok(row)
    }
}

fn truncate_sql(sql: &str) -> &str {
    match sql.char_indices().nth(500) {
        Some((idx, _)) => &sql[..idx],
        None => sql,
    }
}

#[derive(Debug, PartialEq)]
enum SqlParam {
    Null,
    Bool(bool),
    Int64(i64),
    Int16(i16),
    Float64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl ToSql for SqlParam {
    fn to_sql(
        &self,
        ty: &tokio_postgres::types::Type,
        out: &mut BytesMut,
    ) -> Result<tokio_postgres::types::IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlParam::Null => Ok(tokio_postgres::types::IsNull::Yes),
            SqlParam::Bool(v) => v.to_sql(ty, out),
            SqlParam::Int64(v) => v.to_sql(ty, out),
            SqlParam::Int16(v) => v.to_sql(ty, out),
            SqlParam::Float64(v) => v.to_sql(ty, out),
            SqlParam::Text(v) => v.to_sql(ty, out),
            SqlParam::Bytes(v) => v.to_sql(ty, out),
            SqlParam::Json(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(ty: &tokio_postgres::types::Type) -> bool {
        <bool as ToSql>::accepts(ty)
            || <i64 as ToSql>::accepts(ty)
            || <i16 as ToSql>::accepts(ty)
            || <f64 as ToSql>::accepts(ty)
            || <String as ToSql>::accepts(ty)
            || <Vec<u8> as ToSql>::accepts(ty)
            || <serde_json::Value as ToSql>::accepts(ty)
    }

    tokio_postgres::types::to_sql_checked!();
}

fn convert_db_value(value: &DbValue) -> SqlParam {
    match value {
        DbValue::Null => SqlParam::Null,
        DbValue::Bool(v) => SqlParam::Bool(*v),
        DbValue::Int64(v) => SqlParam::Int64(*v),
        DbValue::Int16(v) => SqlParam::Int16(*v),
        DbValue::Text(v) => SqlParam::Text(v.clone()),
        DbValue::Bytes(v) => SqlParam::Bytes(v.clone()),
        DbValue::Numeric(v) => SqlParam::Text(v.clone()),
        DbValue::Timestamp(v) => SqlParam::Float64(*v as f64),
        DbValue::Json(v) => SqlParam::Json(v.clone()),
    }
}

fn convert_values_to_params(values: &[DbValue]) -> Vec<SqlParam> {
    values.iter().map(convert_db_value).collect()
}

/// Generate the SQL placeholder for a value at the given parameter index.
/// Uses casts for types that need special handling:
/// - Timestamp → `to_timestamp($N)`
/// - Numeric → `$N::text::numeric` (sent as text, cast by PostgreSQL)
fn placeholder_for(value: &DbValue, param_idx: usize) -> String {
    match value {
        DbValue::Timestamp(_) => format!("to_timestamp(${})", param_idx),
        DbValue::Numeric(_) => format!("${}::text::numeric", param_idx),
        _ => format!("${}", param_idx),
    }
}

/// Wrap a column name in double quotes to handle reserved keywords.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name)
}

fn quote_cols(columns: &[String]) -> String {
    columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
}

fn build_statements(op: DbOperation) -> Result<Vec<(String, Vec<SqlParam>)>, DbError> {
    Ok(match op {
        DbOperation::Upsert {
            table,
            columns,
            values,
            conflict_columns,
            update_columns,
        } => {
            let action = if update_columns.is_empty() {
                ConflictAction::DoNothing
            } else {
                ConflictAction::DoUpdate {
                    update_columns,
                    condition: None,
                }
            };
            build_bulk_upsert_sql(&table, &columns, vec![values], &conflict_columns, &action)?
        }
        DbOperation::BulkUpsert {
            table,
            columns,
            rows,
            conflict_columns,
            action,
        } => build_bulk_upsert_sql(&table, &columns, rows, &conflict_columns, &action)?,
        DbOperation::Insert {
            table,
            columns,
            values,
        } => build_bulk_upsert_sql(&table, &columns, vec![values], &[], &ConflictAction::Append)?,
        DbOperation::Update {
            table,
            set_columns,
            where_clause,
        } => vec![build_update_sql(&table, &set_columns, &where_clause)],
    })
}

/// Drop rows repeating an earlier conflict key, keeping the last occurrence.
///
/// A single `INSERT ... ON CONFLICT DO UPDATE` fails when two of its rows
/// target the same key.
fn dedup_by_conflict_key(
    columns: &[String],
    rows: Vec<Vec<DbValue>>,
    conflict_columns: &[String],
) -> Vec<Vec<DbValue>> {
    let key_idx: Vec<usize> = conflict_columns
        .iter()
        .filter_map(|c| columns.iter().position(|col| col == c))
        .collect();
    if key_idx.is_empty() {
        return rows;
    }

    let mut last_seen: HashMap<String, usize> = HashMap::new();
    for (i, row) in rows.iter().enumerate() {
        let key = key_idx
            .iter()
            .map(|&k| format!("{:?}", row[k]))
            .collect::<Vec<_>>()
            .join("|");
        last_seen.insert(key, i);
    }

    let mut keep: Vec<usize> = last_seen.into_values().collect();
    keep.sort_unstable();
    let mut rows: Vec<Option<Vec<DbValue>>> = rows.into_iter().map(Some).collect();
    keep.into_iter().filter_map(|i| rows[i].take()).collect()
}

fn build_bulk_upsert_sql(
    table: &str,
    columns: &[String],
    rows: Vec<Vec<DbValue>>,
    conflict_columns: &[String],
    action: &ConflictAction,
) -> Result<Vec<(String, Vec<SqlParam>)>, DbError> {
    if let Some(bad) = rows.iter().find(|r| r.len() != columns.len()) {
        return Err(DbError::ColumnMismatch {
            table: table.to_string(),
            expected: columns.len(),
            got: bad.len(),
        });
    }
    if rows.is_empty() || columns.is_empty() {
        return Ok(Vec::new());
    }

    let rows = match action {
        ConflictAction::Append => rows,
        _ => dedup_by_conflict_key(columns, rows, conflict_columns),
    };

    let conflict_clause = match action {
        ConflictAction::Append => String::new(),
        ConflictAction::DoNothing => {
            format!(" ON CONFLICT ({}) DO NOTHING", quote_cols(conflict_columns))
        }
        ConflictAction::DoUpdate {
            update_columns,
            condition,
        } => {
            let updates: Vec<String> = update_columns
                .iter()
                .map(|c| format!("{} = EXCLUDED.{}", quote_ident(c), quote_ident(c)))
                .collect();
            let mut clause = format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                quote_cols(conflict_columns),
                updates.join(", ")
            );
            if let Some(cond) = condition {
                clause.push_str(" WHERE ");
                clause.push_str(cond);
            }
            clause
        }
    };

    let rows_per_statement = (MAX_BIND_PARAMS / columns.len()).max(1);
    let cols = quote_cols(columns);
    let mut statements = Vec::new();

    for chunk in rows.chunks(rows_per_statement) {
        let mut params = Vec::with_capacity(chunk.len() * columns.len());
        let mut tuples = Vec::with_capacity(chunk.len());
        for row in chunk {
            let placeholders: Vec<String> = row
                .iter()
                .map(|v| {
                    params.push(convert_db_value(v));
                    placeholder_for(v, params.len())
                })
                .collect();
            tuples.push(format!("({})", placeholders.join(", ")));
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}{}",
            table,
            cols,
            tuples.join(", "),
            conflict_clause
        );
        statements.push((sql, params));
    }

    Ok(statements)
}

fn build_update_sql(
    table: &str,
    set_columns: &[(String, DbValue)],
    where_clause: &WhereClause,
) -> (String, Vec<SqlParam>) {
    let mut params = Vec::new();

    let sets: Vec<String> = set_columns
        .iter()
        .map(|(col, val)| {
            params.push(convert_db_value(val));
            format!("{} = {}", quote_ident(col), placeholder_for(val, params.len()))
        })
        .collect();
    let sets_str = sets.join(", ");

    let where_str = build_where_sql(where_clause, &mut params);

    let sql = format!("UPDATE {} SET {} WHERE {}", table, sets_str, where_str);
    (sql, params)
}

fn build_where_sql(where_clause: &WhereClause, params: &mut Vec<SqlParam>) -> String {
    let mut bind = |val: &DbValue, params: &mut Vec<SqlParam>| {
        params.push(convert_db_value(val));
        placeholder_for(val, params.len())
    };

    match where_clause {
        WhereClause::Eq(col, val) => {
            format!("{} = {}", quote_ident(col), bind(val, params))
        }
        WhereClause::And(conditions) => conditions
            .iter()
            .map(|(col, val)| format!("{} = {}", quote_ident(col), bind(val, params)))
            .collect::<Vec<_>>()
            .join(" AND "),
        WhereClause::Between(col, low, high) => {
            let low_ph = bind(low, params);
            let high_ph = bind(high, params);
            format!("{} BETWEEN {} AND {}", quote_ident(col), low_ph, high_ph)
        }
    }
}
