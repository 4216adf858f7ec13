//! Explorer request handlers

use std::str::FromStr;

use alloy::primitives::{Address, B256};
use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;

use super::responses::*;
use super::ApiState;

const BLOCK_COLUMNS: &str = "hash, number, EXTRACT(EPOCH FROM timestamp)::BIGINT AS timestamp, parent_hash, \
     miner, gas_limit, gas_used, base_fee_per_gas::text AS base_fee_per_gas, size, transactions_count";

const TRANSACTION_COLUMNS: &str = "hash, block_number, block_hash, \
     EXTRACT(EPOCH FROM block_timestamp)::BIGINT AS block_timestamp, transaction_index, from_address, \
     to_address, value::text AS value, input, nonce, gas, gas_price::text AS gas_price, transaction_type, \
     receipt_status, receipt_gas_used, receipt_effective_gas_price::text AS receipt_effective_gas_price, \
     receipt_contract_address";

const TRANSFER_COLUMNS: &str = "tt.transaction_hash, tt.log_index, tt.block_number, \
     EXTRACT(EPOCH FROM tt.block_timestamp)::BIGINT AS block_timestamp, tt.token_address, tt.token_type, \
     tt.from_address, tt.to_address, tt.token_id::text AS token_id, tt.value::text AS value, \
     t.symbol AS token_symbol, t.decimals AS token_decimals";

/// Block number or block hash from the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockId {
    Number(i64),
    Hash(B256),
}

pub fn parse_block_id(raw: &str) -> Result<BlockId, ApiError> {
    let raw = raw.trim();
    if raw.starts_with("0x") || raw.len() == 64 {
        return parse_hash(raw).map(BlockId::Hash);
    }
    raw.parse::<i64>()
        .ok()
        .filter(|n| *n >= 0)
        .map(BlockId::Number)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid block number or hash '{}'", raw)))
}

pub fn parse_hash(raw: &str) -> Result<B256, ApiError> {
    B256::from_str(raw.trim()).map_err(|_| ApiError::BadRequest(format!("invalid hash '{}'", raw)))
}

pub fn parse_address(raw: &str) -> Result<Address, ApiError> {
    Address::from_str(raw.trim()).map_err(|_| ApiError::BadRequest(format!("invalid address '{}'", raw)))
}

fn hex_string(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

fn get_hex(row: &Row, column: &str) -> Result<String, tokio_postgres::Error> {
    let bytes: Vec<u8> = row.try_get(column)?;
    Ok(hex_string(&bytes))
}

fn get_opt_hex(row: &Row, column: &str) -> Result<Option<String>, tokio_postgres::Error> {
    let bytes: Option<Vec<u8>> = row.try_get(column)?;
    Ok(bytes.map(|b| hex_string(&b)))
}

fn block_from_row(row: &Row) -> Result<BlockSummary, tokio_postgres::Error> {
    Ok(BlockSummary {
        hash: get_hex(row, "hash")?,
        number: row.try_get("number")?,
        timestamp: row.try_get("timestamp")?,
        parent_hash: get_hex(row, "parent_hash")?,
        miner: get_hex(row, "miner")?,
        gas_limit: row.try_get("gas_limit")?,
        gas_used: row.try_get("gas_used")?,
        base_fee_per_gas: row.try_get("base_fee_per_gas")?,
        size: row.try_get("size")?,
        transactions_count: row.try_get("transactions_count")?,
    })
}

fn transaction_from_row(row: &Row) -> Result<TransactionResponse, tokio_postgres::Error> {
    Ok(TransactionResponse {
        hash: get_hex(row, "hash")?,
        block_number: row.try_get("block_number")?,
        block_hash: get_hex(row, "block_hash")?,
        block_timestamp: row.try_get("block_timestamp")?,
        transaction_index: row.try_get("transaction_index")?,
        from_address: get_hex(row, "from_address")?,
        to_address: get_opt_hex(row, "to_address")?,
        value: row.try_get("value")?,
        input: get_opt_hex(row, "input")?.unwrap_or_else(|| "0x".to_string()),
        nonce: row.try_get("nonce")?,
        gas: row.try_get("gas")?,
        gas_price: row.try_get("gas_price")?,
        transaction_type: row.try_get("transaction_type")?,
        receipt_status: row.try_get("receipt_status")?,
        receipt_gas_used: row.try_get("receipt_gas_used")?,
        receipt_effective_gas_price: row.try_get("receipt_effective_gas_price")?,
        receipt_contract_address: get_opt_hex(row, "receipt_contract_address")?,
    })
}

fn transfer_from_row(row: &Row) -> Result<TokenTransferResponse, tokio_postgres::Error> {
    Ok(TokenTransferResponse {
        transaction_hash: get_hex(row, "transaction_hash")?,
        log_index: row.try_get("log_index")?,
        block_number: row.try_get("block_number")?,
        block_timestamp: row.try_get("block_timestamp")?,
        token_address: get_hex(row, "token_address")?,
        token_type: row.try_get("token_type")?,
        from_address: get_hex(row, "from_address")?,
        to_address: get_hex(row, "to_address")?,
        token_id: row.try_get("token_id")?,
        value: row.try_get("value")?,
        token_symbol: row.try_get("token_symbol")?,
        token_decimals: row.try_get("token_decimals")?,
    })
}

/// Seconds between a block and its predecessor; 0 without a predecessor.
pub fn seconds_since(timestamp: i64, previous: Option<i64>) -> i64 {
    previous.map(|p| (timestamp - p).max(0)).unwrap_or(0)
}

async fn count(state: &ApiState, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<i64, ApiError> {
    let row = state.pool.query_opt(sql, params).await?;
    Ok(match row {
        Some(r) => r.try_get::<_, Option<i64>>(0)?.unwrap_or(0),
        None => 0,
    })
}

pub async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().timestamp(),
        "service": "hemera-indexer"
    }))
}

pub async fn list_blocks(
    State(state): State<ApiState>,
    Query(params): Query<PageParams>,
) -> Result<Json<Paginated<BlockSummary>>, ApiError> {
    let page = params.resolve(state.max_page_size);
    let sql = format!(
        "SELECT {} FROM blocks WHERE NOT reorg ORDER BY number DESC LIMIT $1 OFFSET $2",
        BLOCK_COLUMNS
    );
    let rows = state.pool.query(&sql, &[&page.limit(), &page.offset()]).await?;
    let blocks = rows.iter().map(block_from_row).collect::<Result<Vec<_>, _>>()?;
    let total = count(&state, "SELECT COUNT(*) FROM blocks WHERE NOT reorg", &[]).await?;
    Ok(Json(Paginated::new(blocks, total, page)))
}

pub async fn get_block(
    State(state): State<ApiState>,
    Path(number_or_hash): Path<String>,
) -> Result<Json<BlockDetail>, ApiError> {
    let row = match parse_block_id(&number_or_hash)? {
        BlockId::Number(n) => {
            let sql = format!("SELECT {} FROM blocks WHERE number = $1 AND NOT reorg", BLOCK_COLUMNS);
            state.pool.query_opt(&sql, &[&n]).await?
        }
        BlockId::Hash(hash) => {
            let sql = format!("SELECT {} FROM blocks WHERE hash = $1", BLOCK_COLUMNS);
            state.pool.query_opt(&sql, &[&hash.to_vec()]).await?
        }
    };
    let block = match row {
        Some(r) => block_from_row(&r)?,
        None => return Err(ApiError::NotFound(format!("block {}", number_or_hash))),
    };

    let internal_transaction_count = count(
        &state,
        "SELECT COUNT(*) FROM contract_internal_transactions WHERE block_number = $1 AND NOT reorg",
        &[&block.number],
    )
    .await?;

    let previous_number = block.number - 1;
    let previous: Option<i64> = state
        .pool
        .query_opt(
            "SELECT EXTRACT(EPOCH FROM timestamp)::BIGINT FROM blocks WHERE number = $1 AND NOT reorg",
            &[&previous_number],
        )
        .await?
        .map(|r| r.try_get(0))
        .transpose()?;

    let latest = count(&state, "SELECT MAX(number) FROM blocks WHERE NOT reorg", &[]).await?;

    let gas_fee_token_price: String = state
        .pool
        .query_opt(
            "SELECT price::text FROM token_hourly_prices WHERE symbol = $1 AND timestamp <= to_timestamp($2::bigint) \
             ORDER BY timestamp DESC LIMIT 1",
            &[&state.native_token_symbol, &block.timestamp],
        )
        .await?
        .map(|r| r.try_get(0))
        .transpose()?
        .unwrap_or_else(|| "0".to_string());

    Ok(Json(BlockDetail {
        internal_transaction_count,
        gas_fee_token_price,
        seconds_since_last_block: seconds_since(block.timestamp, previous),
        is_last_block: block.number == latest,
        block,
    }))
}

#[derive(Debug, Deserialize)]
pub struct TransactionQuery {
    pub page: Option<u32>,
    pub size: Option<u32>,
    pub block: Option<i64>,
}

pub async fn list_transactions(
    State(state): State<ApiState>,
    Query(query): Query<TransactionQuery>,
) -> Result<Json<Paginated<TransactionResponse>>, ApiError> {
    let page = PageParams {
        page: query.page,
        size: query.size,
    }
    .resolve(state.max_page_size);

    let (rows, total) = match query.block {
        Some(block) => {
            let sql = format!(
                "SELECT {} FROM transactions WHERE block_number = $1 AND NOT reorg \
                 ORDER BY transaction_index DESC LIMIT $2 OFFSET $3",
                TRANSACTION_COLUMNS
            );
            let rows = state.pool.query(&sql, &[&block, &page.limit(), &page.offset()]).await?;
            let total = count(
                &state,
                "SELECT COUNT(*) FROM transactions WHERE block_number = $1 AND NOT reorg",
                &[&block],
            )
            .await?;
            (rows, total)
        }
        None => {
            let sql = format!(
                "SELECT {} FROM transactions WHERE NOT reorg \
                 ORDER BY block_number DESC, transaction_index DESC LIMIT $1 OFFSET $2",
                TRANSACTION_COLUMNS
            );
            let rows = state.pool.query(&sql, &[&page.limit(), &page.offset()]).await?;
            let total = count(&state, "SELECT COUNT(*) FROM transactions WHERE NOT reorg", &[]).await?;
            (rows, total)
        }
    };

    let data = rows.iter().map(transaction_from_row).collect::<Result<Vec<_>, _>>()?;
    Ok(Json(Paginated::new(data, total, page)))
}

pub async fn get_transaction(
    State(state): State<ApiState>,
    Path(hash): Path<String>,
) -> Result<Json<TransactionResponse>, ApiError> {
    let parsed = parse_hash(&hash)?;
    let sql = format!("SELECT {} FROM transactions WHERE hash = $1", TRANSACTION_COLUMNS);
    match state.pool.query_opt(&sql, &[&parsed.to_vec()]).await? {
        Some(row) => Ok(Json(transaction_from_row(&row)?)),
        None => Err(ApiError::NotFound(format!("transaction {}", hash))),
    }
}

#[derive(Debug, Deserialize)]
pub struct TransferQuery {
    pub page: Option<u32>,
    pub size: Option<u32>,
    pub token_type: Option<String>,
}

pub async fn list_token_transfers(
    State(state): State<ApiState>,
    Query(query): Query<TransferQuery>,
) -> Result<Json<Paginated<TokenTransferResponse>>, ApiError> {
    let page = PageParams {
        page: query.page,
        size: query.size,
    }
    .resolve(state.max_page_size);

    let token_type = query
        .token_type
        .as_deref()
        .map(|t| {
            crate::types::items::TokenType::parse(t)
                .map(|t| t.as_str().to_string())
                .ok_or_else(|| ApiError::BadRequest(format!("unknown token type '{}'", t)))
        })
        .transpose()?;

    let (rows, total) = match &token_type {
        Some(token_type) => {
            let sql = format!(
                "SELECT {} FROM token_transfers tt LEFT JOIN tokens t ON t.address = tt.token_address \
                 WHERE NOT tt.reorg AND tt.token_type = $1 \
                 ORDER BY tt.block_number DESC, tt.log_index DESC LIMIT $2 OFFSET $3",
                TRANSFER_COLUMNS
            );
            let rows = state.pool.query(&sql, &[token_type, &page.limit(), &page.offset()]).await?;
            let total = count(
                &state,
                "SELECT COUNT(*) FROM token_transfers WHERE NOT reorg AND token_type = $1",
                &[token_type],
            )
            .await?;
            (rows, total)
        }
        None => {
            let sql = format!(
                "SELECT {} FROM token_transfers tt LEFT JOIN tokens t ON t.address = tt.token_address \
                 WHERE NOT tt.reorg ORDER BY tt.block_number DESC, tt.log_index DESC LIMIT $1 OFFSET $2",
                TRANSFER_COLUMNS
            );
            let rows = state.pool.query(&sql, &[&page.limit(), &page.offset()]).await?;
            let total = count(&state, "SELECT COUNT(*) FROM token_transfers WHERE NOT reorg", &[]).await?;
            (rows, total)
        }
    };

    let data = rows.iter().map(transfer_from_row).collect::<Result<Vec<_>, _>>()?;
    Ok(Json(Paginated::new(data, total, page)))
}

pub async fn get_address_token_transfers(
    State(state): State<ApiState>,
    Path(address): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Json<Paginated<TokenTransferResponse>>, ApiError> {
    let page = params.resolve(state.max_page_size);
    let address = parse_address(&address)?.to_vec();

    let sql = format!(
        "SELECT {} FROM token_transfers tt LEFT JOIN tokens t ON t.address = tt.token_address \
         WHERE (tt.from_address = $1 OR tt.to_address = $1) AND NOT tt.reorg \
         ORDER BY tt.block_number DESC, tt.log_index DESC LIMIT $2 OFFSET $3",
        TRANSFER_COLUMNS
    );
    let rows = state.pool.query(&sql, &[&address, &page.limit(), &page.offset()]).await?;
    let total = count(
        &state,
        "SELECT COUNT(*) FROM token_transfers WHERE (from_address = $1 OR to_address = $1) AND NOT reorg",
        &[&address],
    )
    .await?;

    let data = rows.iter().map(transfer_from_row).collect::<Result<Vec<_>, _>>()?;
    Ok(Json(Paginated::new(data, total, page)))
}

pub async fn get_token(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Result<Json<TokenResponse>, ApiError> {
    let parsed = parse_address(&address)?.to_vec();
    let row = state
        .pool
        .query_opt(
            "SELECT address, token_type, name, symbol, decimals, total_supply::text AS total_supply, block_number \
             FROM tokens WHERE address = $1",
            &[&parsed],
        )
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("token {}", address)))?;

    let transfer_count = count(
        &state,
        "SELECT COUNT(*) FROM token_transfers WHERE token_address = $1 AND NOT reorg",
        &[&parsed],
    )
    .await?;

    // holders with a positive balance at their latest recorded block
    let holder_count = count(
        &state,
        "SELECT COUNT(DISTINCT b.address) FROM address_token_balances b \
         WHERE b.token_address = $1 AND NOT b.reorg AND b.balance > 0 \
         AND b.block_number = (SELECT MAX(b2.block_number) FROM address_token_balances b2 \
             WHERE b2.address = b.address AND b2.token_address = b.token_address \
             AND b2.token_id = b.token_id AND NOT b2.reorg)",
        &[&parsed],
    )
    .await?;

    Ok(Json(TokenResponse {
        address: get_hex(&row, "address")?,
        token_type: row.try_get("token_type")?,
        name: row.try_get("name")?,
        symbol: row.try_get("symbol")?,
        decimals: row.try_get("decimals")?,
        total_supply: row.try_get("total_supply")?,
        block_number: row.try_get("block_number")?,
        transfer_count,
        holder_count,
    }))
}
