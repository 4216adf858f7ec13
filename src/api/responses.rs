//! API request and response types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::DbError;

pub const DEFAULT_PAGE_SIZE: u32 = 25;
pub const MAX_PAGE_SIZE: u32 = 100;

/// `?page=&size=` query parameters
#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub page: Option<u32>,
    pub size: Option<u32>,
}

/// Resolved pagination window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub size: u32,
}

impl Page {
    pub fn offset(&self) -> i64 {
        (self.page as i64 - 1) * self.size as i64
    }

    pub fn limit(&self) -> i64 {
        self.size as i64
    }
}

impl PageParams {
    /// Clamp to `page >= 1` and `1 <= size <= max_size`.
    pub fn resolve(&self, max_size: u32) -> Page {
        let max_size = max_size.clamp(1, MAX_PAGE_SIZE);
        Page {
            page: self.page.unwrap_or(1).max(1),
            size: self.size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, max_size),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub size: u32,
}

impl<T> Paginated<T> {
    pub fn new(mut data: Vec<T>, total: i64, page: Page) -> Self {
        data.truncate(page.size as usize);
        Self {
            data,
            total,
            page: page.page,
            size: page.size,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockSummary {
    pub hash: String,
    pub number: i64,
    pub timestamp: i64,
    pub parent_hash: String,
    pub miner: String,
    pub gas_limit: i64,
    pub gas_used: i64,
    pub base_fee_per_gas: Option<String>,
    pub size: Option<i64>,
    pub transactions_count: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockDetail {
    #[serde(flatten)]
    pub block: BlockSummary,
    pub internal_transaction_count: i64,
    /// Native token price in USD at the block time, "0" when unknown.
    pub gas_fee_token_price: String,
    pub seconds_since_last_block: i64,
    pub is_last_block: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub hash: String,
    pub block_number: i64,
    pub block_hash: String,
    pub block_timestamp: i64,
    pub transaction_index: i64,
    pub from_address: String,
    pub to_address: Option<String>,
    pub value: String,
    pub input: String,
    pub nonce: i64,
    pub gas: i64,
    pub gas_price: Option<String>,
    pub transaction_type: Option<i64>,
    pub receipt_status: Option<i64>,
    pub receipt_gas_used: Option<i64>,
    pub receipt_effective_gas_price: Option<String>,
    pub receipt_contract_address: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenTransferResponse {
    pub transaction_hash: String,
    pub log_index: i64,
    pub block_number: i64,
    pub block_timestamp: i64,
    pub token_address: String,
    pub token_type: String,
    pub from_address: String,
    pub to_address: String,
    pub token_id: String,
    pub value: String,
    pub token_symbol: Option<String>,
    pub token_decimals: Option<i16>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub address: String,
    pub token_type: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub decimals: Option<i16>,
    pub total_supply: Option<String>,
    pub block_number: i64,
    pub transfer_count: i64,
    pub holder_count: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
    pub timestamp: i64,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Database error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Database(_) | ApiError::Postgres(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("API request failed: {}", self);
        }
        let body = ErrorResponse {
            error: self.to_string(),
            code: status.as_u16(),
            timestamp: chrono::Utc::now().timestamp(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_params_are_clamped() {
        let page = PageParams { page: Some(0), size: Some(1_000) }.resolve(100);
        assert_eq!(page, Page { page: 1, size: 100 });
        assert_eq!(page.offset(), 0);

        let page = PageParams { page: Some(3), size: Some(10) }.resolve(100);
        assert_eq!(page.offset(), 20);
        assert_eq!(page.limit(), 10);

        let page = PageParams::default().resolve(500);
        assert_eq!(page, Page { page: 1, size: DEFAULT_PAGE_SIZE });

        let page = PageParams { page: None, size: Some(0) }.resolve(100);
        assert_eq!(page.size, 1);
    }

    #[test]
    fn test_paginated_never_exceeds_size() {
        let page = PageParams { page: Some(2), size: Some(3) }.resolve(100);
        let body = Paginated::new(vec![1, 2, 3, 4, 5], 40, page);
        assert_eq!(body.data.len(), 3);

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["total"], 40);
        assert_eq!(json["page"], 2);
        assert_eq!(json["size"], 3);
        assert!(json["data"].as_array().unwrap().len() <= 3);
    }

    #[test]
    fn test_block_detail_flattens_block_fields() {
        let detail = BlockDetail {
            block: BlockSummary {
                hash: "0x01".into(),
                number: 10,
                timestamp: 1_700_000_012,
                parent_hash: "0x00".into(),
                miner: "0x02".into(),
                gas_limit: 30_000_000,
                gas_used: 21_000,
                base_fee_per_gas: Some("7".into()),
                size: None,
                transactions_count: 1,
            },
            internal_transaction_count: 2,
            gas_fee_token_price: "0".into(),
            seconds_since_last_block: 12,
            is_last_block: true,
        };
        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["number"], 10);
        for key in ["internal_transaction_count", "gas_fee_token_price", "seconds_since_last_block", "is_last_block"] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(ApiError::NotFound("block".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
    }
}
