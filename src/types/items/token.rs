use std::fmt;

use alloy::primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TokenType {
    #[serde(rename = "ERC20")]
    Erc20,
    #[serde(rename = "ERC721")]
    Erc721,
    #[serde(rename = "ERC1155")]
    Erc1155,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Erc20 => "ERC20",
            TokenType::Erc721 => "ERC721",
            TokenType::Erc1155 => "ERC1155",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().replace('-', "").as_str() {
            "ERC20" => Some(TokenType::Erc20),
            "ERC721" => Some(TokenType::Erc721),
            "ERC1155" => Some(TokenType::Erc1155),
            _ => None,
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenTransfer {
    pub transaction_hash: B256,
    pub log_index: u64,
    pub block_number: u64,
    pub block_hash: B256,
    pub block_timestamp: u64,
    pub token_address: Address,
    pub token_type: TokenType,
    pub from_address: Address,
    pub to_address: Address,
    #[serde(with = "super::option_u256_decimal")]
    pub token_id: Option<U256>,
    #[serde(with = "super::u256_decimal")]
    pub value: U256,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub address: Address,
    pub token_type: TokenType,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub decimals: Option<u8>,
    #[serde(with = "super::option_u256_decimal")]
    pub total_supply: Option<U256>,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBalance {
    pub address: Address,
    pub token_address: Address,
    pub token_type: TokenType,
    #[serde(with = "super::option_u256_decimal")]
    pub token_id: Option<U256>,
    #[serde(with = "super::u256_decimal")]
    pub balance: U256,
    pub block_number: u64,
    pub block_timestamp: u64,
}
