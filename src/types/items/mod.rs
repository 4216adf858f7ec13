//! Domain items produced by extraction jobs.
//!
//! Every item carries an [`ItemType`] that routes it to its exporter table
//! or output file. Items live for a single sync batch inside an
//! [`ItemBuffer`] shared by the jobs of that batch.

pub mod chain;
pub mod token;
pub mod trace;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use chain::{Block, Log, Transaction};
pub use token::{Token, TokenBalance, TokenTransfer, TokenType};
pub use trace::{ContractInternalTransaction, Trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Block,
    Transaction,
    Log,
    TokenTransfer,
    Token,
    TokenBalance,
    Trace,
    ContractInternalTransaction,
}

impl ItemType {
    pub const ALL: [ItemType; 8] = [
        ItemType::Block,
        ItemType::Transaction,
        ItemType::Log,
        ItemType::TokenTransfer,
        ItemType::Token,
        ItemType::TokenBalance,
        ItemType::Trace,
        ItemType::ContractInternalTransaction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Block => "block",
            ItemType::Transaction => "transaction",
            ItemType::Log => "log",
            ItemType::TokenTransfer => "token_transfer",
            ItemType::Token => "token",
            ItemType::TokenBalance => "token_balance",
            ItemType::Trace => "trace",
            ItemType::ContractInternalTransaction => "contract_internal_transaction",
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        ItemType::ALL
            .iter()
            .find(|t| t.as_str() == normalized)
            .copied()
            .ok_or_else(|| format!("unknown item type '{}'", s))
    }
}

/// A decoded record destined for one storage table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Item {
    Block(Block),
    Transaction(Transaction),
    Log(Log),
    TokenTransfer(TokenTransfer),
    Token(Token),
    TokenBalance(TokenBalance),
    Trace(Trace),
    ContractInternalTransaction(ContractInternalTransaction),
}

impl Item {
    pub fn item_type(&self) -> ItemType {
        match self {
            Item::Block(_) => ItemType::Block,
            Item::Transaction(_) => ItemType::Transaction,
            Item::Log(_) => ItemType::Log,
            Item::TokenTransfer(_) => ItemType::TokenTransfer,
            Item::Token(_) => ItemType::Token,
            Item::TokenBalance(_) => ItemType::TokenBalance,
            Item::Trace(_) => ItemType::Trace,
            Item::ContractInternalTransaction(_) => ItemType::ContractInternalTransaction,
        }
    }

    pub fn block_number(&self) -> u64 {
        match self {
            Item::Block(b) => b.number,
            Item::Transaction(t) => t.block_number,
            Item::Log(l) => l.block_number,
            Item::TokenTransfer(t) => t.block_number,
            Item::Token(t) => t.block_number,
            Item::TokenBalance(b) => b.block_number,
            Item::Trace(t) => t.block_number,
            Item::ContractInternalTransaction(t) => t.block_number,
        }
    }

    /// Rebuild an item of a known type from its JSON form, as written by
    /// the JSON-lines exporter.
    pub fn from_json(item_type: ItemType, value: serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(match item_type {
            ItemType::Block => Item::Block(serde_json::from_value(value)?),
            ItemType::Transaction => Item::Transaction(serde_json::from_value(value)?),
            ItemType::Log => Item::Log(serde_json::from_value(value)?),
            ItemType::TokenTransfer => Item::TokenTransfer(serde_json::from_value(value)?),
            ItemType::Token => Item::Token(serde_json::from_value(value)?),
            ItemType::TokenBalance => Item::TokenBalance(serde_json::from_value(value)?),
            ItemType::Trace => Item::Trace(serde_json::from_value(value)?),
            ItemType::ContractInternalTransaction => {
                Item::ContractInternalTransaction(serde_json::from_value(value)?)
            }
        })
    }
}

/// Per-batch item storage keyed by item type.
///
/// Jobs read their dependency types from the buffer and append their output
/// types to it. Insertion order within a type is preserved.
#[derive(Debug, Default)]
pub struct ItemBuffer {
    items: HashMap<ItemType, Vec<Item>>,
}

impl ItemBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: Item) {
        self.items.entry(item.item_type()).or_default().push(item);
    }

    pub fn extend(&mut self, items: impl IntoIterator<Item = Item>) {
        for item in items {
            self.push(item);
        }
    }

    pub fn get(&self, item_type: ItemType) -> &[Item] {
        self.items
            .get(&item_type)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn take(&mut self, item_type: ItemType) -> Vec<Item> {
        self.items.remove(&item_type).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.items.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.get(ItemType::Block).iter().filter_map(|i| match i {
            Item::Block(b) => Some(b),
            _ => None,
        })
    }

    pub fn logs(&self) -> impl Iterator<Item = &Log> {
        self.get(ItemType::Log).iter().filter_map(|i| match i {
            Item::Log(l) => Some(l),
            _ => None,
        })
    }

    pub fn token_transfers(&self) -> impl Iterator<Item = &TokenTransfer> {
        self.get(ItemType::TokenTransfer).iter().filter_map(|i| match i {
            Item::TokenTransfer(t) => Some(t),
            _ => None,
        })
    }

    /// Lowest-numbered block currently buffered.
    pub fn first_block(&self) -> Option<&Block> {
        self.blocks().min_by_key(|b| b.number)
    }

    /// Highest-numbered block currently buffered.
    pub fn last_block(&self) -> Option<&Block> {
        self.blocks().max_by_key(|b| b.number)
    }
}

/// Serde adapter writing `U256` as a base-10 string.
pub mod u256_decimal {
    use std::str::FromStr;

    use alloy::primitives::U256;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let s = String::deserialize(deserializer)?;
        U256::from_str(&s).map_err(de::Error::custom)
    }
}

/// Same as [`u256_decimal`] for optional values.
pub mod option_u256_decimal {
    use std::str::FromStr;

    use alloy::primitives::U256;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<U256>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_str(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<U256>, D::Error> {
        let s = Option::<String>::deserialize(deserializer)?;
        s.filter(|s| !s.is_empty())
            .map(|s| U256::from_str(&s).map_err(de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use alloy::primitives::{Address, Bytes, B256, U256};

    use super::*;

    pub fn block(number: u64, hash: u8, parent: u8) -> Block {
        Block {
            hash: B256::repeat_byte(hash),
            number,
            timestamp: 1_700_000_000 + number * 12,
            parent_hash: B256::repeat_byte(parent),
            miner: Address::repeat_byte(0x11),
            gas_limit: 30_000_000,
            gas_used: 21_000,
            base_fee_per_gas: Some(U256::from(7)),
            size: Some(512),
            transactions_count: 0,
            transactions: Vec::new(),
        }
    }

    pub fn log(block_number: u64, log_index: u64, address: Address, topics: Vec<B256>, data: Bytes) -> Log {
        let mut topic_iter = topics.into_iter();
        Log {
            transaction_hash: B256::repeat_byte(0xaa),
            log_index,
            block_number,
            block_hash: B256::repeat_byte(block_number as u8),
            block_timestamp: 1_700_000_000,
            transaction_index: 0,
            address,
            topic0: topic_iter.next(),
            topic1: topic_iter.next(),
            topic2: topic_iter.next(),
            topic3: topic_iter.next(),
            data,
        }
    }

    pub fn erc20_transfer(block_number: u64, token: Address, from: Address, to: Address, value: u64) -> TokenTransfer {
        TokenTransfer {
            transaction_hash: B256::repeat_byte(0xaa),
            log_index: 0,
            block_number,
            block_hash: B256::repeat_byte(block_number as u8),
            block_timestamp: 1_700_000_000,
            token_address: token,
            token_type: TokenType::Erc20,
            from_address: from,
            to_address: to,
            token_id: None,
            value: U256::from(value),
        }
    }
}
