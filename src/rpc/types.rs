//! JSON-RPC response shapes and their conversion into domain items.
//!
//! Only the fields the indexer stores are declared; unknown fields are
//! ignored so chains with extra block or receipt fields still decode.

use alloy::primitives::{Address, Bytes, B256, U256, U64};
use serde::Deserialize;

use crate::types::items::{Block, Log, Transaction};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    pub hash: B256,
    pub number: U64,
    pub timestamp: U64,
    pub parent_hash: B256,
    #[serde(default)]
    pub miner: Address,
    pub gas_limit: U64,
    pub gas_used: U64,
    #[serde(default)]
    pub base_fee_per_gas: Option<U256>,
    #[serde(default)]
    pub size: Option<U64>,
    #[serde(default)]
    pub transactions: Vec<RpcTransaction>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub hash: B256,
    pub nonce: U64,
    #[serde(default)]
    pub transaction_index: Option<U64>,
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub value: U256,
    pub gas: U64,
    #[serde(default)]
    pub gas_price: Option<U256>,
    #[serde(default)]
    pub max_fee_per_gas: Option<U256>,
    #[serde(default)]
    pub max_priority_fee_per_gas: Option<U256>,
    #[serde(default)]
    pub input: Bytes,
    #[serde(default, rename = "type")]
    pub transaction_type: Option<U64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceipt {
    pub transaction_hash: B256,
    pub transaction_index: U64,
    pub block_hash: B256,
    pub block_number: U64,
    #[serde(default)]
    pub status: Option<U64>,
    pub gas_used: U64,
    pub cumulative_gas_used: U64,
    #[serde(default)]
    pub effective_gas_price: Option<U256>,
    #[serde(default)]
    pub contract_address: Option<Address>,
    #[serde(default)]
    pub logs: Vec<RpcLog>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: Address,
    #[serde(default)]
    pub topics: Vec<B256>,
    #[serde(default)]
    pub data: Bytes,
    pub log_index: U64,
    pub transaction_hash: B256,
    pub transaction_index: U64,
}

/// One entry of a `debug_traceBlockByNumber` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxTraceResult {
    #[serde(default)]
    pub tx_hash: Option<B256>,
    #[serde(default)]
    pub result: Option<CallFrame>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A `callTracer` frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    #[serde(rename = "type")]
    pub call_type: String,
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub value: Option<U256>,
    #[serde(default)]
    pub gas: Option<U64>,
    #[serde(default)]
    pub gas_used: Option<U64>,
    #[serde(default)]
    pub input: Bytes,
    #[serde(default)]
    pub output: Option<Bytes>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub calls: Vec<CallFrame>,
}

impl RpcBlock {
    /// Convert into a block item carrying its transactions, receipts not yet
    /// merged.
    pub fn into_block(self) -> Block {
        let number = self.number.to::<u64>();
        let timestamp = self.timestamp.to::<u64>();
        let hash = self.hash;

        let transactions: Vec<Transaction> = self
            .transactions
            .into_iter()
            .enumerate()
            .map(|(i, tx)| Transaction {
                hash: tx.hash,
                block_number: number,
                block_hash: hash,
                block_timestamp: timestamp,
                transaction_index: tx.transaction_index.map(|v| v.to::<u64>()).unwrap_or(i as u64),
                from_address: tx.from,
                to_address: tx.to,
                value: tx.value,
                input: tx.input,
                nonce: tx.nonce.to::<u64>(),
                gas: tx.gas.to::<u64>(),
                gas_price: tx.gas_price,
                max_fee_per_gas: tx.max_fee_per_gas,
                max_priority_fee_per_gas: tx.max_priority_fee_per_gas,
                transaction_type: tx.transaction_type.map(|v| v.to::<u64>()),
                receipt_status: None,
                receipt_gas_used: None,
                receipt_cumulative_gas_used: None,
                receipt_effective_gas_price: None,
                receipt_contract_address: None,
            })
            .collect();

        Block {
            hash,
            number,
            timestamp,
            parent_hash: self.parent_hash,
            miner: self.miner,
            gas_limit: self.gas_limit.to::<u64>(),
            gas_used: self.gas_used.to::<u64>(),
            base_fee_per_gas: self.base_fee_per_gas,
            size: self.size.map(|v| v.to::<u64>()),
            transactions_count: transactions.len() as u64,
            transactions,
        }
    }
}

impl RpcReceipt {
    /// Copy the receipt fields onto its transaction.
    pub fn apply_to(&self, tx: &mut Transaction) {
        tx.receipt_status = self.status.map(|v| v.to::<u64>());
        tx.receipt_gas_used = Some(self.gas_used.to::<u64>());
        tx.receipt_cumulative_gas_used = Some(self.cumulative_gas_used.to::<u64>());
        tx.receipt_effective_gas_price = self.effective_gas_price;
        tx.receipt_contract_address = self.contract_address;
    }

    /// Log items of this receipt, stamped with the block timestamp.
    pub fn log_items(&self, block_timestamp: u64) -> Vec<Log> {
        self.logs
            .iter()
            .map(|log| {
                let mut topics = log.topics.iter().copied();
                Log {
                    transaction_hash: log.transaction_hash,
                    log_index: log.log_index.to::<u64>(),
                    block_number: self.block_number.to::<u64>(),
                    block_hash: self.block_hash,
                    block_timestamp,
                    transaction_index: log.transaction_index.to::<u64>(),
                    address: log.address,
                    topic0: topics.next(),
                    topic1: topics.next(),
                    topic2: topics.next(),
                    topic3: topics.next(),
                    data: log.data.clone(),
                }
            })
            .collect()
    }
}
