use alloy::primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub hash: B256,
    pub number: u64,
    pub timestamp: u64,
    pub parent_hash: B256,
    pub miner: Address,
    pub gas_limit: u64,
    pub gas_used: u64,
    #[serde(with = "super::option_u256_decimal")]
    pub base_fee_per_gas: Option<U256>,
    pub size: Option<u64>,
    pub transactions_count: u64,
    /// Transactions as returned with the block, before receipts are merged in.
    #[serde(skip)]
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: B256,
    pub block_number: u64,
    pub block_hash: B256,
    pub block_timestamp: u64,
    pub transaction_index: u64,
    pub from_address: Address,
    pub to_address: Option<Address>,
    #[serde(with = "super::u256_decimal")]
    pub value: U256,
    pub input: Bytes,
    pub nonce: u64,
    pub gas: u64,
    #[serde(with = "super::option_u256_decimal")]
    pub gas_price: Option<U256>,
    #[serde(with = "super::option_u256_decimal")]
    pub max_fee_per_gas: Option<U256>,
    #[serde(with = "super::option_u256_decimal")]
    pub max_priority_fee_per_gas: Option<U256>,
    pub transaction_type: Option<u64>,
    pub receipt_status: Option<u64>,
    pub receipt_gas_used: Option<u64>,
    pub receipt_cumulative_gas_used: Option<u64>,
    #[serde(with = "super::option_u256_decimal")]
    pub receipt_effective_gas_price: Option<U256>,
    pub receipt_contract_address: Option<Address>,
}

impl Transaction {
    /// Method id of the call input, if the input is long enough to carry one.
    pub fn method_id(&self) -> Option<[u8; 4]> {
        self.input.get(..4).map(|s| {
            let mut id = [0u8; 4];
            id.copy_from_slice(s);
            id
        })
    }

    pub fn has_receipt(&self) -> bool {
        self.receipt_status.is_some() || self.receipt_gas_used.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Log {
    pub transaction_hash: B256,
    pub log_index: u64,
    pub block_number: u64,
    pub block_hash: B256,
    pub block_timestamp: u64,
    pub transaction_index: u64,
    pub address: Address,
    pub topic0: Option<B256>,
    pub topic1: Option<B256>,
    pub topic2: Option<B256>,
    pub topic3: Option<B256>,
    pub data: Bytes,
}

impl Log {
    pub fn topics(&self) -> Vec<B256> {
        [self.topic0, self.topic1, self.topic2, self.topic3]
            .into_iter()
            .flatten()
            .collect()
    }

    pub fn topic_count(&self) -> usize {
        self.topics().len()
    }
}
