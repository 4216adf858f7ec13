use alloy::primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

/// One call frame of a transaction's execution.
///
/// `trace_address` is the dash-joined path of child indexes from the root
/// frame; the root frame has an empty address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: String,
    pub transaction_hash: B256,
    pub transaction_index: u64,
    pub block_number: u64,
    pub block_hash: B256,
    pub block_timestamp: u64,
    pub trace_address: String,
    pub subtraces: u64,
    pub from_address: Address,
    pub to_address: Option<Address>,
    #[serde(with = "super::u256_decimal")]
    pub value: U256,
    pub input: Bytes,
    pub output: Option<Bytes>,
    pub trace_type: String,
    pub call_type: Option<String>,
    pub gas: u64,
    pub gas_used: u64,
    pub error: Option<String>,
    pub status: u8,
}

impl Trace {
    pub fn depth(&self) -> usize {
        if self.trace_address.is_empty() {
            0
        } else {
            self.trace_address.split('-').count()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractInternalTransaction {
    pub trace_id: String,
    pub transaction_hash: B256,
    pub transaction_index: u64,
    pub block_number: u64,
    pub block_hash: B256,
    pub block_timestamp: u64,
    pub trace_type: String,
    pub from_address: Address,
    pub to_address: Option<Address>,
    #[serde(with = "super::u256_decimal")]
    pub value: U256,
    pub gas: u64,
    pub gas_used: u64,
    pub error: Option<String>,
    pub status: u8,
}

impl From<&Trace> for ContractInternalTransaction {
    fn from(trace: &Trace) -> Self {
        Self {
            trace_id: trace.trace_id.clone(),
            transaction_hash: trace.transaction_hash,
            transaction_index: trace.transaction_index,
            block_number: trace.block_number,
            block_hash: trace.block_hash,
            block_timestamp: trace.block_timestamp,
            trace_type: trace
                .call_type
                .clone()
                .unwrap_or_else(|| trace.trace_type.clone()),
            from_address: trace.from_address,
            to_address: trace.to_address,
            value: trace.value,
            gas: trace.gas,
            gas_used: trace.gas_used,
            error: trace.error.clone(),
            status: trace.status,
        }
    }
}
