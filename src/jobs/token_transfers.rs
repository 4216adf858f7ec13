//! Token transfer extraction from ERC-20/721 `Transfer` and ERC-1155
//! `TransferSingle`/`TransferBatch` logs.

use alloy::dyn_abi::{DynSolType, DynSolValue};
use alloy::primitives::{b256, Address, B256, U256};
use async_trait::async_trait;

use super::context::{BlockRange, JobContext};
use super::error::JobError;
use super::traits::Job;
use crate::types::items::{Item, ItemBuffer, ItemType, Log, TokenTransfer, TokenType};

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");
/// keccak256("TransferSingle(address,address,address,uint256,uint256)")
pub const TRANSFER_SINGLE_TOPIC: B256 =
    b256!("c3d58168c5ae7397731d063d5bbf3d657854427343f4c083240f7aacaa2d0f62");
/// keccak256("TransferBatch(address,address,address,uint256[],uint256[])")
pub const TRANSFER_BATCH_TOPIC: B256 =
    b256!("4a39dc06d4c0dbc64b70af90fd698a233a518aa5d07e595d983b8c0526c8f7fb");

/// Transfer event shapes, keyed by topic0 and indexed-argument count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    /// `Transfer(from, to, value)` with `value` in data.
    Erc20,
    /// `Transfer(from, to, tokenId)` with all three indexed.
    Erc721,
    Erc1155Single,
    Erc1155Batch,
}

impl TransferEvent {
    pub fn detect(log: &Log) -> Option<Self> {
        let topic0 = log.topic0?;
        let topics = log.topic_count();
        if topic0 == TRANSFER_TOPIC {
            match topics {
                3 if log.data.len() == 32 => Some(TransferEvent::Erc20),
                4 if log.data.is_empty() => Some(TransferEvent::Erc721),
                _ => None,
            }
        } else if topic0 == TRANSFER_SINGLE_TOPIC && topics == 4 {
            Some(TransferEvent::Erc1155Single)
        } else if topic0 == TRANSFER_BATCH_TOPIC && topics == 4 {
            Some(TransferEvent::Erc1155Batch)
        } else {
            None
        }
    }

    fn token_type(&self) -> TokenType {
        match self {
            TransferEvent::Erc20 => TokenType::Erc20,
            TransferEvent::Erc721 => TokenType::Erc721,
            TransferEvent::Erc1155Single | TransferEvent::Erc1155Batch => TokenType::Erc1155,
        }
    }
}

fn topic_address(topic: Option<B256>) -> Option<Address> {
    topic.map(|t| Address::from_word(t))
}

fn word(data: &[u8], index: usize) -> Option<U256> {
    data.get(index * 32..(index + 1) * 32).map(U256::from_be_slice)
}

fn decode_id_value_arrays(data: &[u8]) -> Option<Vec<(U256, U256)>> {
    let ty = DynSolType::Tuple(vec![
        DynSolType::Array(Box::new(DynSolType::Uint(256))),
        DynSolType::Array(Box::new(DynSolType::Uint(256))),
    ]);
    let decoded = ty.abi_decode_params(data).ok()?;
    let (ids, values) = match decoded {
        DynSolValue::Tuple(mut fields) if fields.len() == 2 => {
            let values = fields.pop()?;
            let ids = fields.pop()?;
            (ids, values)
        }
        _ => return None,
    };
    let as_uints = |v: DynSolValue| -> Option<Vec<U256>> {
        match v {
            DynSolValue::Array(items) => items
                .into_iter()
                .map(|i| match i {
                    DynSolValue::Uint(u, _) => Some(u),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    };
    let ids = as_uints(ids)?;
    let values = as_uints(values)?;
    if ids.len() != values.len() {
        return None;
    }
    Some(merge_repeated_ids(ids.into_iter().zip(values)))
}

/// One entry per token id, first-seen order, values summed. Rows are keyed
/// by (transaction, log index, token id), so repeats would overwrite.
fn merge_repeated_ids(pairs: impl IntoIterator<Item = (U256, U256)>) -> Vec<(U256, U256)> {
    let mut merged: Vec<(U256, U256)> = Vec::new();
    for (id, value) in pairs {
        match merged.iter_mut().find(|(seen, _)| *seen == id) {
            Some((_, total)) => *total = total.saturating_add(value),
            None => merged.push((id, value)),
        }
    }
    merged
}

/// Decode every token transfer carried by `log`. Malformed logs that merely
/// share a topic0 with a transfer event decode to nothing.
pub fn decode_transfers(log: &Log) -> Vec<TokenTransfer> {
    let Some(event) = TransferEvent::detect(log) else {
        return Vec::new();
    };

    let make = |from: Address, to: Address, token_id: Option<U256>, value: U256| TokenTransfer {
        transaction_hash: log.transaction_hash,
        log_index: log.log_index,
        block_number: log.block_number,
        block_hash: log.block_hash,
        block_timestamp: log.block_timestamp,
        token_address: log.address,
        token_type: event.token_type(),
        from_address: from,
        to_address: to,
        token_id,
        value,
    };

    match event {
        TransferEvent::Erc20 => {
            let (Some(from), Some(to), Some(value)) =
                (topic_address(log.topic1), topic_address(log.topic2), word(&log.data, 0))
            else {
                return Vec::new();
            };
            vec![make(from, to, None, value)]
        }
        TransferEvent::Erc721 => {
            let (Some(from), Some(to), Some(id)) = (
                topic_address(log.topic1),
                topic_address(log.topic2),
                log.topic3.map(|t| U256::from_be_bytes(t.0)),
            ) else {
                return Vec::new();
            };
            vec![make(from, to, Some(id), U256::from(1))]
        }
        TransferEvent::Erc1155Single => {
            let (Some(from), Some(to), Some(id), Some(value)) = (
                topic_address(log.topic2),
                topic_address(log.topic3),
                word(&log.data, 0),
                word(&log.data, 1),
            ) else {
                return Vec::new();
            };
            vec![make(from, to, Some(id), value)]
        }
        TransferEvent::Erc1155Batch => {
            let (Some(from), Some(to), Some(pairs)) = (
                topic_address(log.topic2),
                topic_address(log.topic3),
                decode_id_value_arrays(&log.data),
            ) else {
                return Vec::new();
            };
            pairs
                .into_iter()
                .map(|(id, value)| make(from, to, Some(id), value))
                .collect()
        }
    }
}

pub struct ExtractTokenTransfersJob;

#[async_trait]
impl Job for ExtractTokenTransfersJob {
    fn name(&self) -> &'static str {
        "extract_token_transfers"
    }

    fn dependency_types(&self) -> &'static [ItemType] {
        &[ItemType::Log]
    }

    fn output_types(&self) -> &'static [ItemType] {
        &[ItemType::TokenTransfer]
    }

    async fn run(
        &self,
        _ctx: &JobContext,
        range: BlockRange,
        buffer: &mut ItemBuffer,
    ) -> Result<(), JobError> {
        let transfers: Vec<Item> = buffer
            .logs()
            .flat_map(decode_transfers)
            .map(Item::TokenTransfer)
            .collect();

        tracing::debug!("Decoded {} token transfers for {}", transfers.len(), range);
        buffer.extend(transfers);
        Ok(())
    }
}
