use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use alloy::dyn_abi::{DynSolType, DynSolValue};
use alloy::primitives::{Address, Bytes, U256};
use async_trait::async_trait;

use super::context::{BlockRange, JobContext};
use super::error::JobError;
use super::traits::Job;
use crate::rpc::multicall::{encode_call, function_selector};
use crate::rpc::Call;
use crate::types::items::{Item, ItemBuffer, ItemType, Token, TokenType};

const METADATA_FUNCTIONS: [&str; 4] = ["name()", "symbol()", "decimals()", "totalSupply()"];

/// Reads metadata of tokens seen in transfers for the first time.
///
/// Tokens fetched by the last run stay uncommitted until the batch is
/// exported, so a discarded batch emits them again on the next attempt.
pub struct ExportTokensJob {
    known: Mutex<HashSet<Address>>,
    uncommitted: Mutex<HashSet<Address>>,
}

impl ExportTokensJob {
    pub fn new() -> Self {
        Self {
            known: Mutex::new(HashSet::new()),
            uncommitted: Mutex::new(HashSet::new()),
        }
    }

    fn is_known(&self, address: &Address) -> bool {
        self.known
            .lock()
            .map(|known| known.contains(address))
            .unwrap_or(false)
    }

    /// Replace the addresses awaiting commit with those of the latest run.
    fn stage(&self, addresses: impl IntoIterator<Item = Address>) {
        if let Ok(mut uncommitted) = self.uncommitted.lock() {
            uncommitted.clear();
            uncommitted.extend(addresses);
        }
    }
}

impl Default for ExportTokensJob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Job for ExportTokensJob {
    fn name(&self) -> &'static str {
        "export_tokens"
    }

    fn dependency_types(&self) -> &'static [ItemType] {
        &[ItemType::TokenTransfer]
    }

    fn output_types(&self) -> &'static [ItemType] {
        &[ItemType::Token]
    }

    async fn run(
        &self,
        ctx: &JobContext,
        range: BlockRange,
        buffer: &mut ItemBuffer,
    ) -> Result<(), JobError> {
        self.stage([]);

        // latest block and type per unseen token
        let mut pending: BTreeMap<Address, (TokenType, u64)> = BTreeMap::new();
        for transfer in buffer.token_transfers() {
            if self.is_known(&transfer.token_address) {
                continue;
            }
            let entry = pending
                .entry(transfer.token_address)
                .or_insert((transfer.token_type, transfer.block_number));
            entry.1 = entry.1.max(transfer.block_number);
        }

        if pending.is_empty() {
            return Ok(());
        }

        let calls: Vec<Call> = pending
            .iter()
            .flat_map(|(address, (_, block))| {
                METADATA_FUNCTIONS.iter().map(move |sig| {
                    Call::new(*address, encode_call(function_selector(sig), &[]), *block)
                })
            })
            .collect();

        let results = ctx.multicaller.execute(&calls).await?;

        let tokens: Vec<Token> = pending
            .iter()
            .zip(results.chunks(METADATA_FUNCTIONS.len()))
            .map(|((address, (token_type, block)), r)| {
                build_token(*address, *token_type, *block, r)
            })
            .collect();

        tracing::debug!("Fetched metadata of {} new tokens for {}", tokens.len(), range);
        self.stage(pending.keys().copied());
        buffer.extend(tokens.into_iter().map(Item::Token));
        Ok(())
    }

    fn commit(&self) {
        let Ok(mut uncommitted) = self.uncommitted.lock() else {
            return;
        };
        if let Ok(mut known) = self.known.lock() {
            known.extend(uncommitted.drain());
        }
    }
}

/// Results are in `METADATA_FUNCTIONS` order.
fn build_token(address: Address, token_type: TokenType, block_number: u64, results: &[Option<Bytes>]) -> Token {
    let get = |i: usize| results.get(i).and_then(|r| r.as_ref());
    Token {
        address,
        token_type,
        name: get(0).and_then(|b| decode_string(b)),
        symbol: get(1).and_then(|b| decode_string(b)),
        decimals: match token_type {
            TokenType::Erc20 => get(2).and_then(|b| decode_uint(b)).filter(|d| *d <= U256::from(u8::MAX)).map(|d| d.to::<u8>()),
            _ => None,
        },
        total_supply: get(3).and_then(|b| decode_uint(b)),
        block_number,
    }
}

fn decode_uint(data: &[u8]) -> Option<U256> {
    match DynSolType::Uint(256).abi_decode(data).ok()? {
        DynSolValue::Uint(v, _) => Some(v),
        _ => None,
    }
}

/// ABI string, or a null-padded `bytes32` as returned by some older tokens.
fn decode_string(data: &[u8]) -> Option<String> {
    let raw = match DynSolType::String.abi_decode(data) {
        Ok(DynSolValue::String(s)) => s,
        _ if data.len() == 32 => String::from_utf8_lossy(data).into_owned(),
        _ => return None,
    };
    let cleaned: String = raw.chars().filter(|c| *c != '\0').collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}
