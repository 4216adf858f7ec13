use std::collections::BTreeSet;

use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{Address, U256};
use async_trait::async_trait;

use super::context::{BlockRange, JobContext};
use super::error::JobError;
use super::traits::Job;
use crate::rpc::multicall::{encode_call, function_selector};
use crate::rpc::Call;
use crate::types::items::{Item, ItemBuffer, ItemType, TokenBalance, TokenTransfer, TokenType};

/// Balance of one holder for one token (and id, for ERC-1155) at a block.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct BalanceKey {
    block_number: u64,
    token_address: Address,
    holder: Address,
    token_id: Option<U256>,
    token_type: TokenType,
    block_timestamp: u64,
}

/// Holders touched by the transfers, one entry per (block, token, holder,
/// id). The zero address is skipped as it stands for mint and burn.
fn touched_balances<'a>(transfers: impl Iterator<Item = &'a TokenTransfer>) -> BTreeSet<BalanceKey> {
    let mut keys = BTreeSet::new();
    for transfer in transfers {
        for holder in [transfer.from_address, transfer.to_address] {
            if holder == Address::ZERO {
                continue;
            }
            keys.insert(BalanceKey {
                block_number: transfer.block_number,
                token_address: transfer.token_address,
                holder,
                token_id: match transfer.token_type {
                    TokenType::Erc1155 => transfer.token_id,
                    _ => None,
                },
                token_type: transfer.token_type,
                block_timestamp: transfer.block_timestamp,
            });
        }
    }
    keys
}

fn balance_call(key: &BalanceKey) -> Call {
    let calldata = match (key.token_type, key.token_id) {
        (TokenType::Erc1155, Some(id)) => encode_call(
            function_selector("balanceOf(address,uint256)"),
            &[DynSolValue::Address(key.holder), DynSolValue::Uint(id, 256)],
        ),
        _ => encode_call(
            function_selector("balanceOf(address)"),
            &[DynSolValue::Address(key.holder)],
        ),
    };
    Call::new(key.token_address, calldata, key.block_number)
}

/// Reads post-batch balances of every holder touched by a transfer.
pub struct ExportTokenBalancesJob;

#[async_trait]
impl Job for ExportTokenBalancesJob {
    fn name(&self) -> &'static str {
        "export_token_balances"
    }

    fn dependency_types(&self) -> &'static [ItemType] {
        &[ItemType::TokenTransfer]
    }

    fn output_types(&self) -> &'static [ItemType] {
        &[ItemType::TokenBalance]
    }

    async fn run(
        &self,
        ctx: &JobContext,
        range: BlockRange,
        buffer: &mut ItemBuffer,
    ) -> Result<(), JobError> {
        let keys: Vec<BalanceKey> = touched_balances(buffer.token_transfers()).into_iter().collect();
        if keys.is_empty() {
            return Ok(());
        }

        let calls: Vec<Call> = keys.iter().map(balance_call).collect();
        let results = ctx.multicaller.execute(&calls).await?;

        let mut skipped = 0;
        let mut balances = Vec::with_capacity(keys.len());
        for (key, result) in keys.into_iter().zip(results) {
            match result.as_deref().and_then(|data| decode_balance(data)) {
                Some(balance) => balances.push(Item::TokenBalance(TokenBalance {
                    address: key.holder,
                    token_address: key.token_address,
                    token_type: key.token_type,
                    token_id: key.token_id,
                    balance,
                    block_number: key.block_number,
                    block_timestamp: key.block_timestamp,
                })),
                None => skipped += 1,
            }
        }

        if skipped > 0 {
            tracing::debug!("{} balanceOf calls failed for {}", skipped, range);
        }
        buffer.extend(balances);
        Ok(())
    }
}

fn decode_balance(data: &[u8]) -> Option<U256> {
    data.get(..32).map(U256::from_be_slice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::items::fixtures;

    #[test]
    fn test_touched_balances_dedup_and_skip_zero() {
        let token = Address::repeat_byte(0x10);
        let a = Address::repeat_byte(1);
        let b = Address::repeat_byte(2);
        let transfers = vec![
            fixtures::erc20_transfer(5, token, Address::ZERO, a, 10),
            fixtures::erc20_transfer(5, token, a, b, 3),
            fixtures::erc20_transfer(6, token, b, a, 1),
        ];

        let keys: Vec<(u64, Address)> = touched_balances(transfers.iter())
            .into_iter()
            .map(|k| (k.block_number, k.holder))
            .collect();
        assert_eq!(keys, vec![(5, a), (5, b), (6, a), (6, b)]);
    }

    #[test]
    fn test_erc1155_balance_call_includes_id() {
        let mut transfer = fixtures::erc20_transfer(5, Address::repeat_byte(0x10), Address::repeat_byte(1), Address::repeat_byte(2), 1);
        transfer.token_type = TokenType::Erc1155;
        transfer.token_id = Some(U256::from(9));

        let keys: Vec<BalanceKey> = touched_balances([transfer].iter()).into_iter().collect();
        assert_eq!(keys.len(), 2);
        let call = balance_call(&keys[0]);
        assert_eq!(&call.calldata[..4], &function_selector("balanceOf(address,uint256)"));
        assert_eq!(call.calldata.len(), 4 + 64);
        assert_eq!(call.block_number, 5);
        assert_eq!(call.target, Address::repeat_byte(0x10));
    }

    #[test]
    fn test_erc721_balance_ignores_token_id() {
        let mut transfer = fixtures::erc20_transfer(5, Address::repeat_byte(0x10), Address::repeat_byte(1), Address::repeat_byte(2), 1);
        transfer.token_type = TokenType::Erc721;
        transfer.token_id = Some(U256::from(9));

        let keys: Vec<BalanceKey> = touched_balances([transfer].iter()).into_iter().collect();
        assert!(keys.iter().all(|k| k.token_id.is_none()));
        assert_eq!(balance_call(&keys[0]).calldata.len(), 4 + 32);
    }

    #[test]
    fn test_decode_balance() {
        assert_eq!(decode_balance(&U256::from(77).to_be_bytes::<32>()), Some(U256::from(77)));
        assert_eq!(decode_balance(&[0u8; 4]), None);
    }
}
