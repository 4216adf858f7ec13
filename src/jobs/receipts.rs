use std::collections::HashMap;

use alloy::primitives::B256;
use async_trait::async_trait;

use super::context::{BlockRange, JobContext};
use super::error::JobError;
use super::traits::Job;
use crate::rpc::types::RpcReceipt;
use crate::types::items::{Item, ItemBuffer, ItemType, Transaction};

/// Merges receipts into the buffered blocks' transactions and extracts their
/// logs.
pub struct ExportTransactionsAndLogsJob;

#[async_trait]
impl Job for ExportTransactionsAndLogsJob {
    fn name(&self) -> &'static str {
        "export_transactions_and_logs"
    }

    fn dependency_types(&self) -> &'static [ItemType] {
        &[ItemType::Block]
    }

    fn output_types(&self) -> &'static [ItemType] {
        &[ItemType::Transaction, ItemType::Log]
    }

    async fn run(
        &self,
        ctx: &JobContext,
        range: BlockRange,
        buffer: &mut ItemBuffer,
    ) -> Result<(), JobError> {
        let mut blocks: Vec<(u64, u64, Vec<Transaction>)> = buffer
            .blocks()
            .filter(|b| b.number >= range.start && b.number <= range.end)
            .map(|b| (b.number, b.timestamp, b.transactions.clone()))
            .collect();
        blocks.sort_by_key(|(number, _, _)| *number);

        let receipts = fetch_receipts(ctx, &blocks).await?;
        let (transactions, logs) = merge_receipts(blocks, receipts)?;

        tracing::debug!(
            "Extracted {} transactions and {} logs for {}",
            transactions.len(),
            logs.len(),
            range
        );
        buffer.extend(transactions);
        buffer.extend(logs);
        Ok(())
    }
}

async fn fetch_receipts(
    ctx: &JobContext,
    blocks: &[(u64, u64, Vec<Transaction>)],
) -> Result<HashMap<B256, RpcReceipt>, JobError> {
    let rpc = &ctx.rpc;

    let receipts: Vec<RpcReceipt> = match ctx.block_receipts_method.as_deref() {
        Some(method) => {
            let numbers: Vec<u64> = blocks
                .iter()
                .filter(|(_, _, txs)| !txs.is_empty())
                .map(|(n, _, _)| *n)
                .collect();
            let per_block: Vec<Vec<RpcReceipt>> = ctx
                .executor
                .execute(numbers, |chunk| async move {
                    rpc.get_block_receipts_batch(method, &chunk).await
                })
                .await?;
            per_block.into_iter().flatten().collect()
        }
        None => {
            let hashes: Vec<B256> = blocks
                .iter()
                .flat_map(|(_, _, txs)| txs.iter().map(|tx| tx.hash))
                .collect();
            ctx.executor
                .execute(hashes, |chunk| async move { rpc.get_receipts_batch(&chunk).await })
                .await?
        }
    };

    Ok(receipts
        .into_iter()
        .map(|r| (r.transaction_hash, r))
        .collect())
}

/// Attach receipts to transactions and collect logs, ordered by block,
/// transaction index and log index.
fn merge_receipts(
    blocks: Vec<(u64, u64, Vec<Transaction>)>,
    receipts: HashMap<B256, RpcReceipt>,
) -> Result<(Vec<Item>, Vec<Item>), JobError> {
    let mut transactions = Vec::new();
    let mut logs = Vec::new();

    for (number, timestamp, mut txs) in blocks {
        txs.sort_by_key(|tx| tx.transaction_index);
        for mut tx in txs {
            let receipt = receipts.get(&tx.hash).ok_or_else(|| {
                JobError::MissingData(format!("receipt of {} in block {}", tx.hash, number))
            })?;
            receipt.apply_to(&mut tx);

            let mut tx_logs = receipt.log_items(timestamp);
            tx_logs.sort_by_key(|l| l.log_index);
            logs.extend(tx_logs.into_iter().map(Item::Log));
            transactions.push(Item::Transaction(tx));
        }
    }

    Ok((transactions, logs))
}
