use async_trait::async_trait;

use super::context::{BlockRange, JobContext};
use super::error::JobError;
use super::traits::Job;
use crate::rpc::types::RpcBlock;
use crate::types::items::{Item, ItemBuffer, ItemType};

/// Fetches full blocks with their transactions.
pub struct ExportBlocksJob;

#[async_trait]
impl Job for ExportBlocksJob {
    fn name(&self) -> &'static str {
        "export_blocks"
    }

    fn output_types(&self) -> &'static [ItemType] {
        &[ItemType::Block]
    }

    async fn run(
        &self,
        ctx: &JobContext,
        range: BlockRange,
        buffer: &mut ItemBuffer,
    ) -> Result<(), JobError> {
        let rpc = &ctx.rpc;
        let blocks: Vec<RpcBlock> = ctx
            .executor
            .execute(range.numbers(), |chunk| async move {
                rpc.get_blocks_batch(&chunk).await
            })
            .await?;

        let mut tx_count = 0;
        for block in blocks {
            let block = block.into_block();
            tx_count += block.transactions.len();
            buffer.push(Item::Block(block));
        }

        tracing::debug!("Fetched {} blocks with {} transactions for {}", range.len(), tx_count, range);
        Ok(())
    }
}
