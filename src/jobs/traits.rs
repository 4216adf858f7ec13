//! Core trait for extraction jobs.

use async_trait::async_trait;

use super::context::{BlockRange, JobContext};
use super::error::JobError;
use crate::types::items::{ItemBuffer, ItemType};

/// A unit of extraction work run once per sync batch.
///
/// A job reads its `dependency_types` from the batch buffer and appends items
/// of its `output_types`. Jobs hold no state across batches apart from
/// caches of immutable chain data, which only take effect through `commit`.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Unique name for this job (used in logging and exception records).
    fn name(&self) -> &'static str;

    /// Item types this job reads from the buffer.
    fn dependency_types(&self) -> &'static [ItemType] {
        &[]
    }

    /// Item types this job appends to the buffer.
    fn output_types(&self) -> &'static [ItemType];

    /// Extract items for the inclusive block range.
    async fn run(
        &self,
        ctx: &JobContext,
        range: BlockRange,
        buffer: &mut ItemBuffer,
    ) -> Result<(), JobError>;

    /// Called once the items of the last `run` are persisted. A batch that
    /// is discarded never commits.
    fn commit(&self) {}
}
