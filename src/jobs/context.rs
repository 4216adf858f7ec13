//! Shared handles and the block range handed to every job.

use std::fmt;
use std::sync::Arc;

use crate::executor::BatchWorkExecutor;
use crate::rpc::{Multicaller, RpcClient};

/// Inclusive block range of one sync batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
}

impl BlockRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        if self.end < self.start {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn numbers(&self) -> Vec<u64> {
        (self.start..=self.end).collect()
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Resources created once in `main` and shared by all jobs.
pub struct JobContext {
    pub rpc: Arc<RpcClient>,
    /// Endpoint for `debug_*` methods; the main endpoint unless configured.
    pub debug_rpc: Arc<RpcClient>,
    pub executor: BatchWorkExecutor,
    pub multicaller: Arc<Multicaller>,
    /// Method returning every receipt of a block, e.g. `eth_getBlockReceipts`.
    pub block_receipts_method: Option<String>,
}
