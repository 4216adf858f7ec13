use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct StreamSettings {
    /// Maximum blocks per sync batch.
    #[serde(default = "default_block_batch_size")]
    pub block_batch_size: u64,
    /// Sleep between polls when there is nothing to sync.
    #[serde(default = "default_period_seconds")]
    pub period_seconds: u64,
    /// Blocks to stay behind the chain tip.
    #[serde(default)]
    pub delay: u64,
    /// Consecutive failed batches tolerated before giving up.
    #[serde(default = "default_retry_errors")]
    pub retry_errors: u32,
    /// Blocks flagged and re-synced when a reorg is detected automatically.
    #[serde(default = "default_reorg_depth")]
    pub reorg_depth: u64,
    #[serde(default = "default_auto_reorg")]
    pub auto_reorg: bool,
}

fn default_block_batch_size() -> u64 {
    1
}

fn default_period_seconds() -> u64 {
    10
}

fn default_retry_errors() -> u32 {
    5
}

fn default_reorg_depth() -> u64 {
    12
}

fn default_auto_reorg() -> bool {
    true
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            block_batch_size: default_block_batch_size(),
            period_seconds: default_period_seconds(),
            delay: 0,
            retry_errors: default_retry_errors(),
            reorg_depth: default_reorg_depth(),
            auto_reorg: default_auto_reorg(),
        }
    }
}
