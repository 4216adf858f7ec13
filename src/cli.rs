//! Command line interface

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};

use crate::types::config::indexer::IndexerConfig;

#[derive(Parser, Debug)]
#[command(name = "hemera", version, about = "EVM blockchain indexer")]
pub struct Opts {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Follow the chain and export every new block range
    Stream(StreamArgs),
    /// Re-export JSON-lines files through the configured outputs
    Load(LoadArgs),
    /// Serve the explorer API
    Api(ApiArgs),
    /// Run daily aggregation templates
    Aggregates(AggregatesArgs),
    /// Flag a block range as reorganized and rewind the sync cursor
    Reorg(ReorgArgs),
    /// Apply database migrations
    InitDb(CommonArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// JSON config file; defaults to config/config.json when present
    #[arg(long, env = "CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    #[arg(long, env = "POSTGRES_URL")]
    pub postgres_url: Option<String>,

    #[arg(long, env = "MIGRATIONS_DIR", default_value = "migrations")]
    pub migrations_dir: PathBuf,

    #[arg(long, env = "DB_POOL_SIZE", default_value_t = 16)]
    pub db_pool_size: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ProviderArgs {
    #[arg(long, env = "PROVIDER_URI")]
    pub provider_uri: String,

    /// Endpoint for debug_* calls; the provider URI when unset
    #[arg(long, env = "DEBUG_PROVIDER_URI")]
    pub debug_provider_uri: Option<String>,

    /// Requests per JSON-RPC batch
    #[arg(long, env = "BATCH_SIZE")]
    pub batch_size: Option<usize>,

    #[arg(long, env = "MAX_WORKERS")]
    pub max_workers: Option<usize>,

    #[arg(long, env = "REQUESTS_PER_SECOND")]
    pub requests_per_second: Option<u32>,

    /// e.g. eth_getBlockReceipts
    #[arg(long, env = "BLOCK_RECEIPTS_METHOD")]
    pub block_receipts_method: Option<String>,

    #[arg(long, env = "MULTICALL_ADDRESS")]
    pub multicall_address: Option<alloy::primitives::Address>,
}

#[derive(Args, Debug, Clone)]
pub struct JobArgs {
    /// Comma-separated entity types, e.g. EXPLORER_BASE,EXPLORER_TOKEN
    #[arg(long, env = "ENTITY_TYPES", default_value = "EXPLORER_BASE")]
    pub entity_types: String,

    /// Comma-separated item types; overrides the entity type outputs
    #[arg(long, env = "OUTPUT_TYPES")]
    pub output_types: Option<String>,

    /// Comma-separated outputs: console, postgres[ql]://..., jsonfile://dir, csvfile://dir
    #[arg(long, env = "OUTPUT", default_value = "console")]
    pub output: String,
}

#[derive(Args, Debug, Clone)]
pub struct StreamArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub provider: ProviderArgs,

    #[command(flatten)]
    pub jobs: JobArgs,

    #[arg(long, env = "START_BLOCK")]
    pub start_block: Option<u64>,

    #[arg(long, env = "END_BLOCK")]
    pub end_block: Option<u64>,

    #[arg(long, env = "BLOCK_BATCH_SIZE")]
    pub block_batch_size: Option<u64>,

    #[arg(long, env = "PERIOD_SECONDS")]
    pub period_seconds: Option<u64>,

    /// Blocks to stay behind the chain head
    #[arg(long, env = "DELAY")]
    pub delay: Option<u64>,

    #[arg(long, env = "RETRY_ERRORS")]
    pub retry_errors: Option<u32>,

    /// file:<path> or pg:<mission>
    #[arg(long, env = "SYNC_RECORDER")]
    pub sync_recorder: Option<String>,

    #[arg(long, env = "AUTO_REORG")]
    pub auto_reorg: Option<bool>,

    #[arg(long, env = "REORG_DEPTH")]
    pub reorg_depth: Option<u64>,
}

impl StreamArgs {
    pub fn validate(&self) -> Result<(), String> {
        if let (Some(start), Some(end)) = (self.start_block, self.end_block) {
            if start > end {
                return Err(format!("start block {} is after end block {}", start, end));
            }
        }
        Ok(())
    }

    /// Overlay flags on top of file values.
    pub fn apply_to(&self, config: &mut IndexerConfig) {
        self.provider.apply_to(config);
        let stream = &mut config.stream;
        if let Some(v) = self.block_batch_size {
            stream.block_batch_size = v;
        }
        if let Some(v) = self.period_seconds {
            stream.period_seconds = v;
        }
        if let Some(v) = self.delay {
            stream.delay = v;
        }
        if let Some(v) = self.retry_errors {
            stream.retry_errors = v;
        }
        if let Some(v) = self.auto_reorg {
            stream.auto_reorg = v;
        }
        if let Some(v) = self.reorg_depth {
            stream.reorg_depth = v;
        }
    }
}

impl ProviderArgs {
    pub fn apply_to(&self, config: &mut IndexerConfig) {
        if let Some(v) = self.batch_size {
            config.rpc.batch_size = v;
        }
        if let Some(v) = self.max_workers {
            config.rpc.max_workers = v;
        }
        if self.requests_per_second.is_some() {
            config.rpc.requests_per_second = self.requests_per_second;
        }
        if self.block_receipts_method.is_some() {
            config.block_receipts_method = self.block_receipts_method.clone();
        }
        if self.multicall_address.is_some() {
            config.multicall.address = self.multicall_address;
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoadArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub jobs: JobArgs,

    /// jsonfile://<dir> written by a previous run
    #[arg(long, env = "SOURCE")]
    pub source: String,
}

impl LoadArgs {
    pub fn source_dir(&self) -> Result<PathBuf, String> {
        match self.source.strip_prefix("jsonfile://") {
            Some(dir) if !dir.is_empty() => Ok(PathBuf::from(dir)),
            _ => Err(format!("unsupported load source '{}', expected jsonfile://<dir>", self.source)),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ApiArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[arg(long, env = "API_BIND_ADDRESS")]
    pub bind_address: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct AggregatesArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// First day, inclusive (YYYY-MM-DD)
    #[arg(long)]
    pub start_date: NaiveDate,

    /// Last day, exclusive (YYYY-MM-DD)
    #[arg(long)]
    pub end_date: NaiveDate,

    #[arg(long, env = "AGGREGATES_DIR", default_value = "aggregates")]
    pub template_dir: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct ReorgArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub provider: ProviderArgs,

    #[command(flatten)]
    pub jobs: JobArgs,

    /// Highest block of the reorganized range
    #[arg(long)]
    pub block_number: u64,

    /// Number of blocks ending at block_number
    #[arg(long, default_value_t = 10)]
    pub ranges: u64,

    /// Re-index the range right away
    #[arg(long)]
    pub resync: bool,

    #[arg(long, env = "SYNC_RECORDER")]
    pub sync_recorder: Option<String>,
}
