//! Extraction jobs and the scheduler that runs them per sync batch.

mod blocks;
mod context;
mod error;
mod receipts;
mod registry;
mod token_balances;
pub mod token_transfers;
mod tokens;
mod traces;
mod traits;

pub use blocks::ExportBlocksJob;
pub use context::{BlockRange, JobContext};
pub use error::JobError;
pub use receipts::ExportTransactionsAndLogsJob;
pub use registry::{build_registry, JobRegistry, JobScheduler};
pub use token_balances::ExportTokenBalancesJob;
pub use token_transfers::ExtractTokenTransfersJob;
pub use tokens::ExportTokensJob;
pub use traces::ExportTracesJob;
pub use traits::Job;
