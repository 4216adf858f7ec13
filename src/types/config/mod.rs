pub mod indexer;
pub mod output;
pub mod rpc;
pub mod stream;
