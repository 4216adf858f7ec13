#[cfg(test)]
pub(crate) mod mock;
pub mod multicall;
mod rpc;
pub mod types;

pub use multicall::{Call, Multicaller};
pub use rpc::{hex_quantity, with_retry, RetryConfig, RpcClient, RpcClientConfig, RpcError};
