use alloy::primitives::Address;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RpcSettings {
    /// Requests per JSON-RPC batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Concurrent batches in flight.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub requests_per_second: Option<u32>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MulticallSettings {
    /// Multicall3 deployment; calls go out one by one without it.
    #[serde(default)]
    pub address: Option<Address>,
    /// First block at which the Multicall3 contract exists.
    #[serde(default)]
    pub deployed_at: u64,
    /// Upper bound on sub-calls folded into one aggregate3 call.
    #[serde(default = "default_max_calls_per_multicall")]
    pub max_calls_per_multicall: usize,
    /// Byte budget of one serialized JSON-RPC batch.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

fn default_batch_size() -> usize {
    10
}

/// CPU count plus a constant, as the fan-out is I/O bound.
pub fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        + 4
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_retry_delay_ms() -> u64 {
    500
}

fn default_max_calls_per_multicall() -> usize {
    500
}

fn default_max_payload_bytes() -> usize {
    250 * 1024
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_workers: default_max_workers(),
            requests_per_second: None,
            max_retries: default_max_retries(),
            initial_retry_delay_ms: default_initial_retry_delay_ms(),
        }
    }
}

impl Default for MulticallSettings {
    fn default() -> Self {
        Self {
            address: None,
            deployed_at: 0,
            max_calls_per_multicall: default_max_calls_per_multicall(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}
