use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use alloy::network::Ethereum;
use alloy::primitives::{Address, Bytes, B256, U64};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::client::BatchRequest;
use alloy::rpc::json_rpc::{RpcRecv, RpcSend};
use governor::clock::{QuantaClock, QuantaInstant};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Jitter, Quota, RateLimiter};
use serde_json::json;
use thiserror::Error;
use url::Url;

use super::types::{RpcBlock, RpcReceipt, TxTraceResult};
use crate::types::config::rpc::RpcSettings;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("RPC transport error: {0}")]
    Transport(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Batch request failed: {0}")]
    BatchError(String),

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Block {0} not available from provider yet")]
    MissingBlock(u64),

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl RpcError {
    /// Transient failures: transport errors, rate limits, a node lagging
    /// behind its reported head. An unreachable endpoint is never retried.
    pub fn is_retryable(&self) -> bool {
        if self.is_unreachable() {
            return false;
        }
        match self {
            RpcError::Transport(_) => true,
            RpcError::RateLimitExceeded => true,
            RpcError::InvalidUrl(_) => false,
            // The node may lag behind the height it reported
            RpcError::MissingBlock(_) => true,
            RpcError::Decode(_) => false,
            RpcError::BatchError(msg) => Self::is_retryable_message(msg),
            RpcError::ProviderError(msg) => Self::is_retryable_message(msg),
        }
    }

    /// The endpoint cannot be reached at all, as opposed to a failing request.
    pub fn is_unreachable(&self) -> bool {
        match self {
            RpcError::InvalidUrl(_) => true,
            RpcError::Transport(msg) | RpcError::ProviderError(msg) | RpcError::BatchError(msg) => {
                let lower = msg.to_lowercase();
                UNREACHABLE_MARKERS.iter().any(|marker| lower.contains(marker))
            }
            _ => false,
        }
    }

    fn is_retryable_message(msg: &str) -> bool {
        let lower = msg.to_lowercase();
        TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
    }
}

/// Connect-level failures, matched against the full cause chain.
const UNREACHABLE_MARKERS: &[&str] = &[
    "connection refused",
    "tcp connect error",
    "dns error",
    "failed to lookup address",
];

/// Display of `e` followed by each distinct cause in its source chain.
/// HTTP clients keep the connect failure in the chain, not the top message.
pub(crate) fn error_chain(e: &(dyn std::error::Error + 'static)) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

/// Substrings of provider and transport errors that clear up on retry.
/// Payload limits are included since the executor answers them by
/// splitting the batch.
const TRANSIENT_MARKERS: &[&str] = &[
    "connection",
    "timeout",
    "timed out",
    "reset",
    "broken pipe",
    "network",
    "eof",
    "sending request",
    "rate limit",
    "too many requests",
    "429",
    "502",
    "503",
    "504",
    "internal server error",
    "service unavailable",
    "bad gateway",
    "too large",
    "batch limit",
    "header not found",
    "temporarily",
    "try again",
    "retry",
];

/// Exponential backoff for retryable RPC failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt; 0 disables retrying.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Backoff before retry `attempt`; the first attempt runs immediately.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match attempt {
            0 => Duration::ZERO,
            n => {
                let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(n as i32 - 1);
                Duration::try_from_secs_f64(secs).map_or(self.max_delay, |d| d.min(self.max_delay))
            }
        }
    }
}

/// Run `operation`, retrying retryable errors with backoff.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RpcError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    let mut attempt = 0;
    loop {
        if attempt > 0 {
            let delay = config.delay_for_attempt(attempt);
            tracing::warn!(
                "RPC retry {}/{} for '{}' in {:?}",
                attempt,
                config.max_retries,
                operation_name,
                delay
            );
            tokio::time::sleep(delay).await;
        }

        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!("RPC '{}' succeeded after {} retries", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                tracing::warn!(
                    "RPC '{}' failed (attempt {}/{}): {}",
                    operation_name,
                    attempt + 1,
                    config.max_retries + 1,
                    e
                );
                attempt += 1;
            }
            Err(e) => {
                if attempt > 0 {
                    tracing::error!(
                        "RPC '{}' failed after {} attempts: {}",
                        operation_name,
                        attempt + 1,
                        e
                    );
                }
                return Err(e);
            }
        }
    }
}

pub type StandardRateLimiter =
    RateLimiter<NotKeyed, InMemoryState, QuantaClock, NoOpMiddleware<QuantaInstant>>;

#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub url: Url,
    pub max_batch_size: usize,
    pub rate_limit: Option<RateLimitConfig>,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_second: NonZeroU32,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
}

impl RateLimitConfig {
    pub fn per_second(requests_per_second: NonZeroU32) -> Self {
        Self {
            requests_per_second,
            jitter_min_ms: 5,
            jitter_max_ms: 50,
        }
    }
}

impl RpcClientConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            max_batch_size: 10,
            rate_limit: None,
            retry: RetryConfig::default(),
        }
    }

    /// Build the client config from the `rpc` section of the indexer config.
    pub fn from_settings(url: &str, settings: &RpcSettings) -> Result<Self, RpcError> {
        let url = Url::parse(url).map_err(|e| RpcError::InvalidUrl(e.to_string()))?;
        let mut config = Self::new(url)
            .with_batch_size(settings.batch_size)
            .with_retry(
                RetryConfig::new(settings.max_retries)
                    .with_initial_delay(Duration::from_millis(settings.initial_retry_delay_ms)),
            );
        if let Some(rps) = settings.requests_per_second.and_then(NonZeroU32::new) {
            config = config.with_rate_limit(RateLimitConfig::per_second(rps));
        }
        Ok(config)
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }
}

/// `0x`-prefixed hex quantity as JSON-RPC expects block numbers.
pub fn hex_quantity(n: u64) -> String {
    format!("0x{:x}", n)
}

/// JSON-RPC client speaking raw methods and batches.
///
/// Single requests retry internally through [`with_retry`]. Batch helpers do
/// not retry: callers run them through the batch work executor, which splits
/// failing batches and retries single items.
pub struct RpcClient {
    provider: RootProvider<Ethereum>,
    config: RpcClientConfig,
    rate_limiter: Option<Arc<StandardRateLimiter>>,
    jitter: Option<Jitter>,
}

impl RpcClient {
    pub fn new(config: RpcClientConfig) -> Result<Self, RpcError> {
        let provider = RootProvider::<Ethereum>::new_http(config.url.clone());

        let (rate_limiter, jitter) = if let Some(ref rate_config) = config.rate_limit {
            let quota = Quota::per_second(rate_config.requests_per_second);
            let limiter = RateLimiter::direct(quota);
            let jitter = Jitter::new(
                Duration::from_millis(rate_config.jitter_min_ms),
                Duration::from_millis(rate_config.jitter_max_ms),
            );
            (Some(Arc::new(limiter)), Some(jitter))
        } else {
            (None, None)
        };

        Ok(Self {
            provider,
            config,
            rate_limiter,
            jitter,
        })
    }

    pub fn from_url(url: &str) -> Result<Self, RpcError> {
        let url = Url::parse(url).map_err(|e| RpcError::InvalidUrl(e.to_string()))?;
        Self::new(RpcClientConfig::new(url))
    }

    pub fn config(&self) -> &RpcClientConfig {
        &self.config
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.config.retry
    }

    async fn wait_for_rate_limit(&self) {
        if let (Some(limiter), Some(jitter)) = (&self.rate_limiter, &self.jitter) {
            limiter.until_ready_with_jitter(*jitter).await;
        }
    }

    /// One JSON-RPC request with retries.
    pub async fn request<P, R>(&self, method: &str, params: P) -> Result<R, RpcError>
    where
        P: RpcSend + Clone,
        R: RpcRecv,
    {
        with_retry(&self.config.retry, method, || {
            let params = params.clone();
            async move {
                self.wait_for_rate_limit().await;
                self.provider
                    .client()
                    .request(method.to_string(), params)
                    .await
                    .map_err(|e| RpcError::ProviderError(error_chain(&e)))
            }
        })
        .await
    }

    /// Send `calls` of one method as JSON-RPC batches of at most
    /// `max_batch_size` requests. Any failing call fails the whole chunk.
    pub async fn batch_request<P, R>(&self, method: &str, calls: &[P]) -> Result<Vec<R>, RpcError>
    where
        P: RpcSend,
        R: RpcRecv,
    {
        let results = self.batch_request_each::<P, R>(method, calls).await?;
        results.into_iter().collect()
    }

    /// Like [`batch_request`](Self::batch_request) but keeps per-call errors,
    /// failing only on transport-level errors.
    pub async fn batch_request_each<P, R>(
        &self,
        method: &str,
        calls: &[P],
    ) -> Result<Vec<Result<R, RpcError>>, RpcError>
    where
        P: RpcSend,
        R: RpcRecv,
    {
        let mut all_results = Vec::with_capacity(calls.len());

        for chunk in calls.chunks(self.config.max_batch_size) {
            self.wait_for_rate_limit().await;

            let mut batch = BatchRequest::new(self.provider.client());
            let mut waiters = Vec::with_capacity(chunk.len());
            for params in chunk {
                let waiter = batch
                    .add_call::<_, R>(method.to_string(), params)
                    .map_err(|e| RpcError::BatchError(error_chain(&e)))?;
                waiters.push(waiter);
            }

            batch
                .send()
                .await
                .map_err(|e| RpcError::Transport(error_chain(&e)))?;

            for waiter in waiters {
                all_results.push(waiter.await.map_err(|e| RpcError::ProviderError(error_chain(&e))));
            }
        }

        Ok(all_results)
    }

    pub async fn get_block_number(&self) -> Result<u64, RpcError> {
        let number: U64 = self.request("eth_blockNumber", ()).await?;
        Ok(number.to::<u64>())
    }

    pub async fn chain_id(&self) -> Result<u64, RpcError> {
        let id: U64 = self.request("eth_chainId", ()).await?;
        Ok(id.to::<u64>())
    }

    pub async fn get_block(&self, number: u64, full_transactions: bool) -> Result<RpcBlock, RpcError> {
        let block: Option<RpcBlock> = self
            .request("eth_getBlockByNumber", (hex_quantity(number), full_transactions))
            .await?;
        block.ok_or(RpcError::MissingBlock(number))
    }

    /// Full blocks with transactions, in the order of `numbers`.
    pub async fn get_blocks_batch(&self, numbers: &[u64]) -> Result<Vec<RpcBlock>, RpcError> {
        let params: Vec<(String, bool)> = numbers.iter().map(|n| (hex_quantity(*n), true)).collect();
        let blocks: Vec<Option<RpcBlock>> = self.batch_request("eth_getBlockByNumber", &params).await?;

        blocks
            .into_iter()
            .zip(numbers)
            .map(|(block, n)| block.ok_or(RpcError::MissingBlock(*n)))
            .collect()
    }

    pub async fn get_receipts_batch(&self, hashes: &[B256]) -> Result<Vec<RpcReceipt>, RpcError> {
        let params: Vec<(B256,)> = hashes.iter().map(|h| (*h,)).collect();
        let receipts: Vec<Option<RpcReceipt>> =
            self.batch_request("eth_getTransactionReceipt", &params).await?;

        receipts
            .into_iter()
            .zip(hashes)
            .map(|(receipt, hash)| {
                receipt.ok_or_else(|| RpcError::ProviderError(format!("receipt for {} not available, try again", hash)))
            })
            .collect()
    }

    /// All receipts of each block through a node-specific method such as
    /// `eth_getBlockReceipts`.
    pub async fn get_block_receipts_batch(
        &self,
        method: &str,
        numbers: &[u64],
    ) -> Result<Vec<Vec<RpcReceipt>>, RpcError> {
        let params: Vec<(String,)> = numbers.iter().map(|n| (hex_quantity(*n),)).collect();
        let receipts: Vec<Option<Vec<RpcReceipt>>> = self.batch_request(method, &params).await?;

        receipts
            .into_iter()
            .zip(numbers)
            .map(|(r, n)| r.ok_or(RpcError::MissingBlock(*n)))
            .collect()
    }

    /// `callTracer` traces of every transaction of each block.
    pub async fn trace_blocks_batch(&self, numbers: &[u64]) -> Result<Vec<Vec<TxTraceResult>>, RpcError> {
        let params: Vec<(String, serde_json::Value)> = numbers
            .iter()
            .map(|n| (hex_quantity(*n), json!({ "tracer": "callTracer" })))
            .collect();
        self.batch_request("debug_traceBlockByNumber", &params).await
    }

    /// `eth_call` per `(to, data, block)`, keeping per-call failures such as
    /// reverts as errors in the returned vector.
    pub async fn call_batch(
        &self,
        calls: &[(Address, Bytes, u64)],
    ) -> Result<Vec<Result<Bytes, RpcError>>, RpcError> {
        let params: Vec<(serde_json::Value, String)> = calls
            .iter()
            .map(|(to, data, block)| (json!({ "to": to, "data": data }), hex_quantity(*block)))
            .collect();
        self.batch_request_each("eth_call", &params).await
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("config", &self.config)
            .field("has_rate_limiter", &self.rate_limiter.is_some())
            .finish()
    }
}
