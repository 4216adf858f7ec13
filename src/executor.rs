//! Bounded fan-out of independent RPC batch work.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};

use crate::rpc::{RetryConfig, RpcError};
use crate::types::config::rpc::RpcSettings;

/// Splits work items into `batch_size` chunks and runs at most
/// `max_workers` of them at once.
///
/// A chunk that fails with a retryable error is split in half and each half
/// is retried; a single-item chunk is retried up to `max_retries` times.
/// Results come back in input order.
#[derive(Debug, Clone)]
pub struct BatchWorkExecutor {
    batch_size: usize,
    max_workers: usize,
    retry: RetryConfig,
}

impl BatchWorkExecutor {
    pub fn new(batch_size: usize, max_workers: usize, max_retries: u32) -> Self {
        Self {
            batch_size: batch_size.max(1),
            max_workers: max_workers.max(1),
            retry: RetryConfig::new(max_retries),
        }
    }

    pub fn from_settings(settings: &RpcSettings) -> Self {
        let mut executor = Self::new(settings.batch_size, settings.max_workers, settings.max_retries);
        executor.retry = executor
            .retry
            .with_initial_delay(Duration::from_millis(settings.initial_retry_delay_ms));
        executor
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry = self.retry.with_initial_delay(delay);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub async fn execute<T, R, F, Fut>(&self, items: Vec<T>, work: F) -> Result<Vec<R>, RpcError>
    where
        T: Clone,
        F: Fn(Vec<T>) -> Fut,
        Fut: Future<Output = Result<Vec<R>, RpcError>>,
    {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let chunks: Vec<Vec<T>> = items.chunks(self.batch_size).map(|c| c.to_vec()).collect();
        let work = &work;

        let results: Vec<Vec<R>> = stream::iter(chunks)
            .map(|chunk| self.run_chunk(chunk, work))
            .buffered(self.max_workers)
            .try_collect()
            .await?;

        Ok(results.into_iter().flatten().collect())
    }

    async fn run_chunk<T, R, F, Fut>(&self, chunk: Vec<T>, work: &F) -> Result<Vec<R>, RpcError>
    where
        T: Clone,
        F: Fn(Vec<T>) -> Fut,
        Fut: Future<Output = Result<Vec<R>, RpcError>>,
    {
        let mut pending: VecDeque<Vec<T>> = VecDeque::from([chunk]);
        let mut results = Vec::new();
        let mut attempt = 0;

        while let Some(mut part) = pending.pop_front() {
            match work(part.clone()).await {
                Ok(out) => {
                    results.extend(out);
                    attempt = 0;
                }
                Err(e) if e.is_retryable() && part.len() > 1 => {
                    let right = part.split_off(part.len() / 2);
                    tracing::warn!(
                        "Batch of {} items failed, retrying as {} + {}: {}",
                        part.len() + right.len(),
                        part.len(),
                        right.len(),
                        e
                    );
                    pending.push_front(right);
                    pending.push_front(part);
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        "Single-item batch failed (attempt {}/{}), retrying in {:?}: {}",
                        attempt,
                        self.retry.max_retries,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    pending.push_front(part);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(results)
    }
}
