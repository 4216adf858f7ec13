//! The polling sync loop.

use std::time::{Duration, Instant};

use alloy::primitives::B256;
use tokio::sync::watch;

use super::exception::{ExceptionLevel, ExceptionRecord, ExceptionRecorder};
use super::range::next_range;
use super::reorg::ReorgController;
use super::sync_recorder::SyncRecorder;
use crate::error::{ErrorClass, HemeraError};
use crate::exporters::CompositeExporter;
use crate::jobs::{BlockRange, JobContext, JobScheduler};
use crate::types::config::stream::StreamSettings;
use crate::types::items::Block;

/// Result of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced(BlockRange),
    /// Nothing new to sync yet.
    Idle,
    /// A reorg was detected and the cursor moved back.
    Rewound(Option<u64>),
}

/// Counts consecutive failed batches.
#[derive(Debug, Default)]
pub struct RetryBudget {
    tries: u32,
    limit: u32,
}

impl RetryBudget {
    pub fn new(limit: u32) -> Self {
        Self { tries: 0, limit }
    }

    pub fn reset(&mut self) {
        self.tries = 0;
    }

    /// Record a failure; false once the batch was retried `limit` times.
    pub fn allow_retry(&mut self, class: ErrorClass) -> bool {
        if class == ErrorClass::Crash {
            return false;
        }
        self.tries += 1;
        self.tries <= self.limit
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }
}

/// True when the first block of a new batch does not build on the last
/// block exported by the previous one.
pub fn parent_mismatch(previous: Option<(u64, B256)>, first: Option<&Block>) -> bool {
    match (previous, first) {
        (Some((number, hash)), Some(block)) => block.number == number + 1 && block.parent_hash != hash,
        _ => false,
    }
}

/// Listens for ctrl-c and SIGTERM; the receiver flips to true on either.
pub fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutdown requested, stopping after the current batch");
        let _ = tx.send(true);
    });
    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

pub struct StreamController {
    ctx: JobContext,
    scheduler: JobScheduler,
    exporter: CompositeExporter,
    recorder: Box<dyn SyncRecorder>,
    reorg: ReorgController,
    exceptions: ExceptionRecorder,
    settings: StreamSettings,
    /// Number and hash of the last exported block.
    last_exported: Option<(u64, B256)>,
}

impl StreamController {
    pub fn new(
        ctx: JobContext,
        scheduler: JobScheduler,
        exporter: CompositeExporter,
        recorder: Box<dyn SyncRecorder>,
        reorg: ReorgController,
        exceptions: ExceptionRecorder,
        settings: StreamSettings,
    ) -> Self {
        Self {
            ctx,
            scheduler,
            exporter,
            recorder,
            reorg,
            exceptions,
            settings,
            last_exported: None,
        }
    }

    /// Sync from `start_block` (or the stored cursor) until `end_block` is
    /// reached or shutdown is requested.
    pub async fn run(
        &mut self,
        start_block: Option<u64>,
        end_block: Option<u64>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), HemeraError> {
        let mut cursor = match start_block {
            Some(start) => start.checked_sub(1),
            None => self.recorder.get_last_synced_block().await?,
        };
        tracing::info!(
            "Stream starting after block {:?} (end: {:?}, jobs: {})",
            cursor,
            end_block,
            self.scheduler.job_names().join(", ")
        );

        let mut budget = RetryBudget::new(self.settings.retry_errors);
        let period = Duration::from_secs(self.settings.period_seconds);

        loop {
            if *shutdown.borrow() {
                break;
            }
            if let (Some(end), Some(c)) = (end_block, cursor) {
                if c >= end {
                    tracing::info!("Reached end block {}", end);
                    break;
                }
            }

            match self.sync_once(cursor, end_block).await {
                Ok(SyncOutcome::Synced(range)) => {
                    cursor = Some(range.end);
                    budget.reset();
                }
                Ok(SyncOutcome::Rewound(rewound)) => {
                    cursor = rewound;
                    budget.reset();
                }
                Ok(SyncOutcome::Idle) => {
                    budget.reset();
                    if sleep_or_shutdown(period, &mut shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    let class = e.class();
                    let retry = budget.allow_retry(class);
                    self.exceptions
                        .record(ExceptionRecord {
                            job_name: failed_job(&e),
                            block_number: cursor.map(|c| c + 1),
                            stage: "stream".to_string(),
                            level: if retry { ExceptionLevel::Warning } else { ExceptionLevel::Error },
                            message: e.to_string(),
                        })
                        .await;

                    if !retry {
                        tracing::error!("Giving up after {} attempts ({:?}): {}", budget.tries(), class, e);
                        return Err(e);
                    }
                    tracing::warn!(
                        "Batch failed (attempt {}/{}), retrying in {:?}",
                        budget.tries(),
                        self.settings.retry_errors,
                        period
                    );
                    if sleep_or_shutdown(period, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        tracing::info!("Stream stopped at block {:?}", cursor);
        Ok(())
    }

    /// Sync the next range after `cursor`.
    pub async fn sync_once(&mut self, cursor: Option<u64>, end_block: Option<u64>) -> Result<SyncOutcome, HemeraError> {
        let current = self.ctx.rpc.get_block_number().await.map_err(classify_rpc)?;
        let Some(range) = next_range(
            cursor,
            current,
            self.settings.block_batch_size,
            self.settings.delay,
            end_block,
        ) else {
            tracing::debug!("Nothing to sync (cursor {:?}, head {})", cursor, current);
            return Ok(SyncOutcome::Idle);
        };

        let started = Instant::now();
        let mut buffer = self
            .scheduler
            .run_jobs(&self.ctx, range)
            .await
            .map_err(|(job, e)| HemeraError::job(job, e))?;

        if self.settings.auto_reorg && parent_mismatch(self.last_exported, buffer.first_block()) {
            let flagged = ReorgController::detected_range(range.start, self.settings.reorg_depth);
            tracing::warn!("Parent hash mismatch at block {}, re-syncing {}", range.start, flagged);
            let rewound = self.reorg.handle_reorg(flagged, self.recorder.as_ref()).await?;
            self.last_exported = None;
            return Ok(SyncOutcome::Rewound(rewound));
        }

        let last_block = buffer.last_block().map(|b| (b.number, b.hash));
        let items = self.scheduler.collect_exports(&mut buffer);
        self.exporter.export_items(&items).await?;
        self.recorder.set_last_synced_block(Some(range.end)).await?;
        self.scheduler.commit();
        self.last_exported = last_block.filter(|(n, _)| *n == range.end);

        tracing::info!(
            "Synced {} ({} items) in {:?}, head {}",
            range,
            items.len(),
            started.elapsed(),
            current
        );
        Ok(SyncOutcome::Synced(range))
    }
}

fn classify_rpc(e: crate::rpc::RpcError) -> HemeraError {
    if e.is_unreachable() {
        HemeraError::RpcNotReachable(e.to_string())
    } else {
        HemeraError::Rpc(e)
    }
}

fn failed_job(e: &HemeraError) -> String {
    match e {
        HemeraError::Job { job, .. } => job.clone(),
        _ => "stream".to_string(),
    }
}

/// True when shutdown was requested while sleeping.
async fn sleep_or_shutdown(period: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use alloy::dyn_abi::DynSolValue;
    use alloy::primitives::{Address, Bytes, U256};
    use async_trait::async_trait;

    use super::super::sync_recorder::FileSyncRecorder;
    use super::*;
    use crate::exporters::{ExportError, ItemExporter};
    use crate::jobs::token_transfers::TRANSFER_TOPIC;
    use crate::jobs::{build_registry, JobError};
    use crate::rpc::mock::{self, MockNode};
    use crate::rpc::multicall::{encode_call, function_selector};
    use crate::rpc::RpcError;
    use crate::types::entity::EntityTypes;
    use crate::types::items::{fixtures, Item, ItemType};

    #[test]
    fn test_retry_budget() {
        let mut budget = RetryBudget::new(2);
        assert!(budget.allow_retry(ErrorClass::Retriable));
        assert!(budget.allow_retry(ErrorClass::Unknown));
        assert!(!budget.allow_retry(ErrorClass::Retriable));

        budget.reset();
        assert!(budget.allow_retry(ErrorClass::Retriable));
        assert!(!budget.allow_retry(ErrorClass::Crash));
    }

    #[test]
    fn test_parent_mismatch() {
        let previous = fixtures::block(10, 0xaa, 0x99);
        let linked = fixtures::block(11, 0xbb, 0xaa);
        let forked = fixtures::block(11, 0xbb, 0xcc);

        let prev = Some((previous.number, previous.hash));
        assert!(!parent_mismatch(prev, Some(&linked)));
        assert!(parent_mismatch(prev, Some(&forked)));
        // not adjacent, e.g. after a restart with --start-block
        assert!(!parent_mismatch(prev, Some(&fixtures::block(20, 1, 2))));
        assert!(!parent_mismatch(None, Some(&forked)));
        assert!(!parent_mismatch(prev, None));
    }

    #[test]
    fn test_unreachable_rpc_crashes() {
        let e = classify_rpc(RpcError::Transport("error sending request: Connection refused".into()));
        assert!(matches!(e, HemeraError::RpcNotReachable(_)));
        assert_eq!(e.class(), ErrorClass::Crash);
        assert_eq!(classify_rpc(RpcError::RateLimitExceeded).class(), ErrorClass::Retriable);
    }

    #[test]
    fn test_failed_job_name() {
        let e = HemeraError::job("export_tokens", JobError::MissingData("x".into()));
        assert_eq!(failed_job(&e), "export_tokens");
        assert_eq!(failed_job(&HemeraError::Retriable("x".into())), "stream");
    }

    #[tokio::test]
    async fn test_sleep_returns_on_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        assert!(sleep_or_shutdown(Duration::from_secs(60), &mut rx).await);
    }

    /// Keeps every exported batch; the first `failures` exports fail.
    struct RecordingExporter {
        batches: Arc<Mutex<Vec<Vec<Item>>>>,
        failures: AtomicUsize,
    }

    impl RecordingExporter {
        fn new(failures: usize) -> (Self, Arc<Mutex<Vec<Vec<Item>>>>) {
            let batches = Arc::new(Mutex::new(Vec::new()));
            let exporter = Self {
                batches: batches.clone(),
                failures: AtomicUsize::new(failures),
            };
            (exporter, batches)
        }
    }

    #[async_trait]
    impl ItemExporter for RecordingExporter {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn export_items(&self, items: &[Item]) -> Result<(), ExportError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ExportError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")));
            }
            self.batches.lock().unwrap().push(items.to_vec());
            Ok(())
        }
    }

    fn settings(retry_errors: u32, period_seconds: u64) -> StreamSettings {
        StreamSettings {
            block_batch_size: 1,
            period_seconds,
            delay: 0,
            retry_errors,
            reorg_depth: 1,
            auto_reorg: true,
        }
    }

    fn controller(
        url: &str,
        required: &[ItemType],
        settings: StreamSettings,
        exporter: RecordingExporter,
        dir: &Path,
    ) -> StreamController {
        let scheduler = JobScheduler::new(&build_registry(), required.iter().copied().collect()).unwrap();
        let recorder = FileSyncRecorder::new(dir.join("sync_record.json"), "stream", EntityTypes::EXPLORER_BASE);
        StreamController::new(
            mock::job_context(url),
            scheduler,
            CompositeExporter::new(vec![Box::new(exporter)]),
            Box::new(recorder),
            ReorgController::new(None),
            ExceptionRecorder::new(None),
            settings,
        )
    }

    fn exported_blocks(batches: &Mutex<Vec<Vec<Item>>>) -> Vec<u64> {
        batches.lock().unwrap().iter().flatten().map(|i| i.block_number()).collect()
    }

    #[tokio::test]
    async fn test_run_stops_at_end_block() {
        let node = MockNode::start().await;
        node.add_chain(5);
        let dir = tempfile::tempdir().unwrap();
        let (exporter, batches) = RecordingExporter::new(0);
        let mut controller = controller(node.url(), &[ItemType::Block], settings(0, 0), exporter, dir.path());

        let (_tx, rx) = watch::channel(false);
        controller.run(Some(1), Some(3), rx).await.unwrap();

        assert_eq!(exported_blocks(&batches), vec![1, 2, 3]);
        assert_eq!(controller.recorder.get_last_synced_block().await.unwrap(), Some(3));
        assert_eq!(node.request_count("eth_getBlockByNumber"), 3);
    }

    #[tokio::test]
    async fn test_run_gives_up_after_retry_budget() {
        let node = MockNode::start().await;
        node.add_chain(3);
        node.fail_method("eth_getBlockByNumber", usize::MAX);
        let dir = tempfile::tempdir().unwrap();
        let (exporter, batches) = RecordingExporter::new(0);
        let mut controller = controller(node.url(), &[ItemType::Block], settings(2, 0), exporter, dir.path());

        let (_tx, rx) = watch::channel(false);
        let err = controller.run(Some(1), None, rx).await.unwrap_err();

        assert_eq!(err.class(), ErrorClass::Retriable);
        assert_eq!(failed_job(&err), "export_blocks");
        // the first attempt plus retry_errors retries
        assert_eq!(node.request_count("eth_getBlockByNumber"), 3);
        assert!(exported_blocks(&batches).is_empty());
        assert_eq!(controller.recorder.get_last_synced_block().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_run_crashes_at_once_on_unreachable_node() {
        let dir = tempfile::tempdir().unwrap();
        let (exporter, _) = RecordingExporter::new(0);
        // a retry would sleep through the timeout
        let mut controller =
            controller(&mock::closed_port_url(), &[ItemType::Block], settings(5, 60), exporter, dir.path());

        let (_tx, rx) = watch::channel(false);
        let err = tokio::time::timeout(Duration::from_secs(10), controller.run(Some(1), None, rx))
            .await
            .expect("retried an unreachable node")
            .unwrap_err();

        assert!(matches!(err, HemeraError::RpcNotReachable(_)), "unexpected error: {}", err);
        assert_eq!(err.class(), ErrorClass::Crash);
    }

    #[tokio::test]
    async fn test_parent_mismatch_rewinds_cursor() {
        let node = MockNode::start().await;
        node.add_chain(2);
        let dir = tempfile::tempdir().unwrap();
        let (exporter, batches) = RecordingExporter::new(0);
        let mut controller = controller(node.url(), &[ItemType::Block], settings(0, 0), exporter, dir.path());

        let synced = controller.sync_once(Some(0), None).await.unwrap();
        assert_eq!(synced, SyncOutcome::Synced(BlockRange::new(1, 1)));

        // block 2 moves to a fork that does not build on the exported block 1
        node.add_block(2, B256::repeat_byte(0x22), B256::repeat_byte(0xee), vec![]);
        let rewound = controller.sync_once(Some(1), None).await.unwrap();
        assert_eq!(rewound, SyncOutcome::Rewound(Some(0)));
        assert_eq!(controller.recorder.get_last_synced_block().await.unwrap(), Some(0));
        assert_eq!(exported_blocks(&batches), vec![1]);

        let resynced = controller.sync_once(Some(0), None).await.unwrap();
        assert_eq!(resynced, SyncOutcome::Synced(BlockRange::new(1, 1)));
    }

    #[tokio::test]
    async fn test_failed_export_emits_tokens_again_on_retry() {
        let node = MockNode::start().await;
        let token = Address::repeat_byte(0x70);
        let tx_hash = B256::repeat_byte(0x71);
        let block_hash = B256::repeat_byte(1);
        let transfer = mock::log_json(
            token,
            vec![
                TRANSFER_TOPIC,
                Address::repeat_byte(2).into_word(),
                Address::repeat_byte(3).into_word(),
            ],
            Bytes::from(U256::from(5).to_be_bytes::<32>().to_vec()),
            tx_hash,
            0,
        );
        node.add_block(
            1,
            block_hash,
            B256::ZERO,
            vec![mock::transaction_json(tx_hash, 0, Address::repeat_byte(2), token)],
        );
        node.add_receipt(1, mock::receipt_json(1, block_hash, tx_hash, 0, vec![transfer]));

        let string = |s: &str| Bytes::from(DynSolValue::String(s.to_string()).abi_encode());
        let uint = |v: u64| Bytes::from(DynSolValue::Uint(U256::from(v), 256).abi_encode());
        let selector = |sig: &str| encode_call(function_selector(sig), &[]);
        node.answer_call(selector("name()"), string("Token"));
        node.answer_call(selector("symbol()"), string("TKN"));
        node.answer_call(selector("decimals()"), uint(6));
        node.answer_call(selector("totalSupply()"), uint(1_000));

        let dir = tempfile::tempdir().unwrap();
        let (exporter, batches) = RecordingExporter::new(1);
        let mut controller = controller(node.url(), &[ItemType::Token], settings(3, 0), exporter, dir.path());

        let (_tx, rx) = watch::channel(false);
        controller.run(Some(1), Some(1), rx).await.unwrap();

        let exported = batches.lock().unwrap().clone();
        assert_eq!(exported.len(), 1);
        match exported[0].as_slice() {
            [Item::Token(t)] => {
                assert_eq!(t.address, token);
                assert_eq!(t.symbol.as_deref(), Some("TKN"));
                assert_eq!(t.decimals, Some(6));
            }
            other => panic!("expected one token, got {:?}", other),
        }
        assert_eq!(node.request_count("eth_call"), 8);

        // once exported the token is cached and not fetched again
        let (_tx, rx) = watch::channel(false);
        controller.run(Some(1), Some(1), rx).await.unwrap();
        assert_eq!(batches.lock().unwrap().len(), 1);
        assert_eq!(node.request_count("eth_call"), 8);
    }
}
