//! Per-contract uploader
//!
//! Each uploader owns the outbound queue for one contract and runs a
//! worker loop that performs one sector upload at a time under the
//! contract's revision lock, recording throughput and failures for the
//! manager's placement decisions.

use crate::config::UploadConfig;
use crate::error::HostClientError;
use crate::host::{HostProvider, LockPriority, RevisionFn, RevisionLocker, RevisionRequest};
use crate::stats::{DataPoints, STATS_WINDOW};
use crate::upload::ShardUpload;
use nimbus_core::{Contract, Hash256, SECTOR_SIZE};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Default)]
struct UploaderState {
    queue: VecDeque<ShardUpload>,
    block_height: u64,
    consecutive_failures: u64,
}

/// Worker bound to exactly one contract. Sector RPCs on the contract
/// are strictly serial: the worker loop performs one at a time, and the
/// revision lock guards the contract's monotonic revision counter.
pub(crate) struct Uploader {
    contract: Contract,
    state: Mutex<UploaderState>,
    stats_speed: DataPoints,
    new_work: Notify,
    stop: CancellationToken,
}

impl Uploader {
    pub fn new(contract: Contract) -> Arc<Self> {
        Arc::new(Self {
            contract,
            state: Mutex::new(UploaderState::default()),
            stats_speed: DataPoints::new(STATS_WINDOW),
            new_work: Notify::new(),
            stop: CancellationToken::new(),
        })
    }

    pub fn contract(&self) -> &Contract {
        &self.contract
    }

    /// Signal the worker loop to exit. The in-flight sector upload, if
    /// any, is allowed to complete.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Append a shard to the queue and wake the worker
    pub fn schedule(&self, req: ShardUpload) {
        self.state.lock().queue.push_back(req);
        self.new_work.notify_one();
    }

    fn pop(&self) -> Option<ShardUpload> {
        self.state.lock().queue.pop_front()
    }

    /// Estimated time to complete one more sector, assuming the p90
    /// throughput holds. Uploaders without a track record estimate
    /// infinity so they are only tried once nothing better is free.
    pub fn estimate(&self) -> f64 {
        let bytes_per_ms = self.stats_speed.p90();
        if bytes_per_ms == 0.0 {
            return f64::INFINITY;
        }
        let outstanding = ((self.state.lock().queue.len() + 1) * SECTOR_SIZE) as f64;
        outstanding / bytes_per_ms
    }

    /// Refresh the cached p90 the estimate is based on
    pub fn recompute_stats(&self) {
        self.stats_speed.recompute();
    }

    /// The cached p90 throughput in bytes per millisecond
    pub fn p90_bytes_per_ms(&self) -> f64 {
        self.stats_speed.p90()
    }

    /// An uploader is healthy while its last sector upload succeeded
    pub fn healthy(&self) -> bool {
        self.state.lock().consecutive_failures == 0
    }

    pub fn update_block_height(&self, block_height: u64) {
        self.state.lock().block_height = block_height;
    }

    fn block_height(&self) -> u64 {
        self.state.lock().block_height
    }

    /// Record the outcome of a sector upload. Failures track a sentinel
    /// throughput of 1 byte/ms, deliberately depressing the p90 so the
    /// placement estimate deprioritizes this contract.
    fn track(&self, failed: bool, elapsed: std::time::Duration) {
        let mut state = self.state.lock();
        if failed {
            state.consecutive_failures += 1;
            self.stats_speed.track(1.0);
        } else {
            state.consecutive_failures = 0;
            let millis = elapsed.as_millis().max(1) as f64;
            self.stats_speed.track(SECTOR_SIZE as f64 / millis);
        }
    }

    /// The worker loop: wait for work, drain the queue, upload one
    /// sector at a time under the revision lock.
    pub async fn run(
        self: Arc<Self>,
        hp: Arc<dyn HostProvider>,
        rl: Arc<dyn RevisionLocker>,
        config: UploadConfig,
    ) {
        debug!(contract = %self.contract.id, host = %self.contract.host_key, "uploader started");
        'wait: loop {
            tokio::select! {
                _ = self.stop.cancelled() => break 'wait,
                _ = self.new_work.notified() => {}
            }

            loop {
                if self.stop.is_cancelled() {
                    break 'wait;
                }
                let Some(req) = self.pop() else {
                    continue 'wait;
                };
                if req.is_done() {
                    continue;
                }

                let start = Instant::now();
                let result = self.execute(&hp, &rl, &config, &req).await;

                let failed = result.is_err();
                let graceful_close = matches!(result, Err(HostClientError::StreamClosed));
                let cancelled_overdrive = req.overdrive && req.is_done() && failed;
                req.respond(self.contract.id, self.contract.host_key, result)
                    .await;

                // cancelled overdrives and gracefully closed streams are
                // kept out of the statistics
                if !cancelled_overdrive && !graceful_close {
                    self.track(failed, start.elapsed());
                }
            }
        }
        debug!(contract = %self.contract.id, "uploader stopped");
    }

    /// Perform one sector upload under the contract revision lock
    async fn execute(
        &self,
        hp: &Arc<dyn HostProvider>,
        rl: &Arc<dyn RevisionLocker>,
        config: &UploadConfig,
        req: &ShardUpload,
    ) -> Result<Hash256, HostClientError> {
        let rev_req = RevisionRequest {
            contract: self.contract.clone(),
            priority: LockPriority::Upload,
            block_height: self.block_height(),
            fetch_timeout: config.revision_fetch_timeout,
        };

        let hp = Arc::clone(hp);
        let contract = self.contract.clone();
        let sector = req.data.clone();
        let cancel = req.cancel.clone();
        let upload_one: RevisionFn = Box::new(move |revision| {
            Box::pin(async move {
                let host = hp.new_host(&contract).await?;
                tokio::select! {
                    _ = cancel.cancelled() => Err(HostClientError::Cancelled),
                    result = host.upload_sector(sector, &revision) => result,
                }
            })
        });
        rl.with_revision(rev_req, upload_one).await
    }
}
