//! Slab-upload coordination
//!
//! One `SlabUpload` drives the shards of a single slab to completion:
//! it launches every shard on a distinct contract, relaunches failures
//! elsewhere, launches speculative duplicates ("overdrive") when
//! responses stall, and adjudicates success once every sector slot holds
//! a root.

use crate::error::{HostError, UploadError};
use crate::manager::UploadManager;
use crate::upload::{ShardResponse, ShardUpload, SlabResponse, Upload};
use bytes::Bytes;
use nimbus_core::{Hash256, Sector, Slab, SlabId, SlabSlice, SECTOR_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct SlabState {
    num_inflight: u64,
    num_launched: u64,
    next_read_triggered: bool,
    last_overdrive: Option<Instant>,
    /// Overdrive launches per shard index
    overdriving: HashMap<usize, u64>,
    /// Cancellation handle per shard index still lacking a root
    remaining: HashMap<usize, CancellationToken>,
    /// Result sectors, zero-rooted while unfilled
    sectors: Vec<Sector>,
    errs: crate::error::HostErrorSet,
}

/// Coordinator for the shards of one slab
pub(crate) struct SlabUpload {
    mgr: UploadManager,
    upload: Arc<Upload>,
    slab_id: SlabId,
    started: Instant,
    ctx: CancellationToken,
    shards: Vec<Bytes>,
    response: mpsc::Sender<ShardResponse>,
    state: Mutex<SlabState>,
}

impl SlabUpload {
    fn new(
        mgr: UploadManager,
        upload: Arc<Upload>,
        ctx: CancellationToken,
        shards: Vec<Bytes>,
        response: mpsc::Sender<ShardResponse>,
    ) -> Self {
        let total = shards.len();
        let remaining = (0..total).map(|i| (i, ctx.child_token())).collect();
        Self {
            mgr,
            upload,
            slab_id: SlabId::new_random(),
            started: Instant::now(),
            ctx,
            shards,
            response,
            state: Mutex::new(SlabState {
                num_inflight: 0,
                num_launched: 0,
                next_read_triggered: false,
                last_overdrive: None,
                overdriving: HashMap::with_capacity(total),
                remaining,
                sectors: vec![Sector::default(); total],
                errs: Default::default(),
            }),
        }
    }

    /// Build a launchable request for a shard that is still remaining
    fn shard_request(&self, shard_index: usize, overdrive: bool) -> Option<ShardUpload> {
        let state = self.state.lock();
        let cancel = state.remaining.get(&shard_index)?.clone();
        Some(ShardUpload {
            slab_id: self.slab_id,
            shard_index,
            data: self.shards[shard_index].clone(),
            overdrive,
            cancel,
            response: self.response.clone(),
        })
    }

    /// Place a shard with an uploader. Placement may block on the
    /// overlapping-slab gate; counters are only touched once an
    /// uploader accepted the shard.
    async fn launch(&self, req: ShardUpload) -> Result<(), UploadError> {
        let uploader = self
            .mgr
            .select_uploader(&self.upload, req.slab_id, &req.cancel)
            .await?;

        {
            let mut state = self.state.lock();
            state.num_inflight += 1;
            state.num_launched += 1;
            if req.overdrive {
                state.last_overdrive = Some(Instant::now());
                *state.overdriving.entry(req.shard_index).or_insert(0) += 1;
            }
        }
        self.upload.register_used(req.slab_id, uploader.contract().id);

        debug!(
            slab = %self.slab_id,
            shard = req.shard_index,
            overdrive = req.overdrive,
            contract = %uploader.contract().id,
            "launching shard upload"
        );
        uploader.schedule(req);
        Ok(())
    }

    /// Process one shard response. Returns true once every sector slot
    /// holds a root.
    fn receive(&self, resp: ShardResponse) -> bool {
        let mut state = self.state.lock();
        state.num_inflight -= 1;

        // failed requests cannot complete the slab
        let root = match resp.result {
            Ok(root) => root,
            Err(err) => {
                state.errs.push(HostError {
                    host: resp.host,
                    err,
                });
                return false;
            }
        };

        // a faster duplicate already filled the slot
        if state.sectors[resp.shard_index].root != Hash256::ZERO {
            return false;
        }

        state.sectors[resp.shard_index] = Sector {
            contract: resp.contract,
            host: resp.host,
            root,
        };

        // cancel the shard so overdrive duplicates in flight abort
        if let Some(cancel) = state.remaining.remove(&resp.shard_index) {
            cancel.cancel();
        }
        state.remaining.is_empty()
    }

    /// The next speculative duplicate to launch, if overdrive applies:
    /// the slab must be nearly done, the last overdrive must be stale,
    /// and duplicates in flight must be below the cap. Picks the
    /// remaining shard with the fewest duplicates so far.
    fn next_overdrive(&self) -> Option<ShardUpload> {
        let config = self.mgr.config();
        let state = self.state.lock();

        if state.remaining.len() as u64 >= config.max_overdrive {
            return None;
        }
        if let Some(last) = state.last_overdrive {
            if last.elapsed() < config.overdrive_timeout {
                return None;
            }
        }
        let duplicates_inflight = state
            .num_inflight
            .saturating_sub(state.remaining.len() as u64);
        if duplicates_inflight >= config.max_overdrive {
            return None;
        }

        let shard_index = state
            .remaining
            .keys()
            .copied()
            .min_by_key(|i| state.overdriving.get(i).copied().unwrap_or(0))?;
        let cancel = state.remaining[&shard_index].clone();
        Some(ShardUpload {
            slab_id: self.slab_id,
            shard_index,
            data: self.shards[shard_index].clone(),
            overdrive: true,
            cancel,
            response: self.response.clone(),
        })
    }

    /// Release the driver to read the next slab once this one is nearly
    /// done. Latched: one trigger per slab.
    fn try_trigger_next_read(&self) {
        let mut state = self.state.lock();
        if !state.next_read_triggered
            && state.remaining.len() as u64 <= self.mgr.config().max_overdrive
        {
            state.next_read_triggered = true;
            self.upload.next_read.notify_one();
        }
    }

    fn inflight(&self) -> u64 {
        self.state.lock().num_inflight
    }

    /// Bytes per millisecond across the completed shards of this slab
    fn upload_speed(&self) -> f64 {
        let state = self.state.lock();
        let completed = state.sectors.len() - state.remaining.len();
        let bytes = (completed * SECTOR_SIZE) as f64;
        bytes / self.started.elapsed().as_millis().max(1) as f64
    }

    /// Fraction of launches that went beyond the slab's shard count
    fn overdrive_pct(&self) -> f64 {
        let state = self.state.lock();
        let overdriven = state.num_launched.saturating_sub(state.sectors.len() as u64);
        if overdriven == 0 {
            return 0.0;
        }
        overdriven as f64 / state.sectors.len() as f64
    }

    /// Cancel every shard still lacking a root
    fn cancel_remaining(&self) {
        for cancel in self.state.lock().remaining.values() {
            cancel.cancel();
        }
    }

    /// Adjudicate the slab: the sector vector on success, the bundled
    /// failure state otherwise
    fn finish(&self) -> Result<Vec<Sector>, UploadError> {
        let mut state = self.state.lock();
        if !state.remaining.is_empty() {
            return Err(UploadError::SlabUploadFailed {
                remaining: state.remaining.len(),
                inflight: state.num_inflight,
                launched: state.num_launched,
                uploaders: self.mgr.num_uploaders(),
                errs: std::mem::take(&mut state.errs),
            });
        }
        Ok(state.sectors.clone())
    }

    /// Launch every shard, then collect responses until the slab is
    /// complete, relaunching failures and overdriving stalled shards.
    async fn run(&self, rx: &mut mpsc::Receiver<ShardResponse>) -> Result<(), UploadError> {
        for shard_index in 0..self.shards.len() {
            let req = self
                .shard_request(shard_index, false)
                .expect("every shard is remaining at the start");
            self.launch(req).await?;
        }

        let timeout = self.mgr.config().overdrive_timeout;
        let mut deadline = tokio::time::Instant::now() + timeout;
        let mut finished = false;
        while self.inflight() > 0 && !finished {
            tokio::select! {
                _ = self.mgr.stopped() => return Err(UploadError::Stopped),
                _ = self.ctx.cancelled() => return Err(UploadError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    if let Some(req) = self.next_overdrive() {
                        // ignore placement errors, the timer fires again
                        let _ = self.launch(req).await;
                    }
                    deadline = tokio::time::Instant::now() + timeout;
                }
                Some(resp) = rx.recv() => {
                    let succeeded = resp.result.is_ok();
                    let relaunch = (!succeeded && !resp.overdrive).then_some(resp.shard_index);

                    finished = self.receive(resp);

                    if succeeded {
                        deadline = tokio::time::Instant::now() + timeout;
                        self.upload.done_shard.notify_one();
                        self.try_trigger_next_read();
                    }

                    // relaunch failed non-overdrive shards elsewhere; if
                    // that fails too the slab is failed
                    if let Some(shard_index) = relaunch {
                        if let Some(req) = self.shard_request(shard_index, false) {
                            if self.launch(req).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Upload a set of pre-encoded, pre-encrypted shards as one slab,
/// returning the resulting sectors.
pub(crate) async fn upload_shards(
    mgr: UploadManager,
    upload: Arc<Upload>,
    ctx: CancellationToken,
    shards: Vec<Bytes>,
) -> Result<Vec<Sector>, UploadError> {
    let capacity = shards.len() + mgr.config().max_overdrive as usize + 1;
    let (tx, mut rx) = mpsc::channel(capacity);
    let slab = SlabUpload::new(mgr, upload.clone(), ctx, shards, tx);
    upload.register_slab(slab.slab_id);
    debug!(upload_id = %upload.id, slab = %slab.slab_id, "uploading slab shards");

    let outcome = slab.run(&mut rx).await;
    upload.finish_slab(slab.slab_id);
    slab.cancel_remaining();

    match outcome {
        Ok(()) => {
            slab.mgr
                .track_slab(slab.overdrive_pct(), slab.upload_speed());
            slab.finish()
        }
        Err(err) => Err(err),
    }
}

/// Encode, encrypt and upload one slab of object data, reporting the
/// resulting slice (or the failure) to the driver.
pub(crate) async fn upload_slab(
    mgr: UploadManager,
    upload: Arc<Upload>,
    ctx: CancellationToken,
    redundancy: crate::config::RedundancySettings,
    data: Vec<u8>,
    length: usize,
    index: usize,
    response: mpsc::Sender<SlabResponse>,
) {
    debug!(upload_id = %upload.id, slab_index = index, length, "encoding slab");
    let mut slab = Slab::new(redundancy.min_shards);
    let mut buffers = vec![Vec::new(); redundancy.total()];
    slab.encode(&data, &mut buffers);
    slab.encrypt(&mut buffers);
    let shards: Vec<Bytes> = buffers.into_iter().map(Bytes::from).collect();

    let result = upload_shards(mgr, upload, ctx.clone(), shards)
        .await
        .map(|sectors| {
            slab.shards = sectors;
            SlabSlice {
                slab,
                offset: 0,
                length: length as u32,
            }
        });

    let resp = SlabResponse { index, result };
    tokio::select! {
        _ = ctx.cancelled() => {}
        _ = response.send(resp) => {}
    }
}
