//! The upload manager
//!
//! Process-wide pool of per-contract uploaders plus the object-upload
//! driver. The manager owns uploader lifecycles (contracts appear and
//! disappear via [`UploadManager::refresh_uploaders`]), places each
//! shard on the least-loaded usable uploader, and publishes pool-wide
//! statistics. The manager is a cheap clonable handle; inject it where
//! needed rather than reaching for ambient state.

use crate::config::{RedundancySettings, UploadConfig};
use crate::error::UploadError;
use crate::host::{HostProvider, RevisionLocker};
use crate::slab_upload::{upload_shards, upload_slab};
use crate::stats::{DataPoints, STATS_WINDOW};
use crate::upload::{SlabResponse, Upload, MAX_OVERLAPPING_SLABS};
use crate::uploader::Uploader;
use bytes::Bytes;
use nimbus_core::{Contract, ContractId, Object, PublicKey, Sector, SlabId, SlabSlice};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, instrument};

/// Snapshot of pool-wide upload statistics
#[derive(Debug, Clone)]
pub struct UploadManagerStats {
    /// Rolling p90 upload speed across recent slabs, in megabits per
    /// second
    pub avg_upload_speed_mbps: f64,

    /// Rolling p90 of the per-slab overdrive fraction
    pub overdrive_pct: f64,

    /// Uploaders whose last sector upload succeeded
    pub healthy_uploaders: u64,

    /// Total uploaders in the pool
    pub num_uploaders: u64,

    /// Per-host p90 upload speed, in megabits per second
    pub upload_speeds_p90_mbps: HashMap<PublicKey, f64>,
}

struct Inner {
    hp: Arc<dyn HostProvider>,
    rl: Arc<dyn RevisionLocker>,
    config: UploadConfig,
    stats_overdrive: DataPoints,
    stats_speed: DataPoints,
    stop: CancellationToken,
    uploaders: Mutex<Vec<Arc<Uploader>>>,
}

/// The upload engine's entry point. One per process; clones share the
/// same pool.
#[derive(Clone)]
pub struct UploadManager {
    inner: Arc<Inner>,
}

impl UploadManager {
    /// Create a manager with an empty uploader pool
    pub fn new(
        hp: Arc<dyn HostProvider>,
        rl: Arc<dyn RevisionLocker>,
        config: UploadConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                hp,
                rl,
                config,
                stats_overdrive: DataPoints::new(STATS_WINDOW),
                stats_speed: DataPoints::new(STATS_WINDOW),
                stop: CancellationToken::new(),
                uploaders: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Reconcile the uploader pool with the given contract set: spawn a
    /// worker for every new contract, stop workers whose contract left
    /// the set, and propagate the block height to everyone. Must be
    /// called from within a tokio runtime.
    pub fn refresh_uploaders(&self, contracts: &[Contract], block_height: u64) {
        let inner = &self.inner;
        let mut pool = inner.uploaders.lock();

        let mut added: HashMap<ContractId, Contract> =
            contracts.iter().map(|c| (c.id, c.clone())).collect();
        let before = pool.len();
        pool.retain(|uploader| {
            if added.remove(&uploader.contract().id).is_some() {
                true
            } else {
                uploader.stop();
                false
            }
        });
        let removed = before - pool.len();
        let spawned = added.len();

        for (_, contract) in added {
            let uploader = Uploader::new(contract);
            tokio::spawn(Arc::clone(&uploader).run(
                Arc::clone(&inner.hp),
                Arc::clone(&inner.rl),
                inner.config.clone(),
            ));
            pool.push(uploader);
        }

        for uploader in pool.iter() {
            uploader.update_block_height(block_height);
        }
        debug!(
            total = pool.len(),
            spawned, removed, block_height, "refreshed uploader pool"
        );
    }

    /// Composite statistics snapshot
    pub fn stats(&self) -> UploadManagerStats {
        let inner = &self.inner;
        let pool = inner.uploaders.lock();

        let mut stats = UploadManagerStats {
            // convert bytes per ms to megabits per second
            avg_upload_speed_mbps: inner.stats_speed.recompute() * 0.008,
            overdrive_pct: inner.stats_overdrive.recompute(),
            healthy_uploaders: 0,
            num_uploaders: pool.len() as u64,
            upload_speeds_p90_mbps: HashMap::with_capacity(pool.len()),
        };

        for uploader in pool.iter() {
            uploader.recompute_stats();
            stats.upload_speeds_p90_mbps.insert(
                uploader.contract().host_key,
                uploader.p90_bytes_per_ms() * 0.008,
            );
            if uploader.healthy() {
                stats.healthy_uploaders += 1;
            }
        }
        stats
    }

    /// Stop the manager and every uploader. In-flight sector uploads
    /// are allowed to complete.
    pub fn stop(&self) {
        self.inner.stop.cancel();
        for uploader in self.inner.uploaders.lock().iter() {
            uploader.stop();
        }
        info!("upload manager stopped");
    }

    /// Upload an object: read the stream slab by slab, encode and
    /// encrypt each slab, fan the slabs out over the pool, and return
    /// the ordered manifest.
    #[instrument(skip_all, fields(min_shards = redundancy.min_shards, total_shards = redundancy.total_shards))]
    pub async fn upload<R>(
        &self,
        ctx: CancellationToken,
        mut reader: R,
        redundancy: RedundancySettings,
    ) -> Result<Object, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        redundancy.validate()?;
        let upload = self.new_upload(redundancy.total(), HashSet::new())?;
        info!(upload_id = %upload.id, "starting object upload");

        // every task below lives under this token; it dies with the
        // driver, cancelling whatever is still in flight
        let root = ctx.child_token();
        let _guard = root.clone().drop_guard();

        let mut object = Object::new();
        let (response_tx, mut response_rx) = mpsc::channel::<SlabResponse>(1);

        let slab_size = redundancy.slab_size();
        let mut responses: Vec<(usize, SlabSlice)> = Vec::new();
        let mut slab_index = 0usize;
        let mut num_slabs: Option<usize> = None;
        let mut stream_offset = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = self.inner.stop.cancelled() => return Err(UploadError::Stopped),
                _ = root.cancelled() => return Err(UploadError::Cancelled),
                Some(resp) = response_rx.recv() => {
                    let slice = resp.result?;
                    responses.push((resp.index, slice));
                    if Some(responses.len()) == num_slabs {
                        break;
                    }
                }
                _ = upload.next_read.notified(), if num_slabs.is_none() => {
                    let mut data = vec![0u8; slab_size];
                    let length = read_full(&mut reader, &mut data).await?;
                    if length == 0 {
                        num_slabs = Some(slab_index);
                        if responses.len() == slab_index {
                            break;
                        }
                        continue;
                    }

                    // the source stream is encrypted under the object
                    // key before slabbing
                    object.key.xor_stream_at(&mut data[..length], stream_offset);
                    stream_offset += length as u64;

                    tokio::spawn(upload_slab(
                        self.clone(),
                        Arc::clone(&upload),
                        root.child_token(),
                        redundancy,
                        data,
                        length,
                        slab_index,
                        response_tx.clone(),
                    ));
                    slab_index += 1;
                }
            }
        }

        // slabs complete in any order; the manifest is ordered
        responses.sort_by_key(|(index, _)| *index);
        object.slabs = responses.into_iter().map(|(_, slice)| slice).collect();

        info!(
            upload_id = %upload.id,
            slabs = object.slabs.len(),
            size = object.length(),
            "object upload complete"
        );
        Ok(object)
    }

    /// Re-upload the already encoded and encrypted shards of one slab,
    /// e.g. to move them off the hosts in `excluded`. Returns the
    /// resulting sector set.
    #[instrument(skip_all, fields(shards = shards.len(), excluded = excluded.len()))]
    pub async fn migrate(
        &self,
        ctx: CancellationToken,
        shards: Vec<Vec<u8>>,
        excluded: HashSet<ContractId>,
    ) -> Result<Vec<Sector>, UploadError> {
        let upload = self.new_upload(shards.len(), excluded)?;
        debug!(upload_id = %upload.id, "starting slab migration");

        let root = ctx.child_token();
        let _guard = root.clone().drop_guard();

        let shards: Vec<Bytes> = shards.into_iter().map(Bytes::from).collect();
        upload_shards(self.clone(), upload, root, shards).await
    }

    /// Create the per-upload state, verifying the pool can satisfy the
    /// requested redundancy at all
    fn new_upload(
        &self,
        total_shards: usize,
        excluded: HashSet<ContractId>,
    ) -> Result<Arc<Upload>, UploadError> {
        let pool = self.inner.uploaders.lock();
        let usable = pool
            .iter()
            .filter(|u| !excluded.contains(&u.contract().id))
            .count();
        if usable < total_shards {
            return Err(UploadError::NotEnoughUploaders {
                available: usable,
                required: total_shards,
            });
        }
        Ok(Upload::new(excluded))
    }

    /// Pick an uploader for a shard: sort the pool by estimated time to
    /// completion, drop uploaders the shard's slab cannot use, and gate
    /// young slabs behind the overlapping-slab cap.
    pub(crate) async fn select_uploader(
        &self,
        upload: &Upload,
        slab_id: SlabId,
        cancel: &CancellationToken,
    ) -> Result<Arc<Uploader>, UploadError> {
        let candidates = {
            let mut pool = self.inner.uploaders.lock();
            for uploader in pool.iter() {
                uploader.recompute_stats();
            }
            pool.sort_by(|a, b| a.estimate().total_cmp(&b.estimate()));
            pool.iter()
                .filter(|u| upload.can_use(u.contract().id, slab_id))
                .cloned()
                .collect::<Vec<_>>()
        };
        if candidates.is_empty() {
            return Err(UploadError::NoFreeUploader);
        }

        loop {
            if upload.older_slabs(slab_id) < MAX_OVERLAPPING_SLABS {
                return Ok(Arc::clone(&candidates[0]));
            }
            // too many older slabs in flight; wait for one of their
            // shards to complete before placing this one
            tokio::select! {
                _ = upload.done_shard.notified() => {}
                _ = cancel.cancelled() => return Err(UploadError::NoFreeUploader),
            }
        }
    }

    /// Fold a finished slab's statistics into the pool-wide windows
    pub(crate) fn track_slab(&self, overdrive_pct: f64, speed_bytes_per_ms: f64) {
        self.inner.stats_overdrive.track(overdrive_pct);
        self.inner.stats_speed.track(speed_bytes_per_ms);
    }

    pub(crate) fn config(&self) -> &UploadConfig {
        &self.inner.config
    }

    pub(crate) fn num_uploaders(&self) -> usize {
        self.inner.uploaders.lock().len()
    }

    pub(crate) fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.inner.stop.cancelled()
    }
}

/// Read until `buf` is full or the stream ends; returns the bytes read
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
