//! Per-upload state and the messages flowing through one upload
//!
//! An `Upload` exists for the duration of a single object (or one
//! migrated slab). It carries the placement policy: contracts excluded
//! up front, contracts already used per slab, and the order of slabs
//! currently sharing the uploader pool.

use crate::error::{HostClientError, UploadError};
use bytes::Bytes;
use nimbus_core::{ContractId, Hash256, PublicKey, SlabId, SlabSlice, UploadId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

/// How many slabs of one upload may occupy the uploader pool at once.
/// Placement for a younger slab blocks until fewer than this many older
/// slabs are still uploading.
pub(crate) const MAX_OVERLAPPING_SLABS: usize = 3;

/// One sector upload handed to an uploader's queue. Descriptors are
/// by-value messages: duplicating one (for overdrive or a relaunch)
/// shares the sector bytes and the per-shard cancellation token.
pub(crate) struct ShardUpload {
    pub slab_id: SlabId,
    pub shard_index: usize,
    pub data: Bytes,
    pub overdrive: bool,
    pub cancel: CancellationToken,
    pub response: mpsc::Sender<ShardResponse>,
}

impl ShardUpload {
    /// Whether the shard no longer needs uploading (a sibling finished
    /// first or the slab was abandoned)
    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Deliver the outcome of one sector RPC back to the coordinator.
    /// Dropped silently if the shard was cancelled in the meantime.
    pub async fn respond(
        &self,
        contract: ContractId,
        host: PublicKey,
        result: Result<Hash256, HostClientError>,
    ) {
        let resp = ShardResponse {
            shard_index: self.shard_index,
            overdrive: self.overdrive,
            contract,
            host,
            result,
        };
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.response.send(resp) => {}
        }
    }
}

/// Outcome of one sector RPC
pub(crate) struct ShardResponse {
    pub shard_index: usize,
    pub overdrive: bool,
    pub contract: ContractId,
    pub host: PublicKey,
    pub result: Result<Hash256, HostClientError>,
}

/// Outcome of one slab upload, tagged with the slab's position in the
/// object so the driver can reorder completions
pub(crate) struct SlabResponse {
    pub index: usize,
    pub result: Result<SlabSlice, UploadError>,
}

#[derive(Default)]
struct UploadState {
    /// Slabs currently sharing the pool, oldest first
    ongoing: Vec<SlabId>,

    /// Contracts already carrying a shard of each slab
    used: HashMap<SlabId, HashSet<ContractId>>,
}

/// State shared by everything working on one object upload
pub(crate) struct Upload {
    pub id: UploadId,

    /// Released by a slab coordinator when its slab is nearly done,
    /// allowing the driver to read the next slab. Primed once so the
    /// first read proceeds immediately.
    pub next_read: Notify,

    /// Pulsed on every successful shard so blocked placements re-check
    /// the overlapping-slab gate
    pub done_shard: Notify,

    excluded: HashSet<ContractId>,
    state: Mutex<UploadState>,
}

impl Upload {
    pub fn new(excluded: HashSet<ContractId>) -> Arc<Self> {
        let upload = Arc::new(Self {
            id: UploadId::new_random(),
            next_read: Notify::new(),
            done_shard: Notify::new(),
            excluded,
            state: Mutex::new(UploadState::default()),
        });
        upload.next_read.notify_one();
        upload
    }

    /// Whether a contract may carry a shard of the given slab
    pub fn can_use(&self, contract: ContractId, slab_id: SlabId) -> bool {
        if self.excluded.contains(&contract) {
            return false;
        }
        let state = self.state.lock();
        !state
            .used
            .get(&slab_id)
            .is_some_and(|used| used.contains(&contract))
    }

    /// Record that a contract now carries a shard of the given slab
    pub fn register_used(&self, slab_id: SlabId, contract: ContractId) {
        self.state
            .lock()
            .used
            .entry(slab_id)
            .or_default()
            .insert(contract);
    }

    /// Add a slab to the ongoing set
    pub fn register_slab(&self, slab_id: SlabId) {
        self.state.lock().ongoing.push(slab_id);
    }

    /// Remove a finished slab from the ongoing set
    pub fn finish_slab(&self, slab_id: SlabId) {
        self.state.lock().ongoing.retain(|id| *id != slab_id);
    }

    /// Number of ongoing slabs older than the given slab
    pub fn older_slabs(&self, slab_id: SlabId) -> usize {
        self.state
            .lock()
            .ongoing
            .iter()
            .take_while(|id| **id != slab_id)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusion_is_permanent() {
        let excluded = ContractId([1u8; 32]);
        let upload = Upload::new([excluded].into_iter().collect());
        let slab = SlabId::new_random();

        assert!(!upload.can_use(excluded, slab));
        assert!(upload.can_use(ContractId([2u8; 32]), slab));
    }

    #[test]
    fn test_used_contract_is_per_slab() {
        let upload = Upload::new(HashSet::new());
        let contract = ContractId([1u8; 32]);
        let slab_a = SlabId::new_random();
        let slab_b = SlabId::new_random();

        upload.register_used(slab_a, contract);
        assert!(!upload.can_use(contract, slab_a));
        // the same contract is still usable for a different slab
        assert!(upload.can_use(contract, slab_b));
    }

    #[test]
    fn test_older_slabs_counts_predecessors() {
        let upload = Upload::new(HashSet::new());
        let slabs: Vec<SlabId> = (0..4).map(|_| SlabId::new_random()).collect();
        for id in &slabs {
            upload.register_slab(*id);
        }

        assert_eq!(upload.older_slabs(slabs[0]), 0);
        assert_eq!(upload.older_slabs(slabs[3]), 3);

        upload.finish_slab(slabs[0]);
        assert_eq!(upload.older_slabs(slabs[3]), 2);
    }

    #[tokio::test]
    async fn test_next_read_is_primed() {
        let upload = Upload::new(HashSet::new());
        // must complete immediately thanks to the stored permit
        upload.next_read.notified().await;
    }
}
