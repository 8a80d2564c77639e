//! Outbound host interfaces
//!
//! The engine performs no networking of its own: opening a session to a
//! host, performing the sector RPC and serializing contract revisions
//! are all injected through the traits here.

use crate::error::HostClientError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use nimbus_core::{Contract, ContractId, Hash256};
use std::time::Duration;

/// A locked snapshot of a contract's revision, handed to the sector RPC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractRevision {
    /// The contract being revised
    pub contract: ContractId,

    /// Monotonic revision number under the lock
    pub revision_number: u64,
}

/// Priority with which the contract revision lock is requested.
/// Interactive uploads outrank background contract maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockPriority {
    Background,
    Upload,
}

/// A request to run a closure under a contract's revision lock
#[derive(Debug, Clone)]
pub struct RevisionRequest {
    /// The contract to lock
    pub contract: Contract,

    /// Lock priority
    pub priority: LockPriority,

    /// The renter's current block height
    pub block_height: u64,

    /// How long to wait for the lock
    pub fetch_timeout: Duration,
}

/// The closure run while the revision lock is held. It performs exactly
/// one sector upload and resolves to the sector's Merkle root.
pub type RevisionFn =
    Box<dyn FnOnce(ContractRevision) -> BoxFuture<'static, Result<Hash256, HostClientError>> + Send>;

/// An open session with a host, able to upload sectors under a contract
#[async_trait]
pub trait SectorUploader: Send + Sync {
    /// Upload one sector, returning its Merkle root as computed by the
    /// host. `sector` is always exactly `SECTOR_SIZE` bytes.
    async fn upload_sector(
        &self,
        sector: Bytes,
        revision: &ContractRevision,
    ) -> Result<Hash256, HostClientError>;
}

/// Opens sessions to hosts
#[async_trait]
pub trait HostProvider: Send + Sync {
    /// Open a session to the host behind `contract`
    async fn new_host(&self, contract: &Contract)
        -> Result<Box<dyn SectorUploader>, HostClientError>;
}

/// Serializes access to a contract's monotonic revision counter. The
/// lock is held for the duration of the closure, which is exactly one
/// sector RPC.
#[async_trait]
pub trait RevisionLocker: Send + Sync {
    async fn with_revision(
        &self,
        req: RevisionRequest,
        f: RevisionFn,
    ) -> Result<Hash256, HostClientError>;
}
