//! Nimbus Renter Library
//!
//! The concurrent upload engine of the Nimbus storage renter. It takes
//! an arbitrary byte stream, splits it into fixed-size slabs, encodes
//! and encrypts each slab into sector-sized shards, and uploads the
//! shards in parallel across a pool of host contracts while meeting a
//! redundancy target. Slow hosts are masked by speculative duplicate
//! uploads; a pipelined reader keeps a bounded number of slabs in
//! flight.
//!
//! The engine performs no networking of its own: hosts are reached
//! through the [`host::HostProvider`], [`host::SectorUploader`] and
//! [`host::RevisionLocker`] interfaces.

pub mod config;
pub mod error;
pub mod host;
pub mod manager;
pub mod stats;

mod slab_upload;
mod upload;
mod uploader;

pub use config::{RedundancySettings, UploadConfig};
pub use error::{HostClientError, HostError, HostErrorSet, UploadError};
pub use host::{
    ContractRevision, HostProvider, LockPriority, RevisionFn, RevisionLocker, RevisionRequest,
    SectorUploader,
};
pub use manager::{UploadManager, UploadManagerStats};
pub use stats::DataPoints;
