//! Nimbus Core Library
//!
//! Core abstractions for the Nimbus storage renter.
//! This crate provides:
//! - The slab data model (sectors, slabs, slab slices, objects)
//! - Reed-Solomon erasure coding with leaf-aligned striping
//! - XChaCha20 keystream encryption for shards and object streams
//! - Fixed-width identifiers and common error handling

pub mod crypto;
pub mod error;
pub mod slab;
pub mod types;

pub use crypto::EncryptionKey;
pub use error::{NimbusError, Result};
pub use slab::{Object, Sector, Slab, SlabSlice};
pub use types::{Contract, ContractId, Hash256, PublicKey, SlabId, UploadId};

/// Size of a sector, the unit stored on a host (4 MiB).
pub const SECTOR_SIZE: usize = 1 << 22;

/// Size of a Merkle tree leaf within a sector. Striping of slab data
/// across shards happens in leaf-sized pieces.
pub const LEAF_SIZE: usize = 64;
