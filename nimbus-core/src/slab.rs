//! The slab data model and codec
//!
//! A slab is `min_shards * SECTOR_SIZE` bytes of raw data that has been
//! erasure-encoded into sector-sized shards, encrypted, and stored
//! across a set of hosts. The codec here is purely computational: it
//! encodes, encrypts, reconstructs and recovers shard buffers, and does
//! no I/O of its own.

use crate::crypto::EncryptionKey;
use crate::error::{NimbusError, Result};
use crate::types::{ContractId, Hash256, PublicKey};
use crate::{LEAF_SIZE, SECTOR_SIZE};
use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// A sector stored on a particular host, identified by its Merkle root.
///
/// The host key is carried alongside the contract id so that repair can
/// tell whether a host already holds a piece of a slab even when there
/// are multiple contracts with that host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sector {
    /// Contract the sector was uploaded under
    pub contract: ContractId,

    /// Host storing the sector
    pub host: PublicKey,

    /// Merkle root of the sector
    pub root: Hash256,
}

/// Raw data erasure-encoded into sector-sized shards, encrypted, and
/// stored across a set of hosts. Shards `[0, min_shards)` hold data;
/// the rest hold parity. Each slab has its own encryption key, distinct
/// from the parent object's key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slab {
    /// Per-slab encryption key
    pub key: EncryptionKey,

    /// Number of data shards; at least this many shards must survive to
    /// reconstruct the slab
    pub min_shards: u8,

    /// The stored sectors, one per shard index
    pub shards: Vec<Sector>,
}

impl Slab {
    /// Create a new slab with a fresh random key and no stored shards
    pub fn new(min_shards: u8) -> Self {
        Self {
            key: EncryptionKey::generate(),
            min_shards,
            shards: Vec::new(),
        }
    }

    /// Length of the raw data stored in the slab
    pub fn length(&self) -> usize {
        SECTOR_SIZE * self.min_shards as usize
    }

    /// Encode slab data into sector-sized shards: a leaf-striped split
    /// across the first `min_shards` buffers, then Reed-Solomon parity
    /// into the rest. Every buffer is grown to exactly `SECTOR_SIZE`.
    ///
    /// Panics if the shard geometry is invalid; that is a programming
    /// error, not a runtime condition.
    pub fn encode(&self, data: &[u8], shards: &mut [Vec<u8>]) {
        for shard in shards.iter_mut() {
            shard.clear();
            shard.resize(SECTOR_SIZE, 0);
        }
        let min = self.min_shards as usize;
        striped_split(data, &mut shards[..min]);

        let rsc = ReedSolomon::new(min, shards.len() - min)
            .expect("valid erasure coding parameters");
        rsc.encode(shards).expect("parity encoding cannot fail on sized shards");
    }

    /// XOR shards with the keystream derived from the slab key, using a
    /// different nonce for each shard.
    pub fn encrypt(&self, shards: &mut [Vec<u8>]) {
        for (i, shard) in shards.iter_mut().enumerate() {
            self.key.xor_shard(shard, i as u8, 0);
        }
    }

    /// Reconstruct the missing shards of a slab in place. Missing shards
    /// must be empty buffers; present shards must be full sectors.
    ///
    /// Returns an error when fewer than `min_shards` shards survive.
    pub fn reconstruct(&self, shards: &mut [Vec<u8>]) -> Result<()> {
        for shard in shards.iter() {
            if !shard.is_empty() && shard.len() != SECTOR_SIZE {
                panic!("shards must have a length of either 0 or SECTOR_SIZE");
            }
        }

        let min = self.min_shards as usize;
        let rsc = ReedSolomon::new(min, shards.len() - min)
            .expect("valid erasure coding parameters");

        let mut present: Vec<Option<Vec<u8>>> = shards
            .iter_mut()
            .map(|s| if s.is_empty() { None } else { Some(std::mem::take(s)) })
            .collect();
        rsc.reconstruct(&mut present)?;

        for (shard, rebuilt) in shards.iter_mut().zip(present) {
            *shard = rebuilt.expect("reconstruct fills every shard");
        }
        Ok(())
    }
}

/// A contiguous region within a slab. Offset and length refer to the
/// reconstructed data and are not required to align to a leaf or chunk
/// boundary; use [`SlabSlice::sector_region`] for the chunk-aligned
/// region that must actually be downloaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlabSlice {
    /// The slab the region lives in
    pub slab: Slab,

    /// Offset of the region within the reconstructed slab data
    pub offset: u32,

    /// Length of the region
    pub length: u32,
}

impl SlabSlice {
    /// Offset and length of the per-sector region that must be
    /// downloaded in order to recover the data referenced by the slice.
    pub fn sector_region(&self) -> (u32, u32) {
        let min_chunk = LEAF_SIZE as u32 * u32::from(self.slab.min_shards);
        let leaf = LEAF_SIZE as u32;

        let start = (self.offset / min_chunk) * leaf;
        let mut end = ((self.offset + self.length) / min_chunk) * leaf;
        if (self.offset + self.length) % min_chunk != 0 {
            end += leaf;
        }
        (start, end - start)
    }

    /// XOR shards with the keystream derived from the slab key, with the
    /// stream counter advanced to the slice's chunk so a partial decrypt
    /// lines up with the downloaded sector region.
    pub fn decrypt(&self, shards: &mut [Vec<u8>]) {
        let min_chunk = LEAF_SIZE as u32 * u32::from(self.slab.min_shards);
        let counter = self.offset / min_chunk;
        for (i, shard) in shards.iter_mut().enumerate() {
            self.slab.key.xor_shard(shard, i as u8, counter);
        }
    }

    /// Recover the slice data from the supplied shards, writing exactly
    /// `length` bytes to `w`. Missing shards must be empty buffers; an
    /// all-empty shard set writes nothing.
    pub fn recover<W: Write>(&self, w: &mut W, shards: &mut [Vec<u8>]) -> Result<()> {
        if shards.is_empty() || shards.iter().all(|s| s.is_empty()) {
            return Ok(());
        }

        let min = self.slab.min_shards as usize;
        let rsc = ReedSolomon::new(min, shards.len() - min)
            .expect("valid erasure coding parameters");

        let mut present: Vec<Option<Vec<u8>>> = shards
            .iter_mut()
            .map(|s| if s.is_empty() { None } else { Some(std::mem::take(s)) })
            .collect();
        rsc.reconstruct_data(&mut present)?;

        for (shard, rebuilt) in shards.iter_mut().zip(present) {
            if let Some(rebuilt) = rebuilt {
                *shard = rebuilt;
            }
        }

        let min_chunk = LEAF_SIZE * min;
        let skip = self.offset as usize % min_chunk;
        striped_join(w, &shards[..min], skip, self.length as usize)
    }
}

/// An object: an ordered sequence of slab slices plus the key the
/// source stream was encrypted with before slabbing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    /// Object-level encryption key
    pub key: EncryptionKey,

    /// The object's data, in order
    pub slabs: Vec<SlabSlice>,
}

impl Object {
    /// Create a new empty object with a fresh random key
    pub fn new() -> Self {
        Self {
            key: EncryptionKey::generate(),
            slabs: Vec::new(),
        }
    }

    /// Total length of the object data
    pub fn length(&self) -> usize {
        self.slabs.iter().map(|s| s.length as usize).sum()
    }
}

impl Default for Object {
    fn default() -> Self {
        Self::new()
    }
}

/// Split data into leaf-striped data shards. The shards must already be
/// sized; striping stops when the data runs out.
fn striped_split(data: &[u8], data_shards: &mut [Vec<u8>]) {
    let mut read = 0;
    let mut off = 0;
    while read < data.len() {
        for shard in data_shards.iter_mut() {
            if read >= data.len() {
                break;
            }
            let n = LEAF_SIZE.min(data.len() - read);
            shard[off..off + n].copy_from_slice(&data[read..read + n]);
            read += n;
        }
        off += LEAF_SIZE;
    }
}

/// Join leaf-striped data shards, writing them to `w`. The first `skip`
/// bytes of the recovered stream are discarded and exactly `write_len`
/// bytes are written in total.
fn striped_join<W: Write>(
    w: &mut W,
    data_shards: &[Vec<u8>],
    mut skip: usize,
    mut write_len: usize,
) -> Result<()> {
    let mut off = 0;
    while write_len > 0 {
        for shard in data_shards {
            if shard.len() < off + LEAF_SIZE {
                return Err(NimbusError::ShortData);
            }
            let mut piece = &shard[off..off + LEAF_SIZE];
            if skip >= piece.len() {
                skip -= piece.len();
                continue;
            } else if skip > 0 {
                piece = &piece[skip..];
                skip = 0;
            }
            if write_len < piece.len() {
                piece = &piece[..write_len];
            }
            w.write_all(piece)?;
            write_len -= piece.len();
            if write_len == 0 {
                break;
            }
        }
        off += LEAF_SIZE;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic non-repeating test data
    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn encoded_slab(min_shards: u8, total_shards: usize, data: &[u8]) -> (Slab, Vec<Vec<u8>>) {
        let slab = Slab::new(min_shards);
        let mut shards = vec![Vec::new(); total_shards];
        slab.encode(data, &mut shards);
        slab.encrypt(&mut shards);
        (slab, shards)
    }

    #[test]
    fn test_striped_split_join_roundtrip() {
        let data = pattern(4 * LEAF_SIZE + 17);
        let mut shards = vec![vec![0u8; 3 * LEAF_SIZE]; 2];
        striped_split(&data, &mut shards);

        let mut out = Vec::new();
        striped_join(&mut out, &shards, 0, data.len()).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_striped_join_skip() {
        let data = pattern(6 * LEAF_SIZE);
        let mut shards = vec![vec![0u8; 3 * LEAF_SIZE]; 2];
        striped_split(&data, &mut shards);

        let mut out = Vec::new();
        striped_join(&mut out, &shards, 100, 150).unwrap();
        assert_eq!(out, data[100..250]);
    }

    #[test]
    fn test_striped_join_short_data() {
        let shards = vec![vec![0u8; LEAF_SIZE]; 2];
        let mut out = Vec::new();
        let err = striped_join(&mut out, &shards, 0, 4 * LEAF_SIZE).unwrap_err();
        assert!(matches!(err, NimbusError::ShortData));
    }

    #[test]
    fn test_encode_recover_roundtrip() {
        let data = pattern(2 * SECTOR_SIZE);
        let (slab, mut shards) = encoded_slab(2, 3, &data);
        assert!(shards.iter().all(|s| s.len() == SECTOR_SIZE));

        let slice = SlabSlice {
            slab,
            offset: 0,
            length: data.len() as u32,
        };
        slice.decrypt(&mut shards);

        let mut out = Vec::new();
        slice.recover(&mut out, &mut shards).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_reconstruct_after_maximum_loss() {
        let data = pattern(2 * SECTOR_SIZE);
        let (slab, mut shards) = encoded_slab(2, 4, &data);
        let pristine = shards.clone();

        // lose as many shards as there is parity
        shards[0] = Vec::new();
        shards[3] = Vec::new();
        slab.reconstruct(&mut shards).unwrap();
        assert_eq!(shards, pristine);
    }

    #[test]
    fn test_reconstruct_below_min_shards_fails() {
        let data = pattern(2 * SECTOR_SIZE);
        let (slab, mut shards) = encoded_slab(2, 4, &data);

        shards[0] = Vec::new();
        shards[1] = Vec::new();
        shards[2] = Vec::new();
        assert!(slab.reconstruct(&mut shards).is_err());
    }

    #[test]
    fn test_recover_partial_slice() {
        let data = pattern(2 * SECTOR_SIZE);
        let (slab, shards) = encoded_slab(2, 3, &data);

        // an unaligned region in the middle of the slab
        let slice = SlabSlice {
            slab,
            offset: 1234,
            length: 5 * LEAF_SIZE as u32 + 7,
        };

        // slice out only the chunk-aligned sector region, as a download
        // would, then decrypt and recover
        let (start, len) = slice.sector_region();
        let mut regions: Vec<Vec<u8>> = shards
            .iter()
            .map(|s| s[start as usize..(start + len) as usize].to_vec())
            .collect();
        slice.decrypt(&mut regions);

        let mut out = Vec::new();
        slice.recover(&mut out, &mut regions).unwrap();
        let offset = slice.offset as usize;
        assert_eq!(out, data[offset..offset + slice.length as usize]);
    }

    #[test]
    fn test_recover_from_data_loss() {
        let data = pattern(2 * SECTOR_SIZE);
        let (slab, mut shards) = encoded_slab(2, 4, &data);

        let slice = SlabSlice {
            slab,
            offset: 0,
            length: data.len() as u32,
        };
        slice.decrypt(&mut shards);

        // drop a data shard; recovery must rebuild it from parity
        shards[1] = Vec::new();
        let mut out = Vec::new();
        slice.recover(&mut out, &mut shards).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_recover_all_empty_writes_nothing() {
        let slab = Slab::new(2);
        let slice = SlabSlice {
            slab,
            offset: 0,
            length: 100,
        };
        let mut shards = vec![Vec::new(); 4];
        let mut out = Vec::new();
        slice.recover(&mut out, &mut shards).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_sector_region() {
        let slab = Slab::new(2); // min chunk is 128 bytes
        let region = |offset, length| SlabSlice {
            slab: slab.clone(),
            offset,
            length,
        }
        .sector_region();

        assert_eq!(region(0, 128), (0, 64));
        assert_eq!(region(0, 129), (0, 128));
        assert_eq!(region(130, 10), (64, 64));
        assert_eq!(region(130, 130), (64, 128));
    }

    #[test]
    fn test_slab_keys_are_unique() {
        assert_ne!(Slab::new(2).key, Slab::new(2).key);
    }

    #[test]
    fn test_slab_length() {
        assert_eq!(Slab::new(3).length(), 3 * SECTOR_SIZE);
    }
}
