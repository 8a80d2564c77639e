//! Configuration for the upload engine

use crate::error::UploadError;
use nimbus_core::SECTOR_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning knobs for the upload manager
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Maximum number of speculative duplicate uploads per slab. Also
    /// the remaining-shard threshold below which the next slab read is
    /// released.
    pub max_overdrive: u64,

    /// How long to wait for a shard response before launching a
    /// speculative duplicate for a remaining shard
    pub overdrive_timeout: Duration,

    /// How long an uploader waits for the contract revision lock before
    /// giving up on a sector upload
    pub revision_fetch_timeout: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_overdrive: 3,
            overdrive_timeout: Duration::from_secs(3),
            revision_fetch_timeout: Duration::from_secs(30),
        }
    }
}

/// Redundancy of an object: every slab is erasure-encoded into
/// `total_shards` shards of which any `min_shards` reconstruct the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancySettings {
    /// Number of data shards per slab
    pub min_shards: u8,

    /// Total number of shards per slab (data + parity)
    pub total_shards: u8,
}

impl RedundancySettings {
    /// Create validated redundancy settings
    pub fn new(min_shards: u8, total_shards: u8) -> Result<Self, UploadError> {
        let settings = Self {
            min_shards,
            total_shards,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Check the settings describe a usable erasure code
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.min_shards == 0 {
            return Err(UploadError::InvalidRedundancy(
                "min_shards must be greater than 0".into(),
            ));
        }
        if self.total_shards <= self.min_shards {
            return Err(UploadError::InvalidRedundancy(format!(
                "total_shards ({}) must exceed min_shards ({})",
                self.total_shards, self.min_shards
            )));
        }
        Ok(())
    }

    /// Total number of shards per slab
    pub fn total(&self) -> usize {
        self.total_shards as usize
    }

    /// Raw bytes stored per slab
    pub fn slab_size(&self) -> usize {
        self.min_shards as usize * SECTOR_SIZE
    }

    /// Storage expansion factor
    pub fn redundancy(&self) -> f64 {
        f64::from(self.total_shards) / f64::from(self.min_shards)
    }
}

impl Default for RedundancySettings {
    fn default() -> Self {
        Self {
            min_shards: 10,
            total_shards: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = UploadConfig::default();
        assert_eq!(config.max_overdrive, 3);
        assert_eq!(config.overdrive_timeout, Duration::from_secs(3));
        assert_eq!(config.revision_fetch_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_redundancy_validation() {
        assert!(RedundancySettings::new(2, 4).is_ok());
        assert!(RedundancySettings::new(0, 4).is_err());
        assert!(RedundancySettings::new(4, 4).is_err());
        assert!(RedundancySettings::new(4, 2).is_err());
    }

    #[test]
    fn test_redundancy_sizes() {
        let rs = RedundancySettings::new(2, 4).unwrap();
        assert_eq!(rs.total(), 4);
        assert_eq!(rs.slab_size(), 2 * SECTOR_SIZE);
        assert_eq!(rs.redundancy(), 2.0);

        let rs = RedundancySettings::default();
        assert_eq!(rs.redundancy(), 3.0);
    }
}
