//! Error types for Nimbus core operations.

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, NimbusError>;

/// Unified error type for the core data model and codec
#[derive(Error, Debug)]
pub enum NimbusError {
    // ===== Erasure Coding Errors =====
    #[error("erasure coding error: {0}")]
    ErasureCoding(String),

    #[error("insufficient shards: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    #[error("shard size mismatch: expected {expected}, got {actual}")]
    ShardSizeMismatch { expected: usize, actual: usize },

    #[error("shard data ends before the requested region")]
    ShortData,

    // ===== Cryptography Errors =====
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    // ===== Identifier Errors =====
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    // ===== I/O Errors =====
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reed_solomon_erasure::Error> for NimbusError {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        NimbusError::ErasureCoding(err.to_string())
    }
}
