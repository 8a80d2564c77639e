//! Error types for the upload engine

use nimbus_core::PublicKey;
use std::fmt;
use thiserror::Error;

/// Errors returned by host implementations (providers, sector uploaders
/// and revision lockers).
#[derive(Error, Debug)]
pub enum HostClientError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("sector upload failed: {0}")]
    UploadFailed(String),

    #[error("timed out fetching the contract revision")]
    LockTimeout,

    /// The host closed the stream without an error. Reported as a shard
    /// failure but kept out of the uploader's statistics.
    #[error("stream gracefully closed")]
    StreamClosed,

    /// The request's context was cancelled mid-flight.
    #[error("sector upload cancelled")]
    Cancelled,
}

/// A failure attributed to a specific host
#[derive(Error, Debug)]
#[error("host {host}: {err}")]
pub struct HostError {
    /// The host the failure is attributed to
    pub host: PublicKey,

    /// The underlying failure
    #[source]
    pub err: HostClientError,
}

/// The set of host failures collected while uploading one slab
#[derive(Debug, Default)]
pub struct HostErrorSet(pub Vec<HostError>);

impl HostErrorSet {
    /// Record a failure
    pub fn push(&mut self, err: HostError) {
        self.0.push(err);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for HostErrorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} host errors: [", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", err)?;
        }
        write!(f, "]")
    }
}

/// Errors returned by the upload engine
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("not enough uploaders to support requested redundancy: have {available}, need {required}")]
    NotEnoughUploaders { available: usize, required: usize },

    /// All candidate uploaders were filtered out for a shard. Transient:
    /// the coordinator retries or waits for capacity.
    #[error("no free uploader")]
    NoFreeUploader,

    #[error(
        "failed to upload slab: remaining={remaining}, inflight={inflight}, \
         launched={launched}, uploaders={uploaders}, errors={errs}"
    )]
    SlabUploadFailed {
        remaining: usize,
        inflight: u64,
        launched: u64,
        uploaders: usize,
        errs: HostErrorSet,
    },

    #[error("invalid redundancy settings: {0}")]
    InvalidRedundancy(String),

    #[error("upload manager was stopped")]
    Stopped,

    #[error("upload was cancelled")]
    Cancelled,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
