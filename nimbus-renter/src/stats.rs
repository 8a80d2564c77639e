//! Sliding window statistics
//!
//! Uploaders and the manager keep a small ring of recent samples and
//! use its 90th percentile as a load-aware placement metric. The ring
//! does not distinguish warm from cold: unfilled slots count as zero,
//! which keeps untried uploaders deprioritized until they have a track
//! record.

use parking_lot::Mutex;

/// Number of samples kept per window
pub const STATS_WINDOW: usize = 20;

struct Inner {
    samples: Vec<f64>,
    cnt: usize,
    p90: f64,
}

/// A fixed-capacity ring of samples with a cached p90
pub struct DataPoints {
    inner: Mutex<Inner>,
}

impl DataPoints {
    /// Create a window holding `capacity` samples, all initially zero
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                samples: vec![0.0; capacity],
                cnt: 0,
                p90: 0.0,
            }),
        }
    }

    /// Insert a sample, overwriting the oldest once the ring is full
    pub fn track(&self, sample: f64) {
        let mut inner = self.inner.lock();
        let capacity = inner.samples.len();
        let slot = inner.cnt % capacity;
        inner.samples[slot] = sample;
        inner.cnt += 1;
    }

    /// Recompute the p90 over the window, cache it, and return it
    pub fn recompute(&self) -> f64 {
        let mut inner = self.inner.lock();
        inner.p90 = percentile(&inner.samples, 90.0);
        inner.p90
    }

    /// The cached p90, as of the last [`DataPoints::recompute`]
    pub fn p90(&self) -> f64 {
        self.inner.lock().p90
    }
}

/// Rank-interpolated percentile: the mean of the two samples straddling
/// an integral rank, the sample at the ceiling rank otherwise. An empty
/// sample set yields 0.
fn percentile(samples: &[f64], pct: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    if pct >= 100.0 {
        return sorted[sorted.len() - 1];
    }

    let rank = pct / 100.0 * sorted.len() as f64;
    let floor = rank.floor();
    if rank == floor {
        let i = rank as usize;
        if i == 0 {
            return sorted[0];
        }
        if i >= sorted.len() {
            return sorted[sorted.len() - 1];
        }
        (sorted[i - 1] + sorted[i]) / 2.0
    } else {
        sorted[(rank.ceil() as usize).min(sorted.len()) - 1]
    }
}
