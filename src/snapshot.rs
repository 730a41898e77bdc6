//! Point-in-time views of a sampled distribution.

use std::error::Error;
use std::fmt;

/// Errors from [`Snapshot`] accessors.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotError {
    /// A quantile outside `[0, 1]` was requested.
    QuantileOutOfRange(f64),
}

impl Error for SnapshotError {}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::QuantileOutOfRange(q) => {
                write!(f, "quantile {} is outside [0, 1]", q)
            }
        }
    }
}

/// An immutable, sorted set of sampled values.
///
/// Scalar accessors return 0 on an empty snapshot.  Quantiles use R-7
/// (the default in R and S): the sample quantile at probability `q` over
/// `n` sorted values sits at position `q·(n+1)`, linearly interpolated
/// between neighbors.
#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    values: Vec<i64>,
}

impl Snapshot {
    /// Creates a snapshot from unordered values.
    pub fn new(mut values: Vec<i64>) -> Snapshot {
        values.sort_unstable();
        Snapshot { values }
    }

    /// Creates a snapshot from already-sorted values.
    pub fn from_sorted(values: Vec<i64>) -> Snapshot {
        debug_assert!(values.windows(2).all(|w| w[0] <= w[1]));
        Snapshot { values }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the snapshot holds no samples.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The smallest sample, or 0 if empty.
    pub fn min(&self) -> i64 {
        self.values.first().copied().unwrap_or(0)
    }

    /// The largest sample, or 0 if empty.
    pub fn max(&self) -> i64 {
        self.values.last().copied().unwrap_or(0)
    }

    /// The arithmetic mean, or 0 if empty.
    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let sum: i64 = self.values.iter().sum();
        sum as f64 / self.values.len() as f64
    }

    /// The sample standard deviation, or 0 for fewer than two samples.
    pub fn stdev(&self) -> f64 {
        // Welford's numerically stable online variance.  The variance
        // accumulator is integral, truncating each step's fractional
        // contribution; the quantization is negligible at metric scales
        // and keeps results stable across platforms.
        let mut n = 0i64;
        let mut varsum = 0i64;
        let mut mean = 0.0f64;
        for &value in &self.values {
            n += 1;
            let delta = value as f64 - mean;
            mean += delta / n as f64;
            varsum = (varsum as f64 + delta * (value as f64 - mean)) as i64;
        }

        if n < 2 {
            return 0.0;
        }

        (varsum as f64 / (n - 1) as f64).sqrt()
    }

    /// The median.
    pub fn median(&self) -> f64 {
        self.at(0.5)
    }

    /// The 75th percentile.
    pub fn p75(&self) -> f64 {
        self.at(0.75)
    }

    /// The 95th percentile.
    pub fn p95(&self) -> f64 {
        self.at(0.95)
    }

    /// The 99th percentile.
    pub fn p99(&self) -> f64 {
        self.at(0.99)
    }

    /// The 99.9th percentile.
    pub fn p999(&self) -> f64 {
        self.at(0.999)
    }

    /// The value of the distribution at `quantile ∈ [0, 1]`.
    pub fn value_at(&self, quantile: f64) -> Result<f64, SnapshotError> {
        if !(0.0..=1.0).contains(&quantile) {
            return Err(SnapshotError::QuantileOutOfRange(quantile));
        }
        Ok(self.at(quantile))
    }

    // R-7 interpolation over the sorted samples; `quantile` is known
    // valid here.
    fn at(&self, quantile: f64) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }

        let n = self.values.len();
        let idx = quantile * (n + 1) as f64;

        if idx < 1.0 {
            return self.values[0] as f64;
        }
        if idx >= n as f64 {
            return self.values[n - 1] as f64;
        }

        let lower = self.values[idx as usize - 1] as f64;
        let upper = self.values[idx as usize] as f64;
        lower + (idx - idx.floor()) * (upper - lower)
    }
}
