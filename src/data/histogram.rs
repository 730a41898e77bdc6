//! Distribution tracking over a decaying reservoir.

use crate::reservoir::ExponentialReservoir;
use crate::snapshot::Snapshot;
use crate::striped::StripedAdder;
use quanta::Clock;

/// A histogram of observed values.
///
/// Values feed an [`ExponentialReservoir`], so
/// [`snapshot`](Histogram::snapshot) is a bounded, recency-biased sample;
/// [`count`](Histogram::count) is exact regardless -- only the sample set
/// is bounded, never the count.
pub struct Histogram {
    reservoir: ExponentialReservoir,
    count: StripedAdder,
}

impl Histogram {
    pub fn new() -> Histogram {
        Histogram::with_clock(Clock::new())
    }

    pub fn with_clock(clock: Clock) -> Histogram {
        Histogram { reservoir: ExponentialReservoir::with_clock(clock), count: StripedAdder::new() }
    }

    /// Records a value.
    pub fn update(&self, value: i64) {
        self.count.add(1);
        self.reservoir.update(value);
    }

    /// The number of recorded values.
    pub fn count(&self) -> i64 {
        self.count.value()
    }

    /// A snapshot of the sampled distribution.
    pub fn snapshot(&self) -> Snapshot {
        self.reservoir.snapshot()
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Histogram::new()
    }
}
