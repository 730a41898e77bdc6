//! An integral counter metric.

use crate::striped::StripedAdder;

/// A 64-bit signed counter.
///
/// Backed by a [`StripedAdder`], so heavily contended increments scale;
/// reads during concurrent writes may observe intermediate states, but
/// once writers quiesce [`value`](Counter::value) equals the sum of every
/// applied delta.
#[derive(Default)]
pub struct Counter {
    value: StripedAdder,
}

impl Counter {
    pub fn new() -> Counter {
        Counter { value: StripedAdder::new() }
    }

    /// Increments the counter by one.
    pub fn inc(&self) {
        self.update(1);
    }

    /// Decrements the counter by one.
    pub fn dec(&self) {
        self.update(-1);
    }

    /// Adds `delta` (which may be negative) to the counter.
    pub fn update(&self, delta: i64) {
        self.value.add(delta);
    }

    /// The current value.
    pub fn value(&self) -> i64 {
        self.value.value()
    }
}

#[cfg(test)]
mod tests {
    use super::Counter;

    #[test]
    fn test_counter_basics() {
        let counter = Counter::new();
        for _ in 0..1000 {
            counter.inc();
        }
        assert_eq!(counter.value(), 1000);

        counter.update(-500);
        assert_eq!(counter.value(), 500);

        counter.dec();
        assert_eq!(counter.value(), 499);
    }

    #[test]
    fn test_counter_concurrent_increments() {
        let counter = Counter::new();
        crossbeam_utils::thread::scope(|s| {
            for _ in 0..8 {
                let counter = &counter;
                s.spawn(move |_| {
                    for _ in 0..10_000 {
                        counter.inc();
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(counter.value(), 80_000);
    }
}
