//! Exponentially weighted moving average of a rate.

use crate::striped::StripedAdder;
use quanta::{Clock, Instant};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// The fixed tick interval.
pub const TICK_INTERVAL: Duration = Duration::from_secs(5);

const TICK_NANOS: u64 = 5_000_000_000;

/// Smoothing factor for a rate averaged over `window_minutes` minutes at
/// the fixed five-second tick.
pub fn alpha(window_minutes: f64) -> f64 {
    1.0 - (-(TICK_INTERVAL.as_secs_f64()) / 60.0 / window_minutes).exp()
}

/// An exponentially weighted moving average over a time window (not over a
/// sample count), in events per second.
///
/// Updates are buffered in a [`StripedAdder`] and folded in on five-second
/// ticks.  If no tick-driving method is called for more than one interval,
/// the next call runs every missed tick, decaying the rate.
pub struct RateEwma {
    alpha: f64,
    buffer: StripedAdder,
    // f64 bits; see rate()/tick().
    rate: AtomicU64,
    init: AtomicBool,
    // Nanoseconds since `origin`.
    last_tick: AtomicU64,
    clock: Clock,
    origin: Instant,
}

impl RateEwma {
    pub fn new(alpha: f64, clock: Clock) -> RateEwma {
        let origin = clock.now();
        RateEwma {
            alpha,
            buffer: StripedAdder::new(),
            rate: AtomicU64::new(0f64.to_bits()),
            init: AtomicBool::new(false),
            last_tick: AtomicU64::new(0),
            clock,
            origin,
        }
    }

    fn now_nanos(&self) -> u64 {
        self.clock.now().duration_since(self.origin).as_nanos() as u64
    }

    /// Updates the average with `n` new events.
    pub fn update(&self, n: i64) {
        self.buffer.add(n);
        self.tick_if_necessary();
    }

    /// Returns the rate in events per second, as of the last completed
    /// tick.
    pub fn rate(&self) -> f64 {
        self.tick_if_necessary();
        f64::from_bits(self.rate.load(Ordering::Acquire))
    }

    fn tick_if_necessary(&self) {
        let now = self.now_nanos();
        let prev = self.last_tick.load(Ordering::Acquire);
        let elapsed = now.saturating_sub(prev);
        if elapsed < TICK_NANOS {
            return;
        }

        if self
            .last_tick
            .compare_exchange(prev, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another caller is ticking.
            return;
        }

        for _ in 0..elapsed / TICK_NANOS {
            self.tick();
        }
    }

    pub(crate) fn tick(&self) {
        // Writers racing the sweep can slide an event into the next tick;
        // acknowledged, as designed.
        let uncounted = self.buffer.take();
        let instant = uncounted as f64 / TICK_INTERVAL.as_secs_f64();

        if self.init.load(Ordering::Acquire) {
            let mut current = self.rate.load(Ordering::Acquire);
            loop {
                let rate = f64::from_bits(current);
                let next = rate + self.alpha * (instant - rate);
                match self.rate.compare_exchange_weak(
                    current,
                    next.to_bits(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }
        } else {
            self.rate.store(instant.to_bits(), Ordering::Release);
            self.init.store(true, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{alpha, RateEwma, TICK_INTERVAL};
    use quanta::Clock;
    use std::time::Duration;

    #[test]
    fn test_rate_after_single_interval() {
        let (clock, mock) = Clock::mock();
        let ewma = RateEwma::new(alpha(1.0), clock);

        ewma.update(1);
        mock.increment(TICK_INTERVAL);
        assert_eq!(ewma.rate(), 1.0 / TICK_INTERVAL.as_secs_f64());
    }

    #[test]
    fn test_rate_holds_with_steady_load() {
        let (clock, mock) = Clock::mock();
        let ewma = RateEwma::new(alpha(1.0), clock);

        ewma.update(1);
        mock.increment(TICK_INTERVAL);
        let first = ewma.rate();

        ewma.update(1);
        mock.increment(TICK_INTERVAL);
        assert_eq!(ewma.rate(), first);
    }

    #[test]
    fn test_rate_decays_when_idle() {
        let (clock, mock) = Clock::mock();
        let ewma = RateEwma::new(alpha(1.0), clock);

        ewma.update(1);
        mock.increment(TICK_INTERVAL);
        let initial = ewma.rate();
        assert!(initial > 0.0);

        // Ten idle intervals, applied in one catch-up.
        mock.increment(Duration::from_secs(50));
        let decayed = ewma.rate();
        assert!(decayed < initial);
        assert!(decayed > 0.0);

        mock.increment(Duration::from_secs(50));
        assert!(ewma.rate() < decayed);
    }

    #[test]
    fn test_rate_zero_without_events() {
        let (clock, mock) = Clock::mock();
        let ewma = RateEwma::new(alpha(5.0), clock);

        assert_eq!(ewma.rate(), 0.0);
        mock.increment(Duration::from_secs(60));
        assert_eq!(ewma.rate(), 0.0);
    }

    #[test]
    fn test_alphas_are_ordered() {
        // Wider windows smooth harder.
        assert!(alpha(1.0) > alpha(5.0));
        assert!(alpha(5.0) > alpha(15.0));
        assert!(alpha(15.0) > 0.0);
        assert!(alpha(1.0) < 1.0);
    }
}
