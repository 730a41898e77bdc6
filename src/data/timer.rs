//! Event-duration timing.

use crate::data::{Histogram, Meter};
use crate::snapshot::Snapshot;
use quanta::{Clock, Instant};

/// Times events: a histogram of durations (in milliseconds) plus a meter
/// of their occurrence rate.
pub struct Timer {
    histogram: Histogram,
    meter: Meter,
    clock: Clock,
}

impl Timer {
    pub fn new() -> Timer {
        Timer::with_clock(Clock::new())
    }

    pub fn with_clock(clock: Clock) -> Timer {
        Timer {
            histogram: Histogram::with_clock(clock.clone()),
            meter: Meter::with_clock(clock.clone()),
            clock,
        }
    }

    /// Records an event that lasted `duration_millis`.
    pub fn update_millis(&self, duration_millis: i64) {
        self.histogram.update(duration_millis);
        self.meter.mark();
    }

    /// Starts timing a scoped event; the duration is recorded when the
    /// returned context drops, on every exit path.
    pub fn time(&self) -> TimerContext<'_> {
        TimerContext { timer: self, start: self.clock.now() }
    }

    /// The number of recorded events (exact).
    pub fn count(&self) -> i64 {
        self.histogram.count()
    }

    /// The one-minute event rate, in events per second.
    pub fn one_minute_rate(&self) -> f64 {
        self.meter.one_minute_rate()
    }

    /// The five-minute event rate, in events per second.
    pub fn five_minute_rate(&self) -> f64 {
        self.meter.five_minute_rate()
    }

    /// The fifteen-minute event rate, in events per second.
    pub fn fifteen_minute_rate(&self) -> f64 {
        self.meter.fifteen_minute_rate()
    }

    /// A snapshot of the distribution of durations.
    pub fn snapshot(&self) -> Snapshot {
        self.histogram.snapshot()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Timer::new()
    }
}

/// An in-flight timed scope; see [`Timer::time`].
#[must_use = "dropping the context immediately records a zero-length event"]
pub struct TimerContext<'a> {
    timer: &'a Timer,
    start: Instant,
}

impl Drop for TimerContext<'_> {
    fn drop(&mut self) {
        let elapsed = self.timer.clock.now().duration_since(self.start);
        self.timer.update_millis(elapsed.as_millis() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::Timer;
    use quanta::Clock;
    use std::time::Duration;

    #[test]
    fn test_count_tracks_updates() {
        let timer = Timer::new();
        for i in 0..100 {
            timer.update_millis(i);
        }
        assert_eq!(timer.count(), 100);

        let snap = timer.snapshot();
        assert_eq!(snap.min(), 0);
        assert_eq!(snap.max(), 99);
    }

    #[test]
    fn test_scoped_timing_records_on_drop() {
        let (clock, mock) = Clock::mock();
        let timer = Timer::with_clock(clock);

        {
            let _scope = timer.time();
            mock.increment(Duration::from_millis(250));
        }

        assert_eq!(timer.count(), 1);
        assert_eq!(timer.snapshot().max(), 250);
    }

    #[test]
    fn test_scoped_timing_records_on_early_exit() {
        let (clock, mock) = Clock::mock();
        let timer = Timer::with_clock(clock);

        fn body(timer: &Timer, mock: &quanta::Mock, fail: bool) -> Result<(), ()> {
            let _scope = timer.time();
            mock.increment(Duration::from_millis(10));
            if fail {
                return Err(());
            }
            Ok(())
        }

        let _ = body(&timer, &mock, true);
        let _ = body(&timer, &mock, false);
        assert_eq!(timer.count(), 2);
    }

    #[test]
    fn test_rates_follow_meter() {
        let (clock, mock) = Clock::mock();
        let timer = Timer::with_clock(clock);

        for _ in 0..5 {
            timer.update_millis(1);
        }
        mock.increment(Duration::from_secs(5));
        assert_eq!(timer.one_minute_rate(), 1.0);
    }
}
