//! Event-rate metering.

use crate::ewma::{alpha, RateEwma};
use quanta::Clock;

/// Tracks exponentially weighted moving averages of an event rate over
/// one-, five-, and fifteen-minute windows -- UNIX load average, basically.
pub struct Meter {
    one_minute: RateEwma,
    five_minute: RateEwma,
    fifteen_minute: RateEwma,
}

impl Meter {
    pub fn new() -> Meter {
        Meter::with_clock(Clock::new())
    }

    /// Creates a meter driven by `clock`; registries pass their own clock
    /// through here, and tests pass a mock.
    pub fn with_clock(clock: Clock) -> Meter {
        Meter {
            one_minute: RateEwma::new(alpha(1.0), clock.clone()),
            five_minute: RateEwma::new(alpha(5.0), clock.clone()),
            fifteen_minute: RateEwma::new(alpha(15.0), clock),
        }
    }

    /// Marks that an event occurred.
    pub fn mark(&self) {
        self.mark_n(1);
    }

    /// Marks that `n` events occurred.
    pub fn mark_n(&self, n: i64) {
        self.one_minute.update(n);
        self.five_minute.update(n);
        self.fifteen_minute.update(n);
    }

    /// The one-minute rate, in events per second.
    pub fn one_minute_rate(&self) -> f64 {
        self.one_minute.rate()
    }

    /// The five-minute rate, in events per second.
    pub fn five_minute_rate(&self) -> f64 {
        self.five_minute.rate()
    }

    /// The fifteen-minute rate, in events per second.
    pub fn fifteen_minute_rate(&self) -> f64 {
        self.fifteen_minute.rate()
    }
}

impl Default for Meter {
    fn default() -> Self {
        Meter::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Meter;
    use quanta::Clock;
    use std::time::Duration;

    #[test]
    fn test_meter_without_events_is_zero() {
        let meter = Meter::new();
        assert_eq!(meter.one_minute_rate(), 0.0);
        assert_eq!(meter.five_minute_rate(), 0.0);
        assert_eq!(meter.fifteen_minute_rate(), 0.0);
    }

    #[test]
    fn test_meter_rates_reflect_marks() {
        let (clock, mock) = Clock::mock();
        let meter = Meter::with_clock(clock);

        meter.mark_n(5);
        mock.increment(Duration::from_secs(5));

        // One tick: every window sees the same instant rate.
        assert_eq!(meter.one_minute_rate(), 1.0);
        assert_eq!(meter.five_minute_rate(), 1.0);
        assert_eq!(meter.fifteen_minute_rate(), 1.0);
    }

    #[test]
    fn test_meter_decay_orders_by_window() {
        let (clock, mock) = Clock::mock();
        let meter = Meter::with_clock(clock);

        meter.mark_n(10);
        mock.increment(Duration::from_secs(5));
        assert!(meter.one_minute_rate() > 0.0);

        // A minute of silence: the shortest window decays hardest.
        mock.increment(Duration::from_secs(60));
        let one = meter.one_minute_rate();
        let five = meter.five_minute_rate();
        let fifteen = meter.fifteen_minute_rate();
        assert!(one < five);
        assert!(five < fifteen);
        assert!(one > 0.0);
    }
}
