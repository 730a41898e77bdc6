//! The name-to-metric registry.

use crate::data::{Counter, Meter, Timer};
use crate::observers::Observer;
use parking_lot::Mutex;
use quanta::Clock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

// Lookups are by hash; enumeration sorts on the way out.
struct MetricMap<T> {
    metrics: Mutex<HashMap<String, Arc<T>>>,
}

impl<T> MetricMap<T> {
    fn new() -> MetricMap<T> {
        MetricMap { metrics: Mutex::new(HashMap::new()) }
    }

    fn get_or_create(&self, name: &str, create: impl FnOnce() -> T) -> Arc<T> {
        let mut metrics = self.metrics.lock();
        if let Some(existing) = metrics.get(name) {
            return Arc::clone(existing);
        }
        let created = Arc::new(create());
        metrics.insert(name.to_string(), Arc::clone(&created));
        created
    }

    fn sorted(&self) -> BTreeMap<String, Arc<T>> {
        self.metrics.lock().iter().map(|(name, metric)| (name.clone(), Arc::clone(metric))).collect()
    }
}

/// Creates and retains metrics by name.
///
/// Each accessor returns the existing metric for a name or lazily creates
/// one; metrics live for the registry's lifetime and are never removed.
/// Handles are `Arc`s, so callers typically look a metric up once and keep
/// the handle on their hot path.
pub struct MetricRegistry {
    counters: MetricMap<Counter>,
    meters: MetricMap<Meter>,
    timers: MetricMap<Timer>,
    clock: Clock,
}

impl MetricRegistry {
    pub fn new() -> MetricRegistry {
        MetricRegistry::with_clock(Clock::new())
    }

    /// Creates a registry whose meters and timers are driven by `clock`.
    pub fn with_clock(clock: Clock) -> MetricRegistry {
        MetricRegistry {
            counters: MetricMap::new(),
            meters: MetricMap::new(),
            timers: MetricMap::new(),
            clock,
        }
    }

    /// Returns the counter registered under `name`, creating it if needed.
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        self.counters.get_or_create(name, Counter::new)
    }

    /// Returns the meter registered under `name`, creating it if needed.
    pub fn meter(&self, name: &str) -> Arc<Meter> {
        let clock = self.clock.clone();
        self.meters.get_or_create(name, move || Meter::with_clock(clock))
    }

    /// Returns the timer registered under `name`, creating it if needed.
    pub fn timer(&self, name: &str) -> Arc<Timer> {
        let clock = self.clock.clone();
        self.timers.get_or_create(name, move || Timer::with_clock(clock))
    }

    /// All registered counters, in name order.
    pub fn counters(&self) -> BTreeMap<String, Arc<Counter>> {
        self.counters.sorted()
    }

    /// All registered meters, in name order.
    pub fn meters(&self) -> BTreeMap<String, Arc<Meter>> {
        self.meters.sorted()
    }

    /// All registered timers, in name order.
    pub fn timers(&self) -> BTreeMap<String, Arc<Timer>> {
        self.timers.sorted()
    }

    /// Drives `observer` across every registered metric, in name order
    /// within each kind.
    pub fn observe<O: Observer>(&self, observer: &mut O) {
        for (name, counter) in self.counters() {
            observer.observe_counter(&name, counter.value());
        }
        for (name, meter) in self.meters() {
            observer.observe_meter(
                &name,
                meter.one_minute_rate(),
                meter.five_minute_rate(),
                meter.fifteen_minute_rate(),
            );
        }
        for (name, timer) in self.timers() {
            observer.observe_timer(
                &name,
                timer.count(),
                (timer.one_minute_rate(), timer.five_minute_rate(), timer.fifteen_minute_rate()),
                &timer.snapshot(),
            );
        }
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        MetricRegistry::new()
    }
}
