//! Periodic metric export.
//!
//! Exporters pull: on each turn they mint an observer, drive it across the
//! registry, and emit the drained output somewhere.  `run` blocks the
//! calling thread and reports on an interval; callers wanting a background
//! reporter spawn a thread around it.

use crate::observers::{Drain, Observer, ObserverBuilder, TextBuilder};
use crate::registry::MetricRegistry;
use log::{log, Level};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Exports metrics by rendering them to text and logging the result via
/// the `log` crate.
pub struct LogExporter<B> {
    registry: Arc<MetricRegistry>,
    builder: B,
    level: Level,
}

impl<B> LogExporter<B>
where
    B: ObserverBuilder,
    B::Output: Observer + Drain<String>,
{
    /// Creates a new [`LogExporter`] that logs at `level`.
    pub fn new(registry: Arc<MetricRegistry>, builder: B, level: Level) -> LogExporter<B> {
        LogExporter { registry, builder, level }
    }

    /// Runs this exporter on the current thread, logging output on the
    /// given interval.
    pub fn run(&mut self, interval: Duration) {
        loop {
            thread::sleep(interval);
            self.turn();
        }
    }

    /// Reports once.
    pub fn turn(&self) {
        let mut observer = self.builder.build();
        self.registry.observe(&mut observer);
        log!(self.level, "{}", observer.drain());
    }
}

/// Exports metrics to standard output as a text table.
pub struct ConsoleExporter {
    registry: Arc<MetricRegistry>,
    builder: TextBuilder,
}

impl ConsoleExporter {
    pub fn new(registry: Arc<MetricRegistry>) -> ConsoleExporter {
        ConsoleExporter { registry, builder: TextBuilder::new() }
    }

    /// Runs this exporter on the current thread, printing on the given
    /// interval.
    pub fn run(&mut self, interval: Duration) {
        loop {
            thread::sleep(interval);
            self.turn();
        }
    }

    /// Prints one report.
    pub fn turn(&self) {
        let mut observer = self.builder.build();
        self.registry.observe(&mut observer);
        println!("{}", observer.drain());
    }
}
