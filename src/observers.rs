//! Rendering registered metrics for export.
//!
//! An [`Observer`] receives one callback per metric; a [`Drain`] yields
//! whatever the observer rendered.  Exporters mint a fresh observer per
//! reporting turn through an [`ObserverBuilder`], drive it with
//! [`MetricRegistry::observe`](crate::registry::MetricRegistry::observe),
//! and drain the output.

use crate::snapshot::Snapshot;
use serde_json::{json, Map, Value};
use std::fmt::Write;

/// Receives metric readings, one callback per metric.
pub trait Observer {
    fn observe_counter(&mut self, name: &str, value: i64);

    /// `rates` are the one-, five-, and fifteen-minute rates in events
    /// per second.
    fn observe_meter(&mut self, name: &str, one_minute: f64, five_minute: f64, fifteen_minute: f64);

    fn observe_timer(&mut self, name: &str, count: i64, rates: (f64, f64, f64), snapshot: &Snapshot);
}

/// Yields the rendered output of an observer, resetting it.
pub trait Drain<T> {
    fn drain(&mut self) -> T;
}

/// Mints fresh observers, one per reporting turn.
pub trait ObserverBuilder {
    type Output: Observer;

    fn build(&self) -> Self::Output;
}

/// Builder for [`TextObserver`].
#[derive(Default)]
pub struct TextBuilder;

impl TextBuilder {
    pub fn new() -> TextBuilder {
        TextBuilder
    }
}

impl ObserverBuilder for TextBuilder {
    type Output = TextObserver;

    fn build(&self) -> TextObserver {
        TextObserver::default()
    }
}

const KEY_WIDTH: usize = 20;
const BANNER_WIDTH: usize = 79;

/// Renders metrics as a banner-sectioned text table, one section per kind.
#[derive(Default)]
pub struct TextObserver {
    counters: String,
    meters: String,
    timers: String,
}

fn put_line(out: &mut String, key: &str, value: impl std::fmt::Display) {
    // Infallible for String; keeps the formatting in one place.
    let _ = writeln!(out, "{key:>KEY_WIDTH$} = {value}");
}

impl Observer for TextObserver {
    fn observe_counter(&mut self, name: &str, value: i64) {
        let _ = writeln!(self.counters, "{name}");
        put_line(&mut self.counters, "count", value);
    }

    fn observe_meter(&mut self, name: &str, one_minute: f64, five_minute: f64, fifteen_minute: f64) {
        let _ = writeln!(self.meters, "{name}");
        put_line(&mut self.meters, "1m rate", format!("{one_minute:.2}/s"));
        put_line(&mut self.meters, "5m rate", format!("{five_minute:.2}/s"));
        put_line(&mut self.meters, "15m rate", format!("{fifteen_minute:.2}/s"));
    }

    fn observe_timer(&mut self, name: &str, count: i64, rates: (f64, f64, f64), snapshot: &Snapshot) {
        let _ = writeln!(self.timers, "{name}");
        put_line(&mut self.timers, "count", count);
        put_line(&mut self.timers, "1m rate", format!("{:.2}/s", rates.0));
        put_line(&mut self.timers, "5m rate", format!("{:.2}/s", rates.1));
        put_line(&mut self.timers, "15m rate", format!("{:.2}/s", rates.2));
        put_line(&mut self.timers, "min", format!("{} ms", snapshot.min()));
        put_line(&mut self.timers, "max", format!("{} ms", snapshot.max()));
        put_line(&mut self.timers, "mean", format!("{:.2} ms", snapshot.mean()));
        put_line(&mut self.timers, "stdev", format!("{:.2} ms", snapshot.stdev()));
        put_line(&mut self.timers, "median", format!("{:.2} ms", snapshot.median()));
        put_line(&mut self.timers, "p75", format!("{:.2} ms", snapshot.p75()));
        put_line(&mut self.timers, "p95", format!("{:.2} ms", snapshot.p95()));
        put_line(&mut self.timers, "p99", format!("{:.2} ms", snapshot.p99()));
        put_line(&mut self.timers, "p999", format!("{:.2} ms", snapshot.p999()));
    }
}

impl Drain<String> for TextObserver {
    fn drain(&mut self) -> String {
        fn banner(out: &mut String, title: &str, body: &str) {
            if body.is_empty() {
                return;
            }
            let _ = writeln!(out, "-- {title} {:-<1$}", "", BANNER_WIDTH.saturating_sub(title.len() + 4));
            out.push_str(body);
        }

        let mut out = String::new();
        banner(&mut out, "Counters", &self.counters);
        banner(&mut out, "Meters", &self.meters);
        banner(&mut out, "Timers", &self.timers);
        self.counters.clear();
        self.meters.clear();
        self.timers.clear();
        out
    }
}

/// Builder for [`JsonObserver`].
pub struct JsonBuilder {
    pretty: bool,
}

impl JsonBuilder {
    pub fn new() -> JsonBuilder {
        JsonBuilder { pretty: false }
    }

    /// Render indented, multi-line JSON instead of the compact form.
    pub fn set_pretty(mut self, pretty: bool) -> JsonBuilder {
        self.pretty = pretty;
        self
    }
}

impl Default for JsonBuilder {
    fn default() -> Self {
        JsonBuilder::new()
    }
}

impl ObserverBuilder for JsonBuilder {
    type Output = JsonObserver;

    fn build(&self) -> JsonObserver {
        JsonObserver {
            pretty: self.pretty,
            counters: Map::new(),
            meters: Map::new(),
            timers: Map::new(),
        }
    }
}

/// Renders metrics as a JSON document with one object per metric kind.
pub struct JsonObserver {
    pretty: bool,
    counters: Map<String, Value>,
    meters: Map<String, Value>,
    timers: Map<String, Value>,
}

impl Observer for JsonObserver {
    fn observe_counter(&mut self, name: &str, value: i64) {
        self.counters.insert(name.to_string(), Value::from(value));
    }

    fn observe_meter(&mut self, name: &str, one_minute: f64, five_minute: f64, fifteen_minute: f64) {
        self.meters.insert(
            name.to_string(),
            json!({
                "one_minute_rate": one_minute,
                "five_minute_rate": five_minute,
                "fifteen_minute_rate": fifteen_minute,
            }),
        );
    }

    fn observe_timer(&mut self, name: &str, count: i64, rates: (f64, f64, f64), snapshot: &Snapshot) {
        self.timers.insert(
            name.to_string(),
            json!({
                "count": count,
                "one_minute_rate": rates.0,
                "five_minute_rate": rates.1,
                "fifteen_minute_rate": rates.2,
                "min": snapshot.min(),
                "max": snapshot.max(),
                "mean": snapshot.mean(),
                "stdev": snapshot.stdev(),
                "median": snapshot.median(),
                "p75": snapshot.p75(),
                "p95": snapshot.p95(),
                "p99": snapshot.p99(),
                "p999": snapshot.p999(),
            }),
        );
    }
}

impl Drain<String> for JsonObserver {
    fn drain(&mut self) -> String {
        let document = json!({
            "counters": Value::Object(std::mem::take(&mut self.counters)),
            "meters": Value::Object(std::mem::take(&mut self.meters)),
            "timers": Value::Object(std::mem::take(&mut self.timers)),
        });
        let result = if self.pretty {
            serde_json::to_string_pretty(&document)
        } else {
            serde_json::to_string(&document)
        };
        result.expect("failed to render json output")
    }
}

#[cfg(test)]
mod tests {
    use super::{Drain, JsonBuilder, Observer, ObserverBuilder, TextBuilder};
    use crate::snapshot::Snapshot;

    #[test]
    fn test_text_observer_renders_sections() {
        let mut observer = TextBuilder::new().build();
        observer.observe_counter("requests", 42);
        observer.observe_meter("arrivals", 1.0, 2.0, 3.0);
        observer.observe_timer(
            "latency",
            7,
            (0.5, 0.25, 0.125),
            &Snapshot::new(vec![5, 10, 15]),
        );

        let output = observer.drain();
        assert!(output.contains("-- Counters"));
        assert!(output.contains("requests"));
        assert!(output.contains("count = 42"));
        assert!(output.contains("-- Meters"));
        assert!(output.contains("1m rate = 1.00/s"));
        assert!(output.contains("-- Timers"));
        assert!(output.contains("max = 15 ms"));

        // Draining resets the observer.
        assert!(observer.drain().is_empty());
    }

    #[test]
    fn test_text_observer_skips_empty_sections() {
        let mut observer = TextBuilder::new().build();
        observer.observe_counter("only", 1);
        let output = observer.drain();
        assert!(output.contains("-- Counters"));
        assert!(!output.contains("-- Meters"));
        assert!(!output.contains("-- Timers"));
    }

    #[test]
    fn test_json_observer_output_parses() {
        let mut observer = JsonBuilder::new().build();
        observer.observe_counter("requests", 42);
        observer.observe_meter("arrivals", 1.0, 2.0, 3.0);
        observer.observe_timer(
            "latency",
            7,
            (0.5, 0.25, 0.125),
            &Snapshot::new(vec![5, 10, 15]),
        );

        let output = observer.drain();
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed["counters"]["requests"], 42);
        assert_eq!(parsed["meters"]["arrivals"]["five_minute_rate"], 2.0);
        assert_eq!(parsed["timers"]["latency"]["count"], 7);
        assert_eq!(parsed["timers"]["latency"]["max"], 15);
    }

    #[test]
    fn test_json_pretty_round_trips() {
        let mut observer = JsonBuilder::new().set_pretty(true).build();
        observer.observe_counter("a", 1);
        let output = observer.drain();
        assert!(output.contains('\n'));
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed["counters"]["a"], 1);
    }
}
