//! High-speed in-process metrics collection.
//!
//! `tally` captures three families of observations -- [`Counter`]s for
//! monotonic or bidirectional totals, [`Meter`]s for event rates, and
//! [`Timer`]s for event durations -- and exposes aggregate summaries
//! (counts, exponentially weighted rates, quantile [`Snapshot`]s) for
//! periodic export.
//!
//! # Design
//!
//! The interesting part is underneath the façades: every hot-path update
//! is lock-free.
//!
//! * Counters accumulate in a [`StripedAdder`], which starts as a single
//!   atomic and stripes itself across cache-padded slots on first
//!   contention, in the LongAdder tradition.
//! * Timers sample durations into an [`ExponentialReservoir`] -- a
//!   forward-decay priority sample over a concurrent [`SkipListMap`] --
//!   so snapshots are bounded in memory but biased toward recent events.
//! * Meters fold events into fixed five-second [`RateEwma`] ticks for
//!   one/five/fifteen-minute windows.
//!
//! Shared structures reclaim memory through hazard pointers
//! ([`smr::HazardDomain`]) rather than locks or reference counts; see the
//! module docs for the protocol.
//!
//! Blocking is confined to the edges: registry lookups, reservoir
//! snapshot/rescale coordination, and thread-local bookkeeping take short
//! mutexes; nothing on an update path does.
//!
//! # Using the registry
//!
//! ```rust
//! use tally::MetricRegistry;
//!
//! let registry = MetricRegistry::new();
//!
//! let requests = registry.counter("server.requests");
//! requests.inc();
//!
//! let latency = registry.timer("server.latency_ms");
//! {
//!     let _scope = latency.time();
//!     // ... handle a request ...
//! }
//! latency.update_millis(12);
//!
//! assert_eq!(requests.value(), 1);
//! assert_eq!(latency.count(), 2);
//! let snapshot = latency.snapshot();
//! assert!(snapshot.max() >= snapshot.min());
//! ```
//!
//! Handles are `Arc`s: look a metric up once, keep the handle where the
//! updates happen.
//!
//! # Exporting
//!
//! A reporter periodically walks the registry through an
//! [`observers::Observer`] and emits the rendered output -- see
//! [`exporters::LogExporter`] and [`exporters::ConsoleExporter`], and the
//! text/JSON observers in [`observers`].
//!
//! # Consistency caveats
//!
//! Counter reads concurrent with writes are not linearizable: a read can
//! miss in-flight updates, landing anywhere between the minimum and
//! maximum plausible sum over its window.  Rates reflect the last
//! completed tick.  These are the intended trades for update throughput;
//! once writers quiesce, every read is exact.

pub mod data;
pub mod ewma;
pub mod exporters;
mod marked;
pub mod observers;
pub mod random;
pub mod registry;
pub mod reservoir;
pub mod skiplist;
pub mod smr;
pub mod snapshot;
pub mod striped;
pub mod tls;

pub use data::{Counter, Histogram, Meter, Timer, TimerContext};
pub use ewma::RateEwma;
pub use registry::MetricRegistry;
pub use reservoir::ExponentialReservoir;
pub use skiplist::SkipListMap;
pub use snapshot::{Snapshot, SnapshotError};
pub use striped::StripedAdder;
