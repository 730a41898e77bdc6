//! The user-facing metric types.

mod counter;
mod histogram;
mod meter;
mod timer;

pub use counter::Counter;
pub use histogram::Histogram;
pub use meter::Meter;
pub use timer::{Timer, TimerContext};
