//! Exponential-decay sampling reservoir.
//!
//! A forward-decay priority sample [Cormode et al.]: each observation is
//! ranked by `w / u`, where `w = exp(alpha * age_of_landmark)` grows
//! exponentially with time since a landmark and `u` is uniform in
//! `(0, 1]`, and the reservoir keeps the top `SIZE` ranks in a concurrent
//! skip list keyed by rank.  The result is a bounded sample biased toward
//! recent observations.
//!
//! Weights grow without bound against a fixed landmark, so once an hour
//! the reservoir swaps in a fresh generation with a new landmark and
//! rescales the surviving priorities by `exp(-alpha * delta)`.  Relative
//! ranks are unchanged by the rescale, keeping the sampling consistent
//! across the boundary.  Updates that raced the swap into the dying
//! generation can be skipped; a small correlated loss at an hourly
//! boundary is acceptable for a sampling reservoir.

use crate::random;
use crate::skiplist::SkipListMap;
use crate::smr::{HazardDomain, HazardSlot};
use crate::snapshot::Snapshot;
use ordered_float::OrderedFloat;
use parking_lot::Mutex;
use quanta::{Clock, Instant};
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

/// Decay factor, weighted toward roughly the trailing five minutes.
const ALPHA: f64 = 0.015;

/// Reservoir capacity.
const SIZE: usize = 1028;

const RESCALE_NANOS: u64 = 3_600_000_000_000;

struct Data {
    // priority -> value, ordered so the lowest-ranked sample is first out.
    map: SkipListMap<OrderedFloat<f64>, i64>,
    // Monotone update sequencer.  Never decremented on eviction, so it
    // must not be read as the map's cardinality.
    count: AtomicUsize,
    // Nanoseconds since the reservoir's origin.
    landmark: u64,
}

impl Data {
    fn new(landmark: u64) -> Data {
        Data { map: SkipListMap::new(), count: AtomicUsize::new(0), landmark }
    }
}

// Generations are all of one type; a single domain serves every reservoir.
fn data_domain() -> &'static HazardDomain<Data> {
    static DOMAIN: OnceLock<HazardDomain<Data>> = OnceLock::new();
    DOMAIN.get_or_init(HazardDomain::new)
}

/// A bounded sample of recent observations, decayed exponentially.
pub struct ExponentialReservoir {
    data: AtomicPtr<Data>,
    // Nanosecond offset of the next rescale.
    next_scale: AtomicU64,
    // Coordinates rescaling and snapshots, neither of which is on the
    // fast path.
    rescale_snap_mutex: Mutex<()>,
    clock: Clock,
    origin: Instant,
}

impl ExponentialReservoir {
    pub fn new() -> ExponentialReservoir {
        ExponentialReservoir::with_clock(Clock::new())
    }

    pub fn with_clock(clock: Clock) -> ExponentialReservoir {
        let origin = clock.now();
        ExponentialReservoir {
            data: AtomicPtr::new(Box::into_raw(Box::new(Data::new(0)))),
            next_scale: AtomicU64::new(RESCALE_NANOS),
            rescale_snap_mutex: Mutex::new(()),
            clock,
            origin,
        }
    }

    fn now_nanos(&self) -> u64 {
        self.clock.now().duration_since(self.origin).as_nanos() as u64
    }

    /// Records an observation.
    pub fn update(&self, value: i64) {
        let now = self.now_nanos();
        let slot = data_domain().slot();

        let next = self.next_scale.load(Ordering::Acquire);
        let data_ptr =
            if now > next { self.rescale(slot, now, next) } else { slot.protect(&self.data, 0) };
        // SAFETY: pinned by hazard 0 (the rescale winner pins the fresh
        // generation before publishing it).
        let data = unsafe { &*data_ptr };

        // Signed difference: a racing rescale can hand us a generation
        // whose landmark is past our `now` reading.
        let delta = (now as i64 - data.landmark as i64) as f64 / 1e9;
        let priority = (ALPHA * delta).exp() / random::next_double();
        Self::insert_weighted(data, priority, value);

        slot.clear_hazard(0);
    }

    // The shared eviction rule: admit unconditionally until the sequencer
    // passes capacity, then admit only ranks beating the current minimum,
    // evicting one entry per admission.
    fn insert_weighted(data: &Data, priority: f64, value: i64) {
        let priority = OrderedFloat(priority);
        if data.count.fetch_add(1, Ordering::Relaxed) < SIZE {
            data.map.insert(priority, value);
        } else {
            let mut first = data.map.first_key();
            if first < priority && data.map.insert(priority, value) {
                // Concurrent admissions race to evict the same minimum;
                // chase it until one erase lands.
                while !data.map.remove(&first) {
                    first = data.map.first_key();
                }
            }
        }
    }

    fn rescale(&self, slot: &HazardSlot<Data, 1>, now: u64, observed: u64) -> *mut Data {
        if self
            .next_scale
            .compare_exchange(
                observed,
                observed + RESCALE_NANOS,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Lost the election; whoever won does the work.
            return slot.protect(&self.data, 0);
        }

        // We are the rescaler: hold snapshots off while the generations
        // swap.
        let _guard = self.rescale_snap_mutex.lock();

        let fresh = Box::into_raw(Box::new(Data::new(now)));
        slot.set_hazard(0, fresh);

        let old_ptr = self.data.load(Ordering::Relaxed);
        self.data.store(fresh, Ordering::Release);

        // A weak snapshot: updates that already loaded the old generation
        // may still be inserting and will be missed.
        // SAFETY: old_ptr was the published generation; it is not freed
        // before the retire below, and we extract everything first.
        let (entries, delta) = {
            let old = unsafe { &*old_ptr };
            let entries = old.map.entries();
            let delta = (now as i64 - old.landmark as i64) as f64 / 1e9;
            (entries, delta)
        };
        // SAFETY: unpublished above; in-flight readers hold hazards.
        unsafe { slot.retire_node(old_ptr) };

        // Uniform decay preserves relative ranks, so reinsertion under the
        // normal eviction rule reproduces the same sample.
        let factor = (-ALPHA * delta).exp();
        // SAFETY: pinned by hazard 0.
        let fresh_ref = unsafe { &*fresh };
        for (priority, value) in entries.into_iter().rev() {
            Self::insert_weighted(fresh_ref, priority.into_inner() * factor, value);
        }

        fresh
    }

    /// Returns an (internally sorted) snapshot of the sampled values.
    pub fn snapshot(&self) -> Snapshot {
        let _guard = self.rescale_snap_mutex.lock();
        // The one access that needs no hazard: it excludes rescale, the
        // only operation that can retire the generation.
        let data = unsafe { &*self.data.load(Ordering::Acquire) };
        Snapshot::new(data.map.values())
    }
}

impl Default for ExponentialReservoir {
    fn default() -> Self {
        ExponentialReservoir::new()
    }
}

impl Drop for ExponentialReservoir {
    fn drop(&mut self) {
        let data = *self.data.get_mut();
        // SAFETY: exclusive access; no reader can hold this generation.
        unsafe { drop(Box::from_raw(data)) };
    }
}

#[cfg(test)]
mod tests {
    use super::{ExponentialReservoir, RESCALE_NANOS, SIZE};
    use quanta::Clock;
    use std::time::Duration;

    #[test]
    fn test_basic_functionality() {
        let res = ExponentialReservoir::new();

        // Well under capacity, so snapshots are exact.
        for i in 0..=100 {
            res.update(i);
        }

        let snap = res.snapshot();
        assert_eq!(snap.min(), 0);
        assert_eq!(snap.max(), 100);
        assert_eq!(snap.median(), 50.0);
        assert!(snap.p99() > 99.0);
    }

    #[test]
    fn test_sampling_pushes_out_initial_value() {
        let res = ExponentialReservoir::new();

        res.update(1000);
        for _ in 0..100_000 {
            res.update(1);
        }
        assert_eq!(res.snapshot().max(), 1);
    }

    #[test]
    fn test_reservoir_stays_bounded() {
        let res = ExponentialReservoir::new();
        for i in 0..10_000 {
            res.update(i);
        }
        assert!(res.snapshot().len() <= SIZE);
    }

    #[test]
    fn test_concurrent_updates_stay_bounded() {
        let res = ExponentialReservoir::new();

        crossbeam_utils::thread::scope(|s| {
            for _ in 0..4 {
                let res = &res;
                s.spawn(move |_| {
                    for i in 0..25_000 {
                        res.update(i);
                    }
                });
            }
        })
        .unwrap();

        let snap = res.snapshot();
        assert!(snap.len() <= SIZE);
        assert!(snap.len() > 0);
    }

    #[test]
    fn test_rescale_preserves_samples() {
        let (clock, mock) = Clock::mock();
        let res = ExponentialReservoir::with_clock(clock);

        res.update(42);
        mock.increment(Duration::from_nanos(RESCALE_NANOS + 1));
        // Crossing the boundary rescales, then records as usual.
        res.update(7);

        let snap = res.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.min(), 7);
        assert_eq!(snap.max(), 42);
    }

    #[test]
    fn test_repeated_rescales_stay_bounded() {
        let (clock, mock) = Clock::mock();
        let res = ExponentialReservoir::with_clock(clock);

        for round in 0..3 {
            for i in 0..2_000 {
                res.update(round * 2_000 + i);
            }
            mock.increment(Duration::from_nanos(RESCALE_NANOS + 1));
        }
        res.update(-1);

        let snap = res.snapshot();
        assert!(snap.len() <= SIZE);
        assert_eq!(snap.min(), -1);
    }
}
