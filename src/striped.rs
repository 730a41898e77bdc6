//! A contention-adaptive 64-bit accumulator.
//!
//! [`StripedAdder`] is a signed accumulator in the LongAdder mold: a single
//! base slot absorbs updates until the first CAS failure, at which point
//! the value stripes across a power-of-two array of cache-padded slots
//! indexed by a per-thread hash.  Further contention rehashes the thread,
//! then doubles the stripe array up to a bound.
//!
//! Reads are not ordered against concurrent writes: a sum taken during a
//! write storm can miss in-flight updates.  That is the intended trade --
//! the type is for metric accumulation, not synchronization.

use crate::random;
use crate::smr::HazardDomain;
use crossbeam_utils::CachePadded;
use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU8, Ordering};
use std::sync::OnceLock;

const STRIPE_LIMIT: usize = 8;

type StripeSlot = CachePadded<AtomicI64>;

// Slab ownership states; see `StripedStorage`.
const OWNS_ALL: u8 = 0;
const OWNS_NEWEST: u8 = 1;
const OWNS_NONE: u8 = 2;

fn alloc_slab(len: usize) -> *mut StripeSlot {
    let slab: Box<[StripeSlot]> = (0..len).map(|_| CachePadded::new(AtomicI64::new(0))).collect();
    Box::into_raw(slab) as *mut StripeSlot
}

unsafe fn free_slab(base: *mut StripeSlot, len: usize) {
    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(base, len)));
}

// Slabs start at index 0 (length 2), then at each power of two: lengths
// 2, 2, 4, 8, ... summing to `size`.
fn slab_bounds(size: usize) -> impl Iterator<Item = (usize, usize)> {
    let powers = std::iter::successors(Some(2usize), |p| Some(p << 1))
        .take_while(move |p| *p < size)
        .map(|p| (p, p));
    std::iter::once((0, 2)).chain(powers)
}

fn newest_slab(size: usize) -> (usize, usize) {
    if size == 2 {
        (0, 2)
    } else {
        (size / 2, size / 2)
    }
}

/// An enormously specialized non-contiguous array of cache-padded atomic
/// slots.
///
/// Growth appends a single new slab equal in length to the current size,
/// so the pre-existing slabs are shared between the old and new
/// generations.  Exactly one generation owns each slab for destruction:
/// a superseded generation calls [`disavow_all`](StripedStorage::disavow_all)
/// (the new generation takes everything), while a new generation that lost
/// its publication race calls [`disavow`](StripedStorage::disavow) and
/// frees only the slab it created.
pub(crate) struct StripedStorage {
    size: usize,
    cells: Box<[*mut StripeSlot]>,
    ownership: AtomicU8,
}

// The cells are plain pointers into heap slabs of atomics; all mutation
// goes through the atomics, and slab destruction is single-owner by the
// disavow protocol.
unsafe impl Send for StripedStorage {}
unsafe impl Sync for StripedStorage {}

impl StripedStorage {
    fn new() -> StripedStorage {
        let slab = alloc_slab(2);
        // SAFETY: in-bounds offsets into the freshly allocated slab.
        let cells = vec![slab, unsafe { slab.add(1) }].into_boxed_slice();
        StripedStorage { size: 2, cells, ownership: AtomicU8::new(OWNS_ALL) }
    }

    /// Builds the next generation (double the size), sharing the existing
    /// slabs and adding one new slab for the added slots.
    fn expand(existing: &StripedStorage) -> StripedStorage {
        let size = existing.size << 1;
        let added = existing.size;
        let slab = alloc_slab(added);
        let mut cells = Vec::with_capacity(size);
        cells.extend_from_slice(&existing.cells);
        for offset in 0..added {
            // SAFETY: in-bounds offsets into the freshly allocated slab.
            cells.push(unsafe { slab.add(offset) });
        }
        StripedStorage { size, cells: cells.into_boxed_slice(), ownership: AtomicU8::new(OWNS_ALL) }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn get(&self, idx: usize) -> &AtomicI64 {
        // SAFETY: slabs live until the owning generation drops, which the
        // caller prevents via hazard protection (or exclusive access).
        unsafe { &*self.cells[idx] }
    }

    /// Relinquishes the shared slabs, keeping only the newly created one.
    fn disavow(&self) {
        self.ownership.store(OWNS_NEWEST, Ordering::Release);
    }

    /// Relinquishes every slab; a successor generation now owns them.
    fn disavow_all(&self) {
        self.ownership.store(OWNS_NONE, Ordering::Release);
    }
}

impl Drop for StripedStorage {
    fn drop(&mut self) {
        match *self.ownership.get_mut() {
            OWNS_ALL => {
                for (start, len) in slab_bounds(self.size) {
                    // SAFETY: sole owner of every slab.
                    unsafe { free_slab(self.cells[start], len) };
                }
            }
            OWNS_NEWEST => {
                let (start, len) = newest_slab(self.size);
                // SAFETY: sole owner of the slab this generation created.
                unsafe { free_slab(self.cells[start], len) };
            }
            _ => {}
        }
    }
}

// One hazard domain serves every adder: stripe generations are all the
// same type, and the retire rate is tiny (at most a couple of expansions
// per adder, ever).
fn stripes_domain() -> &'static HazardDomain<StripedStorage> {
    static DOMAIN: OnceLock<HazardDomain<StripedStorage>> = OnceLock::new();
    DOMAIN.get_or_init(HazardDomain::new)
}

thread_local! {
    static STRIPE_HASH: Cell<u64> = Cell::new(random::next() as u64);
}

/// A 64-bit signed accumulator that stripes across multiple storage
/// locations under contention.
///
/// Reads concurrent with multiple writers may observe only some of the
/// in-flight updates; after writers quiesce, [`value`](StripedAdder::value)
/// equals the algebraic sum of all applied deltas.
pub struct StripedAdder {
    base: AtomicI64,
    stripes: AtomicPtr<StripedStorage>,
}

impl StripedAdder {
    pub fn new() -> StripedAdder {
        StripedAdder { base: AtomicI64::new(0), stripes: AtomicPtr::new(ptr::null_mut()) }
    }

    /// Adds `value` to the accumulator.
    pub fn add(&self, value: i64) {
        let cur = self.stripes.load(Ordering::Acquire);
        if cur.is_null() {
            // Attempt to update the base, checking for contention.
            let expected = self.base.load(Ordering::Relaxed);
            if self
                .base
                .compare_exchange(expected, expected + value, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        } else {
            // Stripes exist: one hazard-protected CAS on our slot.
            let slot = stripes_domain().slot();
            let cur = slot.protect(&self.stripes, 0);
            // SAFETY: protected; generations are retired only after being
            // unpublished.
            let storage = unsafe { &*cur };
            let hash = STRIPE_HASH.with(Cell::get);
            let stripe = storage.get(hash as usize & (storage.size() - 1));
            let expected = stripe.load(Ordering::Relaxed);
            if stripe
                .compare_exchange(expected, expected + value, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                slot.clear_hazard(0);
                return;
            }
        }
        self.add_slow(value);
    }

    fn add_slow(&self, value: i64) {
        let slot = stripes_domain().slot();
        let mut hash = STRIPE_HASH.with(Cell::get);
        let mut contended = false;
        loop {
            if self.stripes.load(Ordering::Acquire).is_null() {
                let fresh = Box::into_raw(Box::new(StripedStorage::new()));
                if self
                    .stripes
                    .compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // Raced with another installer; theirs won.
                    // SAFETY: never published.
                    unsafe { drop(Box::from_raw(fresh)) };
                }
                continue;
            }

            let cur = slot.protect(&self.stripes, 0);
            // SAFETY: protected, as in `add`.
            let storage = unsafe { &*cur };

            // Size is always a power of two.
            let stripe = storage.get(hash as usize & (storage.size() - 1));
            let expected = stripe.load(Ordering::Relaxed);
            if stripe
                .compare_exchange(expected, expected + value, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }

            if !contended {
                // First failure on the stripes: rehash and retry once
                // before growing.
                contended = true;
            } else if storage.size() < STRIPE_LIMIT {
                let next = Box::into_raw(Box::new(StripedStorage::expand(storage)));
                if self.stripes.compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire).is_ok()
                {
                    storage.disavow_all();
                    // SAFETY: unpublished by the CAS above.
                    unsafe { slot.retire_node(cur) };
                } else {
                    // Raced with another grower; free only our new slab.
                    // SAFETY: never published.
                    unsafe {
                        (*next).disavow();
                        drop(Box::from_raw(next));
                    }
                }
                continue;
            }

            // Remix the hash code.
            hash ^= hash << 13;
            hash ^= hash >> 17;
            hash ^= hash << 5;
        }

        STRIPE_HASH.with(|cell| cell.set(hash));
        slot.clear_hazard(0);
    }

    /// Returns the current value.
    ///
    /// Not linearizable with concurrent writes; the result lies between
    /// the minimum and maximum plausible sum over the read window.
    pub fn value(&self) -> i64 {
        let mut sum = self.base.load(Ordering::Relaxed);

        // Short-circuit when unstriped; stripes never transition back to
        // null.
        if self.stripes.load(Ordering::Acquire).is_null() {
            return sum;
        }

        let slot = stripes_domain().slot();
        let cur = slot.protect(&self.stripes, 0);
        // SAFETY: protected.
        let storage = unsafe { &*cur };
        for idx in 0..storage.size() {
            sum += storage.get(idx).load(Ordering::Relaxed);
        }
        slot.clear_hazard(0);
        sum
    }

    /// Returns the current value and resets the accumulator toward zero.
    ///
    /// The sweep is slot-by-slot: a writer racing it can land an update
    /// that this call misses and a later read observes.  Acceptable for
    /// rate buffers, which is what this exists for.
    pub fn take(&self) -> i64 {
        let mut sum = self.base.swap(0, Ordering::AcqRel);

        if self.stripes.load(Ordering::Acquire).is_null() {
            return sum;
        }

        let slot = stripes_domain().slot();
        let cur = slot.protect(&self.stripes, 0);
        // SAFETY: protected.
        let storage = unsafe { &*cur };
        for idx in 0..storage.size() {
            sum += storage.get(idx).swap(0, Ordering::AcqRel);
        }
        slot.clear_hazard(0);
        sum
    }
}

impl Default for StripedAdder {
    fn default() -> Self {
        StripedAdder::new()
    }
}

impl Drop for StripedAdder {
    fn drop(&mut self) {
        let cur = *self.stripes.get_mut();
        if !cur.is_null() {
            // The published generation owns every slab.
            // SAFETY: exclusive access; retired predecessors are handled
            // by the hazard domain.
            unsafe { drop(Box::from_raw(cur)) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{StripedAdder, StripedStorage};
    use std::sync::atomic::Ordering;

    // Mirrors the original's testing-only constructor: force a stripe
    // array of at least `k` slots through the expand/disavow protocol.
    fn with_stripes(k: usize) -> StripedAdder {
        let mut storage = Box::new(StripedStorage::new());
        while storage.size() < k {
            let next = Box::new(StripedStorage::expand(&storage));
            storage.disavow_all();
            storage = next;
        }
        let adder = StripedAdder::new();
        adder.stripes.store(Box::into_raw(storage), Ordering::Release);
        adder
    }

    #[test]
    fn test_storage_expand_and_disavow() {
        let s1 = StripedStorage::new();
        assert_eq!(s1.size(), 2);

        // A loser of the publication race frees only its own slab.
        let s2 = StripedStorage::expand(&s1);
        assert_eq!(s2.size(), 4);
        s2.disavow();
        drop(s2);

        // A winner takes over everything from the superseded generation.
        let s3 = StripedStorage::expand(&s1);
        assert_eq!(s3.size(), 4);
        s1.disavow_all();
        drop(s1);
        drop(s3);
    }

    #[test]
    fn test_basic_functionality() {
        let val = StripedAdder::new();
        assert_eq!(val.value(), 0);

        val.add(1);
        assert_eq!(val.value(), 1);

        val.add(-1);
        assert_eq!(val.value(), 0);

        let val2 = with_stripes(4);
        assert_eq!(val2.value(), 0);

        val2.add(1);
        assert_eq!(val2.value(), 1);
    }

    #[test]
    fn test_take_resets() {
        let val = with_stripes(8);
        for i in 0..100 {
            val.add(i);
        }
        assert_eq!(val.take(), 4950);
        assert_eq!(val.value(), 0);
        val.add(3);
        assert_eq!(val.take(), 3);
    }

    // Non-deterministic but expected to exercise concurrent updates and
    // the growth path.
    #[test]
    fn test_concurrency_smoke() {
        let val = StripedAdder::new();
        let per_worker = 100_000;
        let workers = 4;

        crossbeam_utils::thread::scope(|s| {
            for _ in 0..workers {
                let val = &val;
                s.spawn(move |_| {
                    for _ in 0..per_worker {
                        val.add(1);
                    }
                });
            }
        })
        .unwrap();

        assert_eq!(val.value(), per_worker * workers);
    }

    #[test]
    fn test_concurrent_take_conserves_total() {
        let val = StripedAdder::new();
        let per_worker = 50_000;

        let mut drained = 0;
        crossbeam_utils::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let val = &val;
                    s.spawn(move |_| {
                        for _ in 0..per_worker {
                            val.add(1);
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }
            drained = val.take();
        })
        .unwrap();

        // Everything was applied before the sweep began.
        assert_eq!(drained, 4 * per_worker);
        assert_eq!(val.value(), 0);
    }
}
