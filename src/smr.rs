//! Hazard-pointer safe memory reclamation.
//!
//! The lock-free structures in this crate (the striped adder's stripe
//! generations, the skip list's nodes, the reservoir's data generations)
//! unlink shared heap objects while readers may still hold references to
//! them.  Hazard pointers [Michael 2004] close that gap without reference
//! counts: a reader publishes the pointer it is about to dereference in a
//! per-thread slot, re-checks the source, and reclamation skips anything
//! still published.
//!
//! A [`HazardDomain`] protects one node type.  Threads claim a
//! [`HazardSlot`] on first use (cached through [`crate::tls`]) and release
//! it automatically on thread exit.  Retired nodes accumulate on the
//! retiring slot's private list and are freed by an amortized scan once the
//! list outgrows `1.25 · slots · K`; slots abandoned by exited threads are
//! drained cooperatively by `help_scan`.
//!
//! Determining whether a node is freeable costs work proportional to the
//! number of slots, amortized over a retire-list length that is itself
//! proportional to the number of slots, so reclamation is amortized
//! constant per retire.

use crate::tls::{Deleter, SharedStorage};
use std::cell::UnsafeCell;
use std::collections::HashSet;
use std::ptr;
use std::sync::atomic::{
    AtomicBool, AtomicPtr, AtomicUsize,
    Ordering::{AcqRel, Acquire, Relaxed, Release},
};
use std::sync::Arc;

/// A collection of hazard slots protecting nodes of type `T`, with `K`
/// protected pointers per slot.
///
/// One domain exists per protected type; collaborators capture it (or a
/// shared handle to it) at construction.  Dropping the domain reaps every
/// thread's cached slot and frees anything still on the retire lists.
pub struct HazardDomain<T: Send, const K: usize = 1> {
    core: Arc<DomainCore<T, K>>,
    storage: &'static SharedStorage,
    key: u32,
}

struct DomainCore<T: Send, const K: usize> {
    head: AtomicPtr<HazardSlot<T, K>>,
    slots: AtomicUsize,
}

/// A per-thread record of up to `K` protected pointers plus a private
/// retire list.
///
/// A slot is used by exactly one thread at a time; the slot list itself is
/// append-only, so exited threads' slots are recycled rather than freed.
pub struct HazardSlot<T: Send, const K: usize> {
    hazards: [AtomicPtr<T>; K],
    active: AtomicBool,
    next: AtomicPtr<HazardSlot<T, K>>,
    owner: *const DomainCore<T, K>,
    retired: UnsafeCell<Vec<*mut T>>,
}

// Slots are shared across threads by design: hazards are atomics, `active`
// arbitrates ownership, and the retire list is only touched by the slot's
// current claimant.
unsafe impl<T: Send, const K: usize> Send for HazardSlot<T, K> {}
unsafe impl<T: Send, const K: usize> Sync for HazardSlot<T, K> {}
unsafe impl<T: Send, const K: usize> Send for DomainCore<T, K> {}
unsafe impl<T: Send, const K: usize> Sync for DomainCore<T, K> {}

/// The per-thread cache entry stored in thread-local storage: the thread's
/// slot plus a strong reference that keeps the domain core alive for as
/// long as any thread still holds a slot.
struct SlotHandle<T: Send, const K: usize> {
    core: Arc<DomainCore<T, K>>,
    slot: *mut HazardSlot<T, K>,
}

unsafe fn release_slot<T: Send, const K: usize>(ptr: *mut ()) {
    let handle = Box::from_raw(ptr as *mut SlotHandle<T, K>);
    (*handle.slot).retire();
    // Dropping the handle releases the core reference; the core (and all
    // slots) are freed once the owning domain and every thread are done.
}

impl<T: Send, const K: usize> HazardDomain<T, K> {
    /// Creates a domain backed by the process-wide key manager.
    pub fn new() -> HazardDomain<T, K> {
        HazardDomain::with_storage(SharedStorage::global())
    }

    /// Creates a domain whose per-thread slot cache lives in `storage`.
    pub fn with_storage(storage: &'static SharedStorage) -> HazardDomain<T, K> {
        HazardDomain {
            core: Arc::new(DomainCore { head: AtomicPtr::new(ptr::null_mut()), slots: AtomicUsize::new(0) }),
            storage,
            key: storage.create(),
        }
    }

    /// Returns the calling thread's slot, claiming or creating one on
    /// first use.
    pub fn slot(&self) -> &HazardSlot<T, K> {
        let cached = self.storage.get(self.key) as *mut SlotHandle<T, K>;
        if !cached.is_null() {
            // SAFETY: the handle was cached by this thread and stays valid
            // until thread exit or domain drop, neither of which can race
            // this call.
            return unsafe { &*(*cached).slot };
        }

        let slot = self.core.allocate();
        let handle = Box::into_raw(Box::new(SlotHandle { core: Arc::clone(&self.core), slot }));
        self.storage.set(self.key, handle as *mut (), release_slot::<T, K> as Deleter);
        // SAFETY: freshly allocated from the core, which `self` keeps
        // alive.
        unsafe { &*slot }
    }
}

impl<T: Send, const K: usize> Default for HazardDomain<T, K> {
    fn default() -> Self {
        HazardDomain::new()
    }
}

impl<T: Send, const K: usize> Drop for HazardDomain<T, K> {
    fn drop(&mut self) {
        // Reap every thread's cached handle; each release drops a core
        // reference, and the core frees the slots and any unreclaimed
        // retired nodes when the last reference goes.
        self.storage.destroy(self.key);
    }
}

impl<T: Send, const K: usize> DomainCore<T, K> {
    /// Claims an inactive slot or appends a new one.
    fn allocate(&self) -> *mut HazardSlot<T, K> {
        let mut cur = self.head.load(Acquire);
        while !cur.is_null() {
            // SAFETY: slots are never freed while the core is alive.
            let slot = unsafe { &*cur };
            if !slot.active.load(Relaxed)
                && slot.active.compare_exchange(false, true, AcqRel, Relaxed).is_ok()
            {
                return cur;
            }
            cur = slot.next.load(Acquire);
        }

        // Count the new slot first so concurrent scans use the larger
        // threshold.
        self.slots.fetch_add(1, Relaxed);

        let slot = Box::into_raw(Box::new(HazardSlot {
            hazards: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            active: AtomicBool::new(true),
            next: AtomicPtr::new(ptr::null_mut()),
            owner: self as *const DomainCore<T, K>,
            retired: UnsafeCell::new(Vec::new()),
        }));

        let mut head = self.head.load(Acquire);
        loop {
            // SAFETY: not yet published; no other thread can see `slot`.
            unsafe { (*slot).next.store(head, Relaxed) };
            match self.head.compare_exchange(head, slot, AcqRel, Acquire) {
                Ok(_) => return slot,
                Err(actual) => head = actual,
            }
        }
    }
}

impl<T: Send, const K: usize> Drop for DomainCore<T, K> {
    fn drop(&mut self) {
        // Every slot handle holds a strong reference to the core, so at
        // this point no thread can touch the slots or retire lists.
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            // SAFETY: exclusive access; each slot is freed exactly once.
            let mut slot = unsafe { Box::from_raw(cur) };
            cur = *slot.next.get_mut();
            for node in slot.retired.get_mut().drain(..) {
                unsafe { drop(Box::from_raw(node)) };
            }
        }
    }
}

impl<T: Send, const K: usize> HazardSlot<T, K> {
    /// Publishes hazardous intent to dereference `value`.
    pub fn set_hazard(&self, index: usize, value: *mut T) {
        self.hazards[index].store(value, Release);
    }

    /// Withdraws the hazardous reference at `index`.
    pub fn clear_hazard(&self, index: usize) {
        self.hazards[index].store(ptr::null_mut(), Release);
    }

    /// Loads `source` and publishes the hazard, looping until two
    /// consecutive loads agree.
    ///
    /// On return, either the result is protected from reclamation or it
    /// was already absent from `source` before the hazard was published.
    pub fn protect(&self, source: &AtomicPtr<T>, index: usize) -> *mut T {
        loop {
            let cur = source.load(Acquire);
            self.set_hazard(index, cur);
            if source.load(Acquire) == cur {
                return cur;
            }
        }
    }

    /// Single-shot [`protect`](HazardSlot::protect): returns `None` (with
    /// the hazard cleared) if `source` moved during publication.
    pub fn try_protect(&self, source: &AtomicPtr<T>, index: usize) -> Option<*mut T> {
        let cur = source.load(Acquire);
        self.set_hazard(index, cur);
        if source.load(Acquire) != cur {
            self.clear_hazard(index);
            return None;
        }
        Some(cur)
    }

    /// Retires a node for eventual reclamation.
    ///
    /// # Safety
    /// `node` must be a uniquely-retired heap pointer (from `Box`) that
    /// has already been made unreachable from every shared location, so
    /// that no new hazardous references to it can be established.
    pub unsafe fn retire_node(&self, node: *mut T) {
        let len = {
            // SAFETY: the retire list is private to the slot's claimant.
            let retired = &mut *self.retired.get();
            retired.push(node);
            retired.len()
        };
        if self.should_scan(len) {
            self.scan();
            self.help_scan();
        }
    }

    // Scan when retire_list >= 1.25 * H (H = slots * K), keeping the
    // per-retire reclamation check amortized constant.
    fn should_scan(&self, retired_len: usize) -> bool {
        // SAFETY: the owning core outlives its slots.
        let slots = unsafe { (*self.owner).slots.load(Acquire) };
        retired_len >= (5 * slots * K + 3) / 4
    }

    /// Frees every retired node that no slot currently protects.
    ///
    /// Surviving nodes stay on the retire list for a later pass.
    pub fn scan(&self) {
        // SAFETY: the owning core outlives its slots.
        let core = unsafe { &*self.owner };

        // Phase 1: accumulate the set of live hazardous references.
        let mut live = HashSet::new();
        let mut cur = core.head.load(Acquire);
        while !cur.is_null() {
            let slot = unsafe { &*cur };
            for hazard in &slot.hazards {
                let value = hazard.load(Acquire);
                if !value.is_null() {
                    live.insert(value as usize);
                }
            }
            cur = slot.next.load(Acquire);
        }

        // Phase 2: free anything on the retire list that is not live.
        // SAFETY: the list is private to this slot's claimant, and every
        // node on it was made unreachable before being retired.
        let retired = unsafe { &mut *self.retired.get() };
        retired.retain(|&node| {
            if live.contains(&(node as usize)) {
                true
            } else {
                unsafe { drop(Box::from_raw(node)) };
                false
            }
        });
    }

    /// Adopts retired nodes abandoned by exited threads.
    ///
    /// Walks the slot list, claims each inactive slot, and steals its
    /// retire list entries into this slot's own list, interleaving scans
    /// to keep the length bounded.  Guarantees eventual reclamation when
    /// threads exit without draining their lists.
    pub fn help_scan(&self) {
        // SAFETY: the owning core outlives its slots.
        let core = unsafe { &*self.owner };
        let mut cur = core.head.load(Acquire);
        while !cur.is_null() {
            let other = unsafe { &*cur };
            cur = other.next.load(Acquire);
            if ptr::eq(other, self) {
                continue;
            }
            if other.active.compare_exchange(false, true, AcqRel, Relaxed).is_err() {
                continue;
            }

            // The claim gives exclusive use of `other`'s retire list.
            // Move entries over one at a time so the combined list never
            // exceeds the scan limit by more than one entry.
            loop {
                let stolen = {
                    // SAFETY: exclusive via the `active` claim above.
                    let theirs = unsafe { &mut *other.retired.get() };
                    match theirs.pop() {
                        Some(node) => node,
                        None => break,
                    }
                };
                let len = {
                    // SAFETY: private to this slot's claimant.
                    let mine = unsafe { &mut *self.retired.get() };
                    mine.push(stolen);
                    mine.len()
                };
                if self.should_scan(len) {
                    self.scan();
                }
            }

            other.active.store(false, Release);
        }
    }

    /// Releases the slot for reuse by another thread.
    ///
    /// Clears the protected pointers but not the retire list; leftover
    /// entries are adopted by a later `help_scan`.
    fn retire(&self) {
        for hazard in &self.hazards {
            hazard.store(ptr::null_mut(), Release);
        }
        self.active.store(false, Release);
    }
}

#[cfg(test)]
mod tests {
    use super::{DomainCore, HazardDomain};
    use std::ptr;
    use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
    use std::sync::Arc;

    struct DeleteCounter(Arc<AtomicUsize>);

    impl Drop for DeleteCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> *mut DeleteCounter) {
        let count = Arc::new(AtomicUsize::new(0));
        let mk = {
            let count = Arc::clone(&count);
            move || Box::into_raw(Box::new(DeleteCounter(Arc::clone(&count))))
        };
        (count, mk)
    }

    #[test]
    fn test_allocate_and_retire_reuses_slots() {
        let domain: HazardDomain<u64, 1> = HazardDomain::new();
        let core: &DomainCore<u64, 1> = &domain.core;

        let slot1 = core.allocate();
        let slot2 = core.allocate();
        assert!(!slot1.is_null());
        assert_ne!(slot1, slot2);

        unsafe { (*slot1).retire() };
        let slot3 = core.allocate();
        assert_eq!(slot1, slot3);

        unsafe {
            (*slot2).retire();
            (*slot3).retire();
        }
    }

    #[test]
    fn test_retire_node_triggers_scan() {
        let domain: HazardDomain<DeleteCounter, 1> = HazardDomain::new();
        let slot = domain.slot();
        let (deletions, mk) = counter();

        // One slot in the domain, so reclamation runs every 1.25 retires.
        unsafe { slot.retire_node(mk()) };
        assert_eq!(deletions.load(Ordering::SeqCst), 0);
        unsafe { slot.retire_node(mk()) };
        // Neither was protected, so both went.
        assert_eq!(deletions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_scan_preserves_live_items() {
        let domain: HazardDomain<DeleteCounter, 1> = HazardDomain::new();
        let slot = domain.slot();
        let (deletions, mk) = counter();

        let protected = mk();
        slot.set_hazard(0, protected);

        unsafe { slot.retire_node(protected) };
        assert_eq!(deletions.load(Ordering::SeqCst), 0);
        unsafe { slot.retire_node(mk()) };
        assert_eq!(deletions.load(Ordering::SeqCst), 1);

        slot.clear_hazard(0);
        unsafe { slot.retire_node(mk()) };

        assert_eq!(deletions.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_help_scan_adopts_abandoned_lists() {
        let domain: HazardDomain<DeleteCounter, 1> = HazardDomain::new();
        let core = &domain.core;
        let (deletions, mk) = counter();

        let mine = core.allocate();
        let lazy = core.allocate();

        unsafe {
            // `lazy` walks away without running reclamation.
            (*lazy).retire_node(mk());
            (*lazy).retire();
        }
        assert_eq!(deletions.load(Ordering::SeqCst), 0);

        // Two slots in the domain now, so the threshold is three.
        unsafe {
            (*mine).retire_node(mk());
            (*mine).retire_node(mk());
            (*mine).retire_node(mk());
        }
        // The third retire scanned (freeing our three) and help-scanned,
        // adopting the abandoned entry without another scan.
        assert_eq!(deletions.load(Ordering::SeqCst), 3);

        unsafe { (*mine).scan() };
        assert_eq!(deletions.load(Ordering::SeqCst), 4);

        unsafe { (*mine).retire() };
    }

    #[test]
    fn test_protect_tracks_source() {
        let domain: HazardDomain<u64, 2> = HazardDomain::new();
        let slot = domain.slot();

        let value = Box::into_raw(Box::new(7u64));
        let source = AtomicPtr::new(value);

        assert_eq!(slot.protect(&source, 0), value);
        assert_eq!(slot.try_protect(&source, 1), Some(value));

        slot.clear_hazard(0);
        slot.clear_hazard(1);
        unsafe { drop(Box::from_raw(value)) };

        let empty: AtomicPtr<u64> = AtomicPtr::new(ptr::null_mut());
        assert!(slot.protect(&empty, 0).is_null());
    }

    #[test]
    fn test_domain_drop_frees_unscanned_retires() {
        let (deletions, mk) = counter();
        {
            let domain: HazardDomain<DeleteCounter, 4> = HazardDomain::new();
            let slot = domain.slot();
            // Threshold is 5 with one slot of width four; nothing scans.
            unsafe { slot.retire_node(mk()) };
            unsafe { slot.retire_node(mk()) };
            assert_eq!(deletions.load(Ordering::SeqCst), 0);
        }
        assert_eq!(deletions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_threads_get_distinct_slots() {
        let domain: Arc<HazardDomain<u64, 1>> = Arc::new(HazardDomain::new());
        let here = domain.slot() as *const _ as usize;
        assert_eq!(domain.slot() as *const _ as usize, here);

        let remote = {
            let domain = Arc::clone(&domain);
            std::thread::spawn(move || domain.slot() as *const _ as usize).join().unwrap()
        };
        assert_ne!(here, remote);
    }
}
