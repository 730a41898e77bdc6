//! A lock-free ordered map.
//!
//! `SkipListMap` is a concurrent skip list with deletion by logical
//! marking: removal first tags a node's forward pointers (the low bit of
//! the pointer word) and only then unlinks it physically.  The search
//! routine doubles as the cleaner -- it unlinks any marked node it passes --
//! so readers never observe a dead node as present and the list converges
//! to a clean state under mixed workloads.
//!
//! The algorithm is Michael's hazard-pointer list-based set, extended with
//! skip-list index levels; the index is an optimization only and is
//! abandoned on any inconsistency rather than retried.  Memory is
//! reclaimed exclusively through a per-map [`HazardDomain`], so the map is
//! safe under concurrent insert/lookup/remove without locks.

use crate::marked::MarkedPtr;
use crate::random;
use crate::smr::{HazardDomain, HazardSlot};
use std::cmp;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

const MAX_HEIGHT: usize = 12;

// Hazard slot indices used by the search walk.
const HP_NEXT: usize = 0;
const HP_CUR: usize = 1;
const HP_PREV: usize = 2;
const HP_PENDING: usize = 3;

struct Node<K, V> {
    key: K,
    value: V,
    height: u8,
    next: Box<[AtomicPtr<Node<K, V>>]>,
}

impl<K, V> Node<K, V> {
    fn alloc(height: usize, key: K, value: V) -> *mut Node<K, V> {
        let next = (0..height).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
        Box::into_raw(Box::new(Node { key, value, height: height as u8, next }))
    }

    fn forward(&self, level: usize) -> &AtomicPtr<Node<K, V>> {
        &self.next[level]
    }

    // A node is dead once its level-0 forward pointer carries the mark.
    fn dead(&self) -> bool {
        MarkedPtr::from_raw(self.next[0].load(Ordering::Acquire)).is_marked()
    }
}

/// Snapshot of the neighborhood of a key: `cur` is the first level-0 node
/// with key >= the probe, `prev` its predecessor, `found` whether the keys
/// matched.  Both nodes are pinned by hazard pointers until the caller
/// clears them.
struct FindResult<K, V> {
    prev: *mut Node<K, V>,
    cur: *mut Node<K, V>,
    found: bool,
}

/// A lock-free ordered map from `K` to `V`.
///
/// All operations are safe under full concurrency; `insert`, `get`, and
/// the marking step of `remove` are linearizable against each other.
/// Iteration ([`entries`](SkipListMap::entries),
/// [`values`](SkipListMap::values)) produces an ordered weak snapshot:
/// a valid serialization of the operations that completed before the call
/// began.
pub struct SkipListMap<K: Send, V: Send> {
    head: *mut Node<K, V>,
    height: AtomicUsize,
    domain: HazardDomain<Node<K, V>, 4>,
}

unsafe impl<K: Send + Sync, V: Send + Sync> Send for SkipListMap<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for SkipListMap<K, V> {}

impl<K, V> SkipListMap<K, V>
where
    K: Ord + Clone + Default + Send + Sync,
    V: Clone + Default + Send + Sync,
{
    /// Creates an empty map.
    pub fn new() -> SkipListMap<K, V> {
        SkipListMap {
            head: Node::alloc(MAX_HEIGHT, K::default(), V::default()),
            height: AtomicUsize::new(0),
            domain: HazardDomain::new(),
        }
    }

    /// Returns a level in `[0, MAX_HEIGHT - 1]`, geometrically distributed
    /// with P = 0.5.
    fn random_level() -> usize {
        let mut r = random::next();
        let mut level = 0;
        loop {
            r >>= 1;
            if level >= MAX_HEIGHT - 1 || r & 1 == 0 {
                return level;
            }
            level += 1;
        }
    }

    fn clear_search_hazards(slot: &HazardSlot<Node<K, V>, 4>) {
        slot.clear_hazard(HP_NEXT);
        slot.clear_hazard(HP_CUR);
        slot.clear_hazard(HP_PREV);
    }

    /// Inserts `key -> value`, returning false if the key already exists.
    pub fn insert(&self, key: K, value: V) -> bool {
        let slot = self.domain.slot();

        let mut level = Self::random_level();
        let height = self.height.load(Ordering::Relaxed);
        if level > height {
            // Clamp index growth to one level per insert.
            level = height + 1;
            self.height.store(level, Ordering::Relaxed);
        }

        let mut result = self.find(slot, &key);
        if result.found {
            Self::clear_search_hazards(slot);
            return false;
        }

        // The node is published before its index links are complete, so it
        // stays pinned for the whole operation.
        let node = Node::alloc(level + 1, key, value);
        slot.set_hazard(HP_PENDING, node);

        loop {
            // SAFETY: `node` is ours until the CAS below publishes it, and
            // pinned by HP_PENDING afterwards.
            unsafe { (*node).forward(0).store(result.cur, Ordering::Relaxed) };
            // SAFETY: `result.prev` is pinned by the search hazards.
            let prev = unsafe { &*result.prev };
            if prev
                .forward(0)
                .compare_exchange(result.cur, node, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }

            // An entry may have been inserted between prev and cur; it is
            // always correct to repeat the search from the root.
            result = self.find(slot, unsafe { &(*node).key });
            if result.found {
                Self::clear_search_hazards(slot);
                slot.clear_hazard(HP_PENDING);
                // SAFETY: never became visible, so it needn't be retired.
                unsafe { drop(Box::from_raw(node)) };
                return false;
            }
        }

        self.link_index_levels(slot, node, level);

        Self::clear_search_hazards(slot);
        slot.clear_hazard(HP_PENDING);
        true
    }

    // Builds the index entries for a freshly-linked node, following the
    // structure of the search walk.  CAS failures and marks abandon the
    // remaining levels: the index only affects performance.
    fn link_index_levels(&self, slot: &HazardSlot<Node<K, V>, 4>, node: *mut Node<K, V>, level: usize) {
        // SAFETY: `node` is pinned by HP_PENDING.
        let key = unsafe { &(*node).key };
        let mut prev = self.head;
        let top = cmp::max(level, self.height.load(Ordering::Relaxed));
        for i in (1..=top).rev() {
            // SAFETY: `prev` is the head or pinned by HP_PREV.
            let cur_m = MarkedPtr::from_raw(slot.protect(unsafe { (*prev).forward(i) }, HP_CUR));
            if cur_m.is_marked() {
                return;
            }
            let mut cur = cur_m.ptr();

            // SAFETY: `cur` is pinned by HP_CUR throughout the walk.
            while !cur.is_null() && unsafe { &(*cur).key } < key {
                let next_m =
                    MarkedPtr::from_raw(slot.protect(unsafe { (*cur).forward(i) }, HP_NEXT));
                if next_m.is_marked() {
                    return;
                }
                if unsafe { (*prev).forward(i) }.load(Ordering::Acquire) != cur {
                    return;
                }
                prev = cur;
                slot.set_hazard(HP_PREV, prev);
                cur = next_m.ptr();
                slot.set_hazard(HP_CUR, cur);
            }

            if i <= level {
                // SAFETY: pinned by HP_PENDING; only this thread writes the
                // unmarked word (erasers only set marks).
                unsafe { (*node).forward(i).store(cur, Ordering::Relaxed) };
                if unsafe { (*prev).forward(i) }
                    .compare_exchange(cur, node, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return;
                }
            }
            // SAFETY: pinned by HP_PENDING.
            if unsafe { (*node).dead() } {
                // Concurrently erased; leave the index alone.
                return;
            }
        }
    }

    /// Returns the value for `key`, if present.
    pub fn get(&self, key: &K) -> Option<V> {
        let slot = self.domain.slot();
        let result = self.find(slot, key);
        // SAFETY: `result.cur` is pinned by HP_CUR until the clear below.
        let value = if result.found { Some(unsafe { (*result.cur).value.clone() }) } else { None };
        Self::clear_search_hazards(slot);
        value
    }

    /// Whether `key` exists.
    pub fn contains(&self, key: &K) -> bool {
        let slot = self.domain.slot();
        let found = self.find(slot, key).found;
        Self::clear_search_hazards(slot);
        found
    }

    /// Removes `key`, returning whether it existed (and thus was removed).
    ///
    /// Under concurrent removal of the same key, exactly one caller
    /// observes `true`: the level-0 mark is the linearization point.
    pub fn remove(&self, key: &K) -> bool {
        let slot = self.domain.slot();
        let result = self.find(slot, key);
        if !result.found {
            Self::clear_search_hazards(slot);
            return false;
        }

        // Mark the node dead at every level, top down.  Marking needs no
        // consistent neighborhood snapshot: on CAS failure the pointer is
        // simply reloaded.  No hazard is needed for the successor because
        // it is never dereferenced here.
        let cur = result.cur;
        let mut won_level0 = false;
        // SAFETY: `cur` is pinned by HP_CUR from the search above.
        let node_height = unsafe { (*cur).height } as usize;
        for i in (0..node_height).rev() {
            let forward = unsafe { (*cur).forward(i) };
            let mut observed = MarkedPtr::from_raw(forward.load(Ordering::Acquire));
            loop {
                match forward.compare_exchange(
                    observed.raw(),
                    observed.marked().raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(actual) => observed = MarkedPtr::from_raw(actual),
                }
            }
            if i == 0 && !observed.is_marked() {
                // Only one of N concurrent removers can mark a previously
                // unmarked level-0 pointer.
                won_level0 = true;
            }
        }

        // No consistent per-level snapshot exists for physical unlinking;
        // search again and let the cleaner do it.
        let _ = self.find(slot, key);
        Self::clear_search_hazards(slot);

        won_level0
    }

    /// Returns the smallest key, or `K::default()` if the map is empty.
    pub fn first_key(&self) -> K {
        let slot = self.domain.slot();
        loop {
            let mut first = None;
            if self.try_walk(slot, &mut |node| {
                first = Some(node.key.clone());
                false
            }) {
                return first.unwrap_or_default();
            }
        }
    }

    /// Returns the `(key, value)` pairs in key order.
    ///
    /// The result is an ordered weak snapshot: every pair present for the
    /// whole call appears, and nothing dead at the start does.
    pub fn entries(&self) -> Vec<(K, V)> {
        let slot = self.domain.slot();
        loop {
            let mut out = Vec::new();
            if self.try_walk(slot, &mut |node| {
                out.push((node.key.clone(), node.value.clone()));
                true
            }) {
                return out;
            }
        }
    }

    /// Returns the values in key order.
    pub fn values(&self) -> Vec<V> {
        self.entries().into_iter().map(|(_, value)| value).collect()
    }

    // Level-0 walk that visits every live node in key order without
    // unlinking anything; `visit` returns false to stop early.  Returns
    // false when the walk lost its anchor and must restart from scratch
    // (the caller re-accumulates).
    //
    // Protection scheme: `anchor` is the last live node visited (the head
    // to begin with) and `run_raw` the validated value of its forward
    // pointer.  Everything between anchor and the next live node is a run
    // of dead nodes whose forward pointers are frozen, so the run can only
    // be dismantled front-first -- each physical unlink must CAS the
    // anchor's forward pointer.  Re-checking `anchor.next == run_raw`
    // after each hazard publication therefore pins the entire run: a node
    // in it cannot have been retired while the check still passes.
    fn try_walk(
        &self,
        slot: &HazardSlot<Node<K, V>, 4>,
        visit: &mut dyn FnMut(&Node<K, V>) -> bool,
    ) -> bool {
        let mut anchor = self.head;
        slot.set_hazard(HP_PREV, anchor);

        'run: loop {
            // (Re)acquire the run from the anchor.
            // SAFETY: `anchor` is the head or pinned by HP_PREV.
            let run_m =
                MarkedPtr::from_raw(slot.protect(unsafe { (*anchor).forward(0) }, HP_CUR));
            if run_m.is_marked() {
                // The anchor died; only the head is safe to restart from.
                Self::clear_search_hazards(slot);
                return false;
            }
            let run_raw = run_m.raw();
            let mut cur = run_m.ptr();

            loop {
                if cur.is_null() {
                    Self::clear_search_hazards(slot);
                    return true;
                }

                // SAFETY: `cur` is pinned by HP_CUR and covered by the run
                // invariant above.
                let next_m =
                    MarkedPtr::from_raw(unsafe { (*cur).forward(0) }.load(Ordering::Acquire));
                slot.set_hazard(HP_NEXT, next_m.ptr());
                if unsafe { (*anchor).forward(0) }.load(Ordering::Acquire) != run_raw {
                    // The run front moved (insert or unlink); rewind to the
                    // anchor without revisiting anything already reported.
                    continue 'run;
                }

                if !next_m.is_marked() {
                    // SAFETY: pinned by HP_CUR.
                    if !visit(unsafe { &*cur }) {
                        Self::clear_search_hazards(slot);
                        return true;
                    }
                    anchor = cur;
                    slot.set_hazard(HP_PREV, anchor);
                    continue 'run;
                }

                cur = next_m.ptr();
                slot.set_hazard(HP_CUR, cur);
                if unsafe { (*anchor).forward(0) }.load(Ordering::Acquire) != run_raw {
                    continue 'run;
                }
            }
        }
    }

    // The search has two responsibilities: acquiring a consistent
    // <prev, cur> snapshot around `key`, and unlinking nodes that have
    // been marked dead.  Any observation inconsistent with a protecting
    // hazard restarts the whole search.
    fn find(&self, slot: &HazardSlot<Node<K, V>, 4>, key: &K) -> FindResult<K, V> {
        'search: loop {
            let mut prev = self.head;
            slot.set_hazard(HP_PREV, prev);
            let mut cur: *mut Node<K, V> = ptr::null_mut();

            let top = self.height.load(Ordering::Relaxed);
            for i in (0..=top).rev() {
                // SAFETY: `prev` is the head or pinned by HP_PREV.
                let cur_m =
                    MarkedPtr::from_raw(slot.protect(unsafe { (*prev).forward(i) }, HP_CUR));
                if cur_m.is_marked() {
                    // prev died under us, and a marked word is no
                    // protection at all.
                    continue 'search;
                }
                cur = cur_m.ptr();

                loop {
                    if cur.is_null() {
                        break;
                    }

                    // SAFETY: `cur` is pinned by HP_CUR.
                    let next_m = match slot.try_protect(unsafe { (*cur).forward(i) }, HP_NEXT) {
                        Some(raw) => MarkedPtr::from_raw(raw),
                        // Either cur died or a node landed after it.
                        None => continue 'search,
                    };

                    if unsafe { (*prev).forward(i) }.load(Ordering::Acquire) != cur {
                        // Either prev died or a node landed after it.
                        continue 'search;
                    }

                    let cur_dead = next_m.is_marked() || unsafe { (*cur).dead() };

                    if !cur_dead {
                        if unsafe { &(*cur).key } >= key {
                            break;
                        }
                        prev = cur;
                        slot.set_hazard(HP_PREV, prev);
                    } else {
                        // Unlink at this level.  Dead nodes' forward
                        // pointers are frozen, so a relaxed load suffices.
                        let frozen =
                            MarkedPtr::from_raw(unsafe { (*cur).forward(i) }.load(Ordering::Relaxed));
                        if unsafe { (*prev).forward(i) }
                            .compare_exchange(
                                cur,
                                frozen.ptr(),
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_err()
                        {
                            // Insertion after prev, or a concurrent unlink.
                            continue 'search;
                        }
                        // Continue through the successor.  The pin moves
                        // off the dead node before the retire so it is
                        // immediately reclaimable, and the successor's pin
                        // is re-validated against prev before use.
                        slot.set_hazard(HP_CUR, next_m.ptr());
                        if i == 0 {
                            // SAFETY: unlinked from every level, so no new
                            // hazardous references can form.
                            unsafe { slot.retire_node(cur) };
                        }
                        if unsafe { (*prev).forward(i) }.load(Ordering::Acquire) != next_m.ptr() {
                            continue 'search;
                        }
                        cur = next_m.ptr();
                        continue;
                    }

                    cur = next_m.ptr();
                    slot.set_hazard(HP_CUR, cur);
                }
            }

            // SAFETY: `cur`, when non-null, is pinned by HP_CUR.
            let found = !cur.is_null() && unsafe { &(*cur).key } == key;
            return FindResult { prev, cur, found };
        }
    }
}

impl<K, V> Default for SkipListMap<K, V>
where
    K: Ord + Clone + Default + Send + Sync,
    V: Clone + Default + Send + Sync,
{
    fn default() -> Self {
        SkipListMap::new()
    }
}

impl<K: Send, V: Send> Drop for SkipListMap<K, V> {
    fn drop(&mut self) {
        // Exclusive access: free the level-0 chain directly.  Nodes that
        // were unlinked but not yet reclaimed sit on the hazard domain's
        // retire lists and are freed when the domain drops right after.
        let mut cur = self.head;
        while !cur.is_null() {
            // SAFETY: each node in the chain is freed exactly once; the
            // chain and the retire lists are disjoint.
            let node = unsafe { Box::from_raw(cur) };
            cur = MarkedPtr::from_raw(node.next[0].load(Ordering::Relaxed)).ptr();
        }
    }
}
