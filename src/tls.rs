//! Keyed thread-local storage.
//!
//! [`SharedStorage`] multiplexes many dynamically-created values onto a
//! single `thread_local!` slot per thread, the way larger TLS libraries
//! (Boost, Folly) do: each key is a small integer index into a per-thread
//! array, handed out from a free list so that short-lived keys recycle
//! their index.  Cross-thread visibility exists for one purpose only --
//! destroying a key must reap the value that every thread bound under it.
//!
//! The hazard-pointer domains in [`crate::smr`] are the primary consumer:
//! each domain creates one key and caches the calling thread's slot handle
//! under it, so a thread's first access to a domain allocates and later
//! accesses are an array index.

use parking_lot::Mutex;
use std::ptr;
use std::sync::Arc;

/// Frees a value previously bound with [`SharedStorage::set`].
///
/// # Safety
/// Receives the exact pointer that was bound and is called at most once
/// for it.
pub type Deleter = unsafe fn(*mut ());

struct Element {
    ptr: *mut (),
    deleter: Option<Deleter>,
}

// Elements move between threads when a key is destroyed; the bound values
// are required to tolerate that (every value bound by this crate does).
unsafe impl Send for Element {}

impl Element {
    const fn empty() -> Element {
        Element { ptr: ptr::null_mut(), deleter: None }
    }

    fn destroy(self) {
        if !self.ptr.is_null() {
            if let Some(deleter) = self.deleter {
                // SAFETY: `ptr` was bound together with `deleter` in `set`
                // and has been detached from its array, so this is the only
                // call that will ever free it.
                unsafe { deleter(self.ptr) }
            }
        }
    }
}

struct ThreadEntries {
    elements: Mutex<Vec<Element>>,
}

struct State {
    next_id: u32,
    free_list: Vec<u32>,
    threads: Vec<Arc<ThreadEntries>>,
}

/// Process-wide registry of keyed thread-local values.
///
/// Keys are dense 1-based integers.  Values are bound per thread and are
/// reaped either when the owning thread exits or when the key is destroyed,
/// whichever comes first.
pub struct SharedStorage {
    state: Mutex<State>,
}

static STORAGE: SharedStorage = SharedStorage::new();

thread_local! {
    static THREAD: ThreadGuard = ThreadGuard::register(SharedStorage::global());
}

struct ThreadGuard {
    entries: Arc<ThreadEntries>,
    storage: &'static SharedStorage,
}

impl ThreadGuard {
    fn register(storage: &'static SharedStorage) -> ThreadGuard {
        let entries = Arc::new(ThreadEntries { elements: Mutex::new(Vec::new()) });
        storage.state.lock().threads.push(Arc::clone(&entries));
        ThreadGuard { entries, storage }
    }
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        {
            let mut state = self.storage.state.lock();
            let entries = &self.entries;
            state.threads.retain(|t| !Arc::ptr_eq(t, entries));
        }
        // Deleters may re-enter the registry (a hazard slot handle can
        // cascade into destroying another key), so they run unlocked.
        let elements = std::mem::take(&mut *self.entries.elements.lock());
        for element in elements {
            element.destroy();
        }
    }
}

impl SharedStorage {
    const fn new() -> SharedStorage {
        SharedStorage {
            state: Mutex::new(State { next_id: 0, free_list: Vec::new(), threads: Vec::new() }),
        }
    }

    /// The process-wide storage instance.
    ///
    /// Consumers capture this reference at construction rather than
    /// reaching for it at each access.
    pub fn global() -> &'static SharedStorage {
        &STORAGE
    }

    /// Returns a key into the thread-specific storage.
    pub fn create(&self) -> u32 {
        let mut state = self.state.lock();
        match state.free_list.pop() {
            Some(id) => id,
            None => {
                state.next_id += 1;
                state.next_id
            }
        }
    }

    /// Returns the calling thread's value for `id`, or null if none is
    /// bound.
    pub fn get(&self, id: u32) -> *mut () {
        debug_assert!(id >= 1);
        THREAD.with(|thread| {
            let elements = thread.entries.elements.lock();
            elements.get(id as usize - 1).map(|e| e.ptr).unwrap_or(ptr::null_mut())
        })
    }

    /// Binds `ptr` under `id` for the calling thread.
    ///
    /// The key must not currently have a value bound on this thread;
    /// callers bind once and rebind only after `destroy`.
    pub fn set(&self, id: u32, ptr: *mut (), deleter: Deleter) {
        debug_assert!(id >= 1);
        THREAD.with(|thread| {
            let mut elements = thread.entries.elements.lock();
            let idx = id as usize - 1;
            if idx >= elements.len() {
                // 1.5x growth, so a burst of key creations does not
                // reallocate the array once per key.
                let target = (idx + 1).max(elements.len() + elements.len() / 2);
                elements.resize_with(target, Element::empty);
            }
            debug_assert!(elements[idx].ptr.is_null());
            elements[idx] = Element { ptr, deleter: Some(deleter) };
        })
    }

    /// Destroys every thread's value bound under `id` and recycles the key.
    pub fn destroy(&self, id: u32) {
        debug_assert!(id >= 1);
        let idx = id as usize - 1;
        let mut detached = Vec::new();
        {
            let mut state = self.state.lock();
            for thread in &state.threads {
                let mut elements = thread.elements.lock();
                if let Some(element) = elements.get_mut(idx) {
                    let element = std::mem::replace(element, Element::empty());
                    if !element.ptr.is_null() {
                        detached.push(element);
                    }
                }
            }
            state.free_list.push(id);
        }
        // As in thread teardown: deleters run outside the global lock so
        // they can cascade into further destroys.
        for element in detached {
            element.destroy();
        }
    }
}
