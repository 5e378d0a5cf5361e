//! Per-thread allocator state: the malloc cache (per-class free lists plus
//! a bounded quarantine) and the fake stack.
//!
//! The record lives in a `thread_local!` slot and is only ever touched by
//! its owning thread, so no locking is needed. Absence of a current thread
//! must be tolerated: during TLS destruction (and in tests that force it)
//! `with_current` returns `None` and callers fall back to the central
//! path, attributing the operation to thread 0.

use crate::central;
use crate::chunk::ChunkHeader;
use crate::fake_stack::FakeStack;
use crate::quarantine::ChunkFifoList;
use crate::size_class::NUM_SIZE_CLASSES;
use core::cell::{Cell, RefCell};
use core::ptr;
use core::sync::atomic::{AtomicI32, Ordering};

pub struct ThreadMallocStorage {
    pub free_lists: [*mut ChunkHeader; NUM_SIZE_CLASSES],
    pub quarantine: ChunkFifoList,
}

impl ThreadMallocStorage {
    const fn new() -> Self {
        const NO_CHUNK: *mut ChunkHeader = ptr::null_mut();
        ThreadMallocStorage {
            free_lists: [NO_CHUNK; NUM_SIZE_CLASSES],
            quarantine: ChunkFifoList::new(),
        }
    }

    /// Bytes of chunks parked in the per-class free lists.
    pub fn free_list_bytes(&self) -> usize {
        let mut bytes = 0;
        for size_class in 0..NUM_SIZE_CLASSES {
            let mut m = self.free_lists[size_class];
            while !m.is_null() {
                unsafe {
                    bytes += (*m).size();
                    m = (*m).next;
                }
            }
        }
        bytes
    }
}

pub struct Thread {
    tid: i32,
    pub storage: ThreadMallocStorage,
    pub fake_stack: FakeStack,
}

static NEXT_TID: AtomicI32 = AtomicI32::new(0);

impl Thread {
    fn new() -> Self {
        Thread {
            tid: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            storage: ThreadMallocStorage::new(),
            fake_stack: FakeStack::new(),
        }
    }

    #[inline]
    pub fn tid(&self) -> i32 {
        self.tid
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // Thread teardown: hand everything back to the central allocator
        // and release the fake-stack backings.
        unsafe {
            central::malloc_info().swallow_thread_storage(&mut self.storage, true);
            self.fake_stack.cleanup();
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Thread>> = const { RefCell::new(None) };
    static SUPPRESSED: Cell<bool> = const { Cell::new(false) };
}

/// Run `f` against the calling thread's record, creating it on first use.
/// Returns `None` when no current thread is available (TLS destruction in
/// progress, re-entrant access, or suppression in tests).
pub fn with_current<R>(f: impl FnOnce(&mut Thread) -> R) -> Option<R> {
    if SUPPRESSED.try_with(|s| s.get()).unwrap_or(false) {
        return None;
    }
    CURRENT
        .try_with(|cell| {
            let mut slot = cell.try_borrow_mut().ok()?;
            let t = slot.get_or_insert_with(Thread::new);
            Some(f(t))
        })
        .ok()
        .flatten()
}

/// Tid of the current thread, or 0 when none is available.
pub fn current_tid() -> i32 {
    with_current(|t| t.tid()).unwrap_or(0)
}

/// Test hook: make `with_current` report no current thread, exercising the
/// central fallback paths.
pub fn suppress_current_thread(on: bool) {
    SUPPRESSED.with(|s| s.set(on));
}
