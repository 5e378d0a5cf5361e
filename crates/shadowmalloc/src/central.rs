//! The central allocator: per-class free lists, the central quarantine,
//! and the page-group index used for reverse address lookup.
//!
//! One mutex covers all three. Per-thread caches drain into and refill
//! from here in bulk, so the lock is off the fast path for cached classes.

use crate::chunk::{
    ptr_to_chunk, ChunkHeader, CHUNK_ALLOCATED, CHUNK_AVAILABLE, CHUNK_QUARANTINE,
};
use crate::quarantine::ChunkFifoList;
use crate::report::{self, ReportEvent};
use crate::size_class::{class_to_size, NUM_SIZE_CLASSES};
use crate::sync::Mutex;
use crate::thread::ThreadMallocStorage;
use crate::trace::StackTrace;
use crate::util::{
    is_aligned, HEAP_LEFT_REDZONE_MAGIC, MAX_AVAILABLE_RAM, MIN_MMAP_SIZE, PAGE_SIZE,
};
use crate::{config, platform, shadow, thread};
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

/// One contiguous OS-obtained region carved into chunks of a single size.
/// The descriptor itself lives inside the mapping (in the excluded last
/// slot for sub-page chunks, in a trailing extra page otherwise), in
/// memory whose shadow is already redzone-poisoned.
pub struct PageGroup {
    pub beg: usize,
    pub end: usize,
    pub chunk_size: usize,
}

impl PageGroup {
    #[inline]
    pub fn in_range(&self, addr: usize) -> bool {
        addr >= self.beg && addr < self.end
    }
}

const MAX_PAGE_GROUPS: usize = MAX_AVAILABLE_RAM / MIN_MMAP_SIZE;

const NO_CHUNK: *mut ChunkHeader = ptr::null_mut();
const NO_GROUP: *mut PageGroup = ptr::null_mut();

struct CentralInner {
    free_lists: [*mut ChunkHeader; NUM_SIZE_CLASSES],
    quarantine: ChunkFifoList,
    /// Append-only; slots below `n_page_groups` are immutable once written.
    page_groups: [*mut PageGroup; MAX_PAGE_GROUPS],
}

pub struct MallocInfo {
    inner: Mutex<CentralInner>,
    /// Bumped with an atomic increment; the slot write happens under the
    /// mutex before the list containing chunks of the group is published.
    n_page_groups: AtomicUsize,
    /// Bytes obtained from the OS for chunk carving.
    total_mmaped: AtomicUsize,
    /// Bytes allocated since the last status emission (stats mode).
    allocated_since_status: AtomicUsize,
}

unsafe impl Send for MallocInfo {}
unsafe impl Sync for MallocInfo {}

static MALLOC_INFO: MallocInfo = MallocInfo::new();

pub fn malloc_info() -> &'static MallocInfo {
    &MALLOC_INFO
}

impl MallocInfo {
    const fn new() -> Self {
        MallocInfo {
            inner: Mutex::new(CentralInner {
                free_lists: [NO_CHUNK; NUM_SIZE_CLASSES],
                quarantine: ChunkFifoList::new(),
                page_groups: [NO_GROUP; MAX_PAGE_GROUPS],
            }),
            n_page_groups: AtomicUsize::new(0),
            total_mmaped: AtomicUsize::new(0),
            allocated_since_status: AtomicUsize::new(0),
        }
    }

    /// Return a singly-linked list of exactly `n_chunks` AVAILABLE chunks
    /// of the given class, refilling from the OS as needed.
    ///
    /// # Safety
    /// The allocator must be initialized.
    pub unsafe fn allocate_chunks(
        &self,
        size_class: u8,
        n_chunks: usize,
        trace: &StackTrace,
    ) -> *mut ChunkHeader {
        let mut result = NO_CHUNK;
        let mut inner = self.inner.lock();
        for _ in 0..n_chunks {
            if inner.free_lists[size_class as usize].is_null() {
                let fresh = self.get_new_chunks(&mut inner, size_class, trace);
                inner.free_lists[size_class as usize] = fresh;
            }
            let t = inner.free_lists[size_class as usize];
            inner.free_lists[size_class as usize] = (*t).next;
            assert!((*t).state == CHUNK_AVAILABLE);
            (*t).next = result;
            result = t;
        }
        result
    }

    /// Splice a thread's quarantine into the central quarantine, then evict
    /// from the oldest end until the byte budget holds again. With
    /// `eat_free_lists` (thread teardown) the thread's free lists are also
    /// prepended to the matching central lists.
    ///
    /// # Safety
    /// `storage` must belong to the calling thread (or to a thread that can
    /// no longer run).
    pub unsafe fn swallow_thread_storage(
        &self,
        storage: &mut ThreadMallocStorage,
        eat_free_lists: bool,
    ) {
        debug_assert!(config::quarantine_size() > 0);
        let mut inner = self.inner.lock();
        if storage.quarantine.byte_size() > 0 {
            let q = &mut storage.quarantine;
            inner.quarantine.push_list(q);
            while inner.quarantine.byte_size() > config::quarantine_size() {
                Self::pop_quarantine(&mut inner);
            }
        }
        if eat_free_lists {
            for size_class in 0..NUM_SIZE_CLASSES {
                let mut m = storage.free_lists[size_class];
                while !m.is_null() {
                    let t = (*m).next;
                    (*m).next = inner.free_lists[size_class];
                    inner.free_lists[size_class] = m;
                    m = t;
                }
                storage.free_lists[size_class] = NO_CHUNK;
            }
        }
    }

    /// Quarantine a single chunk directly, for contexts with no current
    /// thread. Applies the same eviction loop as a bulk splice.
    ///
    /// # Safety
    /// `chunk` must be a QUARANTINE-state chunk owned by the caller.
    pub unsafe fn bypass_thread_quarantine(&self, chunk: *mut ChunkHeader) {
        let mut inner = self.inner.lock();
        inner.quarantine.push(chunk);
        while inner.quarantine.byte_size() > config::quarantine_size() {
            Self::pop_quarantine(&mut inner);
        }
    }

    /// Reverse-map `addr` to the chunk whose region (or redzone) it falls
    /// in. Null if `addr` is not in any page group.
    ///
    /// # Safety
    /// The allocator must be initialized.
    pub unsafe fn find_malloced_or_freed(&self, addr: usize) -> *mut ChunkHeader {
        let inner = self.inner.lock();
        Self::find_chunk_by_addr(&inner, addr)
    }

    /// User size of `ptr` iff it is a live allocation of ours, else 0.
    ///
    /// # Safety
    /// The allocator must be initialized.
    pub unsafe fn allocation_size(&self, ptr: usize) -> usize {
        let inner = self.inner.lock();
        // First make sure this is our memory at all; a wild header read
        // would be worse than a wrong answer.
        if Self::find_page_group(&inner, ptr).is_null() {
            return 0;
        }
        let m = ptr_to_chunk(ptr);
        if (*m).state == CHUNK_ALLOCATED {
            (*m).used_size
        } else {
            0
        }
    }

    /// Whether `addr` falls inside any page group.
    ///
    /// # Safety
    /// The allocator must be initialized.
    pub unsafe fn owns_address(&self, addr: usize) -> bool {
        let inner = self.inner.lock();
        !Self::find_page_group(&inner, addr).is_null()
    }

    /// Bytes obtained from the OS for chunk carving.
    pub fn total_mmaped(&self) -> usize {
        self.total_mmaped.load(Ordering::Relaxed)
    }

    /// Account `size` freshly allocated bytes and emit a status event once
    /// the configured interval has accumulated.
    pub fn note_allocation(&self, size: usize) {
        let interval = config::stats_interval();
        if interval == 0 {
            return;
        }
        let total = self.allocated_since_status.fetch_add(size, Ordering::Relaxed) + size;
        if total > (1usize << interval.min(63)) {
            self.allocated_since_status.store(0, Ordering::Relaxed);
            let (quarantine_bytes, free_list_bytes) = self.byte_totals();
            report::emit(&ReportEvent::Status {
                quarantine_bytes,
                free_list_bytes,
            });
        }
    }

    /// (quarantine bytes, total free-list bytes) under the lock.
    pub fn byte_totals(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        let mut free_bytes = 0;
        for size_class in 0..NUM_SIZE_CLASSES {
            let mut m = inner.free_lists[size_class];
            while !m.is_null() {
                unsafe {
                    free_bytes += (*m).size();
                    m = (*m).next;
                }
            }
        }
        (inner.quarantine.byte_size(), free_bytes)
    }

    /// Free-list bytes for one class, under the lock.
    pub fn free_list_bytes(&self, size_class: u8) -> usize {
        let inner = self.inner.lock();
        let mut bytes = 0;
        let mut m = inner.free_lists[size_class as usize];
        while !m.is_null() {
            unsafe {
                bytes += (*m).size();
                m = (*m).next;
            }
        }
        bytes
    }

    fn find_page_group(inner: &CentralInner, addr: usize) -> *mut PageGroup {
        // Linear scan. Groups are 4 MiB+ each, so the count stays small;
        // a sorted interval tree would replace this if it ever doesn't.
        let n = MALLOC_INFO.n_page_groups.load(Ordering::Relaxed);
        for i in 0..n {
            let g = inner.page_groups[i];
            if unsafe { (*g).in_range(addr) } {
                return g;
            }
        }
        ptr::null_mut()
    }

    unsafe fn find_chunk_by_addr(inner: &CentralInner, addr: usize) -> *mut ChunkHeader {
        let g = Self::find_page_group(inner, addr);
        if g.is_null() {
            return NO_CHUNK;
        }
        let g = &*g;
        debug_assert!(g.chunk_size > 0);
        let offset_from_beg = addr - g.beg;
        let this_chunk_addr = g.beg + (offset_from_beg / g.chunk_size) * g.chunk_size;
        debug_assert!(g.in_range(this_chunk_addr));
        let m = this_chunk_addr as *mut ChunkHeader;
        debug_assert!(
            (*m).state == CHUNK_ALLOCATED
                || (*m).state == CHUNK_AVAILABLE
                || (*m).state == CHUNK_QUARANTINE
        );
        if (*m).addr_is_inside(addr, 1).is_some() || (*m).addr_is_at_right(addr, 1).is_some() {
            return m;
        }
        let offset = match (*m).addr_is_at_left(addr, 1) {
            Some(off) => off,
            None => {
                debug_assert!(false, "address not attributable to its chunk");
                return m;
            }
        };
        if this_chunk_addr == g.beg {
            // Leftmost chunk: there is no previous chunk to blame.
            return m;
        }
        let left_chunk_addr = this_chunk_addr - g.chunk_size;
        debug_assert!(g.in_range(left_chunk_addr));
        let l = left_chunk_addr as *mut ChunkHeader;
        // The address sits between two user regions; attribute it to the
        // closer one.
        match (*l).addr_is_at_right(addr, 1) {
            Some(l_offset) if l_offset < offset => l,
            _ => m,
        }
    }

    /// Pop the oldest quarantined chunk and hand it back to its class free
    /// list.
    unsafe fn pop_quarantine(inner: &mut CentralInner) {
        debug_assert!(inner.quarantine.byte_size() > 0);
        let m = inner.quarantine.pop();
        assert!(!m.is_null());
        assert!((*m).state == CHUNK_QUARANTINE);
        (*m).state = CHUNK_AVAILABLE;
        assert!((*m).alloc_tid >= 0);
        assert!((*m).free_tid >= 0);
        let size_class = (*m).size_class as usize;
        (*m).next = inner.free_lists[size_class];
        inner.free_lists[size_class] = m;
    }

    /// Obtain a fresh mapping, carve it into AVAILABLE chunks of the class,
    /// plant the page-group descriptor, and return the chunk list.
    unsafe fn get_new_chunks(
        &self,
        inner: &mut CentralInner,
        size_class: u8,
        trace: &StackTrace,
    ) -> *mut ChunkHeader {
        let size = class_to_size(size_class);
        debug_assert!(MIN_MMAP_SIZE.is_power_of_two());
        debug_assert!(size < MIN_MMAP_SIZE || size % MIN_MMAP_SIZE == 0);
        let mut mmap_size = size.max(MIN_MMAP_SIZE);
        let mut n_chunks = mmap_size / size;
        debug_assert!(n_chunks * size == mmap_size);
        if size < PAGE_SIZE {
            // Sub-page chunks: sacrifice the last slot for the descriptor.
            n_chunks -= 1;
        } else {
            // Large chunks: append one page for the descriptor.
            mmap_size += PAGE_SIZE;
        }
        debug_assert!(n_chunks > 0);
        let mem = self.mmap_new_pages_and_poison_shadow(mmap_size, trace);

        let mut res = NO_CHUNK;
        for i in 0..n_chunks {
            let m = mem.add(i * size) as *mut ChunkHeader;
            (*m).state = CHUNK_AVAILABLE;
            (*m).size_class = size_class;
            (*m).next = res;
            res = m;
        }

        // The descriptor region's shadow is already poisoned with the rest
        // of the mapping.
        let pg = mem.add(n_chunks * size) as *mut PageGroup;
        (*pg).beg = mem as usize;
        (*pg).end = mem as usize + mmap_size;
        (*pg).chunk_size = size;
        let idx = self.n_page_groups.fetch_add(1, Ordering::Relaxed);
        assert!(idx < MAX_PAGE_GROUPS);
        inner.page_groups[idx] = pg;

        res
    }

    unsafe fn mmap_new_pages_and_poison_shadow(
        &self,
        size: usize,
        trace: &StackTrace,
    ) -> *mut u8 {
        debug_assert!(is_aligned(size, PAGE_SIZE));
        let mem = platform::map_anonymous(size);
        if mem.is_null() {
            report::emit(&ReportEvent::OutOfMemory {
                context: "mmap of chunk storage",
                size,
                tid: thread::current_tid(),
                trace: Some(trace),
            });
            report::die();
        }
        self.total_mmaped.fetch_add(size, Ordering::Relaxed);
        shadow::poison(mem as usize, size, HEAP_LEFT_REDZONE_MAGIC);
        if config::debug() {
            report::emit(&ReportEvent::MmapRange {
                beg: mem as usize,
                end: mem as usize + size,
            });
        }
        mem
    }
}
