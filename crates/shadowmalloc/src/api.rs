//! Public entry points. Each takes the caller-captured stack trace where a
//! diagnostic may later need it; capture itself is the host's concern.
//!
//! Every allocation is redzone-wrapped and shadow-tracked; every free goes
//! through quarantine. See the module docs of `central` and `chunk` for the
//! layout discipline.

use crate::central::malloc_info;
use crate::chunk::{
    ptr_to_chunk, ChunkHeader, CHUNK_ALLOCATED, CHUNK_AVAILABLE, CHUNK_MEMALIGN, CHUNK_QUARANTINE,
};
use crate::report::{self, ReportEvent};
use crate::size_class::{class_to_size, size_to_class};
use crate::trace::StackTrace;
use crate::util::{
    align_up, is_aligned, HEAP_FREE_MAGIC, INVALID_TID, MAX_ALLOWED_MALLOC_SIZE,
    MAX_SIZE_FOR_THREAD_LOCAL_FREE_LIST, MAX_THREAD_LOCAL_QUARANTINE, PAGE_SIZE,
};
use crate::{config, init, shadow, thread};
use core::ptr;

/// Allocate `size` bytes aligned to `alignment` (0 or a power of two; 0
/// means the default redzone alignment). Size 0 is promoted to 1.
///
/// # Safety
/// The returned pointer is raw memory; the caller owns its lifecycle.
unsafe fn allocate(alignment: usize, size: usize, trace: &StackTrace) -> *mut u8 {
    init::ensure_initialized();
    let size = if size == 0 { 1 } else { size };
    assert!(alignment == 0 || alignment.is_power_of_two());

    let redzone = config::redzone();
    let rounded_size = align_up(size, redzone);
    let mut needed_size = rounded_size + redzone;
    if alignment > redzone {
        needed_size += alignment;
    }
    debug_assert!(is_aligned(needed_size, redzone));
    if needed_size > MAX_ALLOWED_MALLOC_SIZE {
        report::emit(&ReportEvent::OutOfMemory {
            context: "allocation request",
            size,
            tid: thread::current_tid(),
            trace: Some(trace),
        });
        report::die();
    }

    let size_class = size_to_class(needed_size);
    let size_to_allocate = class_to_size(size_class);
    debug_assert!(size_to_allocate >= redzone * 2);
    debug_assert!(size_to_allocate >= needed_size);
    debug_assert!(is_aligned(size_to_allocate, redzone));

    if config::verbosity() >= 2 {
        report::write_stderr(&format!(
            "shadowmalloc: allocate align {} size {} class {} chunk {}\n",
            alignment, size, size_class, size_to_allocate
        ));
    }
    malloc_info().note_allocation(size);

    let m = if size_to_allocate >= MAX_SIZE_FOR_THREAD_LOCAL_FREE_LIST {
        // Large classes skip the cache; one chunk straight from central.
        None
    } else {
        thread::with_current(|t| unsafe {
            let fl = &mut t.storage.free_lists[size_class as usize];
            if fl.is_null() {
                let n_new_chunks = MAX_SIZE_FOR_THREAD_LOCAL_FREE_LIST / size_to_allocate;
                *fl = malloc_info().allocate_chunks(size_class, n_new_chunks, trace);
            }
            let m = *fl;
            *fl = (*m).next;
            m
        })
    };
    let m = match m {
        Some(m) => m,
        None => malloc_info().allocate_chunks(size_class, 1, trace),
    };
    assert!(!m.is_null());
    assert!((*m).state == CHUNK_AVAILABLE);
    (*m).state = CHUNK_ALLOCATED;
    (*m).next = ptr::null_mut();
    debug_assert!((*m).size() == size_to_allocate);

    let mut addr = m as usize + redzone;
    if alignment > redzone && !is_aligned(addr, alignment) {
        addr = align_up(addr, alignment);
        debug_assert!(is_aligned(addr, alignment));
        // Plant a forwarder so that ptr_to_chunk(addr) finds the real
        // header.
        let p = (addr - redzone) as *mut ChunkHeader;
        (*p).state = CHUNK_MEMALIGN;
        (*p).next = m;
    }
    debug_assert!(ptr_to_chunk(addr) == m);

    (*m).used_size = size;
    (*m).offset = (addr - m as usize) as u32;
    debug_assert!((*m).beg() == addr);
    (*m).alloc_tid = thread::current_tid();
    (*m).free_tid = INVALID_TID;
    let (alloc_slots, alloc_len) = (*m).compressed_alloc_stack();
    trace.compress_into(alloc_slots, alloc_len);

    shadow::poison(addr, rounded_size, 0);
    if size < rounded_size {
        shadow::poison_partial_right_redzone(
            addr + rounded_size - redzone,
            size & (redzone - 1),
            redzone,
        );
    }
    addr as *mut u8
}

/// Free `ptr`. Null is a no-op.
///
/// # Safety
/// `ptr` must be null or a live pointer returned by this allocator.
unsafe fn deallocate(ptr: *mut u8, trace: &StackTrace) {
    if ptr.is_null() {
        return;
    }
    init::ensure_initialized();

    if config::debug() {
        assert!(malloc_info().owns_address(ptr as usize));
    }

    let m = ptr_to_chunk(ptr as usize);
    if (*m).state == CHUNK_QUARANTINE {
        report::emit(&ReportEvent::DoubleFree {
            addr: ptr as usize,
            trace,
        });
        let description = (*m).describe_address(ptr as usize, 1);
        report::emit(&ReportEvent::HeapAddress(&description));
        report::die();
    } else if (*m).state != CHUNK_ALLOCATED {
        report::emit(&ReportEvent::FreeNotMalloced {
            addr: ptr as usize,
            trace,
        });
        report::die();
    }
    debug_assert!((*m).free_tid == INVALID_TID);
    debug_assert!((*m).alloc_tid >= 0);
    (*m).free_tid = thread::current_tid();
    // The free trace clobbers the first user bytes; they are about to be
    // poisoned anyway.
    let (free_slots, free_len) = (*m).compressed_free_stack();
    trace.compress_into(free_slots, free_len);

    let redzone = config::redzone();
    let rounded_size = align_up((*m).used_size, redzone);
    shadow::poison(ptr as usize, rounded_size, HEAP_FREE_MAGIC);
    (*m).state = CHUNK_QUARANTINE;

    let pushed = thread::with_current(|t| unsafe {
        debug_assert!((*m).next.is_null());
        t.storage.quarantine.push(m);
        if t.storage.quarantine.byte_size() > MAX_THREAD_LOCAL_QUARANTINE {
            malloc_info().swallow_thread_storage(&mut t.storage, false);
        }
    });
    if pushed.is_none() {
        // No current thread (early init or TLS teardown): central path.
        debug_assert!((*m).next.is_null());
        malloc_info().bypass_thread_quarantine(m);
    }
}

/// # Safety
/// See `allocate`.
pub unsafe fn memalign(alignment: usize, size: usize, trace: &StackTrace) -> *mut u8 {
    allocate(alignment, size, trace)
}

/// # Safety
/// See `allocate`.
pub unsafe fn malloc(size: usize, trace: &StackTrace) -> *mut u8 {
    allocate(0, size, trace)
}

/// Allocate and zero `nmemb * size` bytes.
///
/// # Safety
/// See `allocate`.
pub unsafe fn calloc(nmemb: usize, size: usize, trace: &StackTrace) -> *mut u8 {
    let total = match nmemb.checked_mul(size) {
        Some(total) => total,
        None => {
            // An impossible request; route it to the fatal OOM diagnostic
            // rather than truncating silently.
            init::ensure_initialized();
            report::emit(&ReportEvent::OutOfMemory {
                context: "calloc product overflow",
                size: usize::MAX,
                tid: thread::current_tid(),
                trace: Some(trace),
            });
            report::die();
        }
    };
    let res = allocate(0, total, trace);
    ptr::write_bytes(res, 0, total);
    res
}

/// # Safety
/// See `deallocate`.
pub unsafe fn free(ptr: *mut u8, trace: &StackTrace) {
    deallocate(ptr, trace);
}

/// Grow or shrink `ptr` to `size` bytes by allocate-copy-free.
/// `realloc(null, n)` allocates; `realloc(p, 0)` returns null and, unless
/// configured otherwise, leaves `p` live.
///
/// # Safety
/// `ptr` must be null or a live pointer returned by this allocator.
pub unsafe fn realloc(ptr: *mut u8, size: usize, trace: &StackTrace) -> *mut u8 {
    if ptr.is_null() {
        return allocate(0, size, trace);
    }
    if size == 0 {
        if config::realloc_zero_frees() {
            deallocate(ptr, trace);
        }
        return ptr::null_mut();
    }
    let m = ptr_to_chunk(ptr as usize);
    assert!((*m).state == CHUNK_ALLOCATED);
    let old_size = (*m).used_size;
    let copy_size = size.min(old_size);
    let new_ptr = allocate(0, size, trace);
    ptr::copy_nonoverlapping(ptr, new_ptr, copy_size);
    deallocate(ptr, trace);
    new_ptr
}

/// Page-aligned allocation.
///
/// # Safety
/// See `allocate`.
pub unsafe fn valloc(size: usize, trace: &StackTrace) -> *mut u8 {
    allocate(PAGE_SIZE, size, trace)
}

/// Page-aligned allocation of whole pages; size 0 becomes one page.
///
/// # Safety
/// See `allocate`.
pub unsafe fn pvalloc(size: usize, trace: &StackTrace) -> *mut u8 {
    let mut size = align_up(size, PAGE_SIZE);
    if size == 0 {
        size = PAGE_SIZE;
    }
    allocate(PAGE_SIZE, size, trace)
}

/// # Safety
/// `memptr` must be valid for a pointer write; see `allocate` for the rest.
pub unsafe fn posix_memalign(
    memptr: *mut *mut u8,
    alignment: usize,
    size: usize,
    trace: &StackTrace,
) -> i32 {
    let res = allocate(alignment, size, trace);
    debug_assert!(is_aligned(res as usize, alignment.max(1)));
    *memptr = res;
    0
}

/// User size of `ptr` iff it is a live allocation of ours, else 0.
///
/// # Safety
/// `ptr` may be any address.
pub unsafe fn mz_size(ptr: *const u8) -> usize {
    init::ensure_initialized();
    malloc_info().allocation_size(ptr as usize)
}

/// Reverse-map `addr` and emit a structured description event naming the
/// owning region and its alloc/free history. Silent when `addr` is not in
/// any page group.
///
/// # Safety
/// `addr` may be any address.
pub unsafe fn describe_heap_address(addr: usize, access_size: usize) {
    init::ensure_initialized();
    let m = malloc_info().find_malloced_or_freed(addr);
    if m.is_null() {
        return;
    }
    let description = (*m).describe_address(addr, access_size);
    report::emit(&ReportEvent::HeapAddress(&description));
}

/// Running byte total of chunk-carving mappings obtained from the OS.
pub fn total_mmaped() -> usize {
    malloc_info().total_mmaped()
}

/// Allocate a fake-stack frame of `size` bytes. Returns `real_stack`
/// unchanged when no current thread is available.
///
/// # Safety
/// The allocator must be usable; `size` must not exceed the maximum frame
/// size.
pub unsafe fn stack_malloc(size: usize, real_stack: usize) -> usize {
    init::ensure_initialized();
    thread::with_current(|t| unsafe { t.fake_stack.allocate(size) }).unwrap_or(real_stack)
}

/// Return a fake-stack frame. A no-op when `ptr == real_stack` (the
/// matching `stack_malloc` fell back to the real stack) or when the
/// thread's fake stack is already gone.
///
/// # Safety
/// `ptr` must be a frame from `stack_malloc(size, real_stack)` on this
/// thread.
pub unsafe fn stack_free(ptr: usize, size: usize, real_stack: usize) {
    if ptr == real_stack {
        return;
    }
    let _ = thread::with_current(|t| unsafe { t.fake_stack.deallocate(ptr, size) });
}
