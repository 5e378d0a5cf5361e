//! A redzone/quarantine heap allocator with a byte-per-granule shadow map,
//! built to make out-of-bounds and use-after-free accesses detectable at
//! the instruction level. Companion pieces (compiler instrumentation,
//! symbol interception, stack capture, report formatting) live in the
//! host; this crate is the allocator and poisoning engine.

extern crate libc;

pub mod api;
pub mod central;
pub mod chunk;
pub mod config;
pub mod fake_stack;
pub mod init;
pub mod platform;
pub mod quarantine;
pub mod report;
pub mod shadow;
pub mod size_class;
pub mod sync;
pub mod thread;
pub mod trace;
pub mod util;

/// Introspection hooks for the integration tests. Not part of the public
/// contract.
#[doc(hidden)]
pub mod __test_support {
    use crate::central::malloc_info;
    use crate::thread;

    pub fn ensure_initialized() {
        crate::init::ensure_initialized();
    }

    /// Total bytes parked in the central free lists.
    pub fn central_free_list_bytes() -> usize {
        malloc_info().byte_totals().1
    }

    /// Central free-list bytes for one size class.
    pub fn central_free_list_bytes_for_class(size_class: u8) -> usize {
        malloc_info().free_list_bytes(size_class)
    }

    /// Bytes currently held in the central quarantine.
    pub fn central_quarantine_bytes() -> usize {
        malloc_info().byte_totals().0
    }

    /// Bytes in the calling thread's quarantine.
    pub fn thread_quarantine_bytes() -> usize {
        thread::with_current(|t| t.storage.quarantine.byte_size()).unwrap_or(0)
    }

    /// Bytes in the calling thread's free lists.
    pub fn thread_free_list_bytes() -> usize {
        thread::with_current(|t| t.storage.free_list_bytes()).unwrap_or(0)
    }

    /// Splice the calling thread's quarantine (and, optionally, free lists)
    /// into the central allocator, as thread teardown would.
    pub fn flush_thread_storage(eat_free_lists: bool) {
        let _ = thread::with_current(|t| unsafe {
            malloc_info().swallow_thread_storage(&mut t.storage, eat_free_lists);
        });
    }

    /// Force the TLS-absent path: subsequent operations on this thread see
    /// no current thread.
    pub fn suppress_current_thread(on: bool) {
        thread::suppress_current_thread(on);
    }
}
