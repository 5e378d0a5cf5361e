//! Central quarantine eviction under a small byte budget: freed chunks
//! move oldest-first from quarantine to the class free lists once the
//! budget overflows, and the newest frees stay quarantined.

use shadowmalloc::api;
use shadowmalloc::chunk::{ChunkHeader, CHUNK_AVAILABLE, CHUNK_QUARANTINE};
use shadowmalloc::trace::StackTrace;

const BUDGET: usize = 1 << 20; // 1 MiB central quarantine
const REDZONE: usize = 128;

/// malloc(1900) needs 1900 -> 1920 + 128 = 2048: exactly the 2 KiB class.
const USER_SIZE: usize = 1900;
const CHUNK_SIZE: usize = 2048;
const CHUNK_CLASS: u8 = 11;

fn setup() {
    std::env::set_var("SHADOWMALLOC_QUARANTINE_SIZE", BUDGET.to_string());
    shadowmalloc::__test_support::ensure_initialized();
}

fn test_trace() -> StackTrace {
    StackTrace::from_pcs(&[0x5005])
}

#[test]
fn eviction_recycles_oldest_frees_first() {
    setup();
    unsafe {
        // Allocate and free twice the budget in chunk bytes, in order.
        let n = 2 * BUDGET / CHUNK_SIZE;
        let mut ptrs = Vec::with_capacity(n);
        for _ in 0..n {
            let p = api::malloc(USER_SIZE, &test_trace());
            assert!(!p.is_null());
            ptrs.push(p);
        }
        // Refills leave spare chunks on the central free list; measure
        // eviction as growth past this baseline.
        let base_free =
            shadowmalloc::__test_support::central_free_list_bytes_for_class(CHUNK_CLASS);
        for &p in &ptrs {
            api::free(p, &test_trace());
        }
        // Push the tail of the thread-local quarantine to central, as
        // thread teardown would.
        shadowmalloc::__test_support::flush_thread_storage(false);

        let quarantined = shadowmalloc::__test_support::central_quarantine_bytes();
        assert!(
            quarantined <= BUDGET,
            "central quarantine over budget: {}",
            quarantined
        );
        // At least a budget's worth of chunks must have been evicted back
        // to the 2 KiB free list.
        let free_bytes =
            shadowmalloc::__test_support::central_free_list_bytes_for_class(CHUNK_CLASS);
        assert!(
            free_bytes >= base_free + BUDGET,
            "expected >= {} evicted bytes, got {}",
            BUDGET,
            free_bytes - base_free
        );

        // Oldest free was evicted; newest is still quarantined.
        let first = &*((ptrs[0] as usize - REDZONE) as *const ChunkHeader);
        assert_eq!(first.state, CHUNK_AVAILABLE);
        let last = &*((ptrs[n - 1] as usize - REDZONE) as *const ChunkHeader);
        assert_eq!(last.state, CHUNK_QUARANTINE);
    }
}
