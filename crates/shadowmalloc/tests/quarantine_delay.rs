//! The quarantine-delay guarantee: a freed chunk is not handed out again
//! until at least a central-budget's worth of bytes has been freed after
//! it, process-wide.

use shadowmalloc::api;
use shadowmalloc::trace::StackTrace;

const BUDGET: usize = 1 << 20; // 1 MiB central quarantine

/// Exactly the 2 KiB size class (see quarantine_flow.rs).
const USER_SIZE: usize = 1900;
const CHUNK_SIZE: usize = 2048;

fn setup() {
    std::env::set_var("SHADOWMALLOC_QUARANTINE_SIZE", BUDGET.to_string());
    shadowmalloc::__test_support::ensure_initialized();
}

fn test_trace() -> StackTrace {
    StackTrace::from_pcs(&[0x6006])
}

#[test]
fn freed_chunk_is_not_reused_before_the_budget_drains() {
    setup();
    unsafe {
        let p = api::malloc(USER_SIZE, &test_trace());
        assert!(!p.is_null());
        api::free(p, &test_trace());

        // Free a budget's worth of other chunks; until that point, no
        // allocation may return p's chunk. (The user address of a plain
        // allocation is determined by the chunk address, so comparing user
        // pointers compares chunks.)
        let mut freed_since = 0usize;
        let mut reused_early = false;
        while freed_since + CHUNK_SIZE < BUDGET {
            let q = api::malloc(USER_SIZE, &test_trace());
            if q == p {
                reused_early = true;
                break;
            }
            api::free(q, &test_trace());
            freed_since += CHUNK_SIZE;
        }
        assert!(
            !reused_early,
            "chunk recycled after only {} freed bytes (budget {})",
            freed_since, BUDGET
        );
    }
}
