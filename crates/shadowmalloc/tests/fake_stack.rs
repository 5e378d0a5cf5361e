//! Fake-stack behavior: use-after-return poisoning, FIFO-delayed slot
//! recycling, and the real-stack fallback paths.

use shadowmalloc::api;
use shadowmalloc::shadow;
use shadowmalloc::util::STACK_AFTER_RETURN_MAGIC;

fn setup() {
    shadowmalloc::__test_support::ensure_initialized();
}

#[test]
fn returned_frame_is_after_return_poisoned() {
    setup();
    unsafe {
        let local = 0u64;
        let real_stack = &local as *const u64 as usize;
        let p = api::stack_malloc(64, real_stack);
        assert_ne!(p, real_stack);
        // Live frame: fully addressable, and writable like a real frame.
        assert_eq!(shadow::shadow_byte(p), 0);
        assert_eq!(shadow::shadow_byte(p + 56), 0);
        core::ptr::write_bytes(p as *mut u8, 0xcd, 64);

        api::stack_free(p, 64, real_stack);
        // The whole slot is poisoned after return.
        assert_eq!(shadow::shadow_byte(p), STACK_AFTER_RETURN_MAGIC);
        assert_eq!(shadow::shadow_byte(p + 56), STACK_AFTER_RETURN_MAGIC);
    }
}

#[test]
fn recycling_is_fifo_delayed() {
    setup();
    unsafe {
        let local = 0u64;
        let real_stack = &local as *const u64 as usize;
        let a = api::stack_malloc(256, real_stack);
        api::stack_free(a, 256, real_stack);
        // The freed slot goes to the back of its class FIFO; the next
        // frames come from the untouched front of the backing.
        for _ in 0..16 {
            let b = api::stack_malloc(256, real_stack);
            assert_ne!(b, a);
            api::stack_free(b, 256, real_stack);
        }
        assert_eq!(shadow::shadow_byte(a), STACK_AFTER_RETURN_MAGIC);
    }
}

#[test]
fn frame_sizes_route_to_their_classes() {
    setup();
    unsafe {
        let local = 0u64;
        let real_stack = &local as *const u64 as usize;
        // Frames of different classes come from different backings.
        let small = api::stack_malloc(64, real_stack);
        let medium = api::stack_malloc(1000, real_stack);
        let large = api::stack_malloc(60 * 1024, real_stack);
        assert_eq!(shadow::shadow_byte(small), 0);
        assert_eq!(shadow::shadow_byte(medium), 0);
        assert_eq!(shadow::shadow_byte(large), 0);
        api::stack_free(large, 60 * 1024, real_stack);
        api::stack_free(medium, 1000, real_stack);
        api::stack_free(small, 64, real_stack);
        assert_eq!(shadow::shadow_byte(medium), STACK_AFTER_RETURN_MAGIC);
    }
}

#[test]
fn fake_stack_membership_probe() {
    setup();
    unsafe {
        let local = 0u64;
        let real_stack = &local as *const u64 as usize;
        let p = api::stack_malloc(64, real_stack);
        let backing = shadowmalloc::thread::with_current(|t| {
            assert_ne!(t.fake_stack.addr_is_in_fake_stack(p), 0);
            assert_ne!(t.fake_stack.addr_is_in_fake_stack(p + 63), 0);
            assert_eq!(t.fake_stack.addr_is_in_fake_stack(real_stack), 0);
            t.fake_stack.addr_is_in_fake_stack(p)
        })
        .unwrap();
        assert!(backing <= p);
        api::stack_free(p, 64, real_stack);
    }
}

#[test]
fn real_stack_fallback_is_a_noop_pair() {
    setup();
    unsafe {
        let local = 0u64;
        let real_stack = &local as *const u64 as usize;
        // A frame "allocated" on the real stack is freed as a no-op.
        api::stack_free(real_stack, 64, real_stack);

        // With no current thread, stack_malloc falls back to the real
        // stack.
        shadowmalloc::__test_support::suppress_current_thread(true);
        let p = api::stack_malloc(64, real_stack);
        assert_eq!(p, real_stack);
        api::stack_free(p, 64, real_stack);
        shadowmalloc::__test_support::suppress_current_thread(false);
    }
}

#[test]
fn teardown_restores_shadow_and_unmaps() {
    setup();
    // Run on a dedicated thread so its fake stack is torn down at exit.
    let slot = std::thread::spawn(|| unsafe {
        let local = 0u64;
        let real_stack = &local as *const u64 as usize;
        let p = api::stack_malloc(64, real_stack);
        api::stack_free(p, 64, real_stack);
        p
    })
    .join()
    .unwrap();
    unsafe {
        // The class backing was unpoisoned before being unmapped; the slot
        // no longer reads as after-return memory.
        assert_eq!(shadow::shadow_byte(slot), 0);
    }
}
