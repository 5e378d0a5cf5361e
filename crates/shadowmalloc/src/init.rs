use crate::chunk::ChunkHeader;
use crate::util::SHADOW_GRANULARITY;
use crate::{config, shadow};
use core::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

static INIT_STATE: AtomicU8 = AtomicU8::new(UNINIT);

/// One-shot initialization: read config, validate the redzone, map the
/// shadow L1. Every entry point calls this; concurrent callers spin until
/// the winner finishes.
pub fn ensure_initialized() {
    match INIT_STATE.compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {}
        Err(_) => {
            while INIT_STATE.load(Ordering::Acquire) != READY {
                core::hint::spin_loop();
            }
            return;
        }
    }

    unsafe {
        config::read_config();
    }

    let redzone = config::redzone();
    assert!(
        redzone.is_power_of_two()
            && redzone >= SHADOW_GRANULARITY
            && redzone >= core::mem::size_of::<ChunkHeader>(),
        "redzone must be a power of two no smaller than the shadow granule and the chunk header"
    );
    assert!(config::quarantine_size() > 0, "quarantine budget must be nonzero");

    let ok = unsafe { shadow::init() };
    assert!(ok, "failed to map the shadow L1 table");

    INIT_STATE.store(READY, Ordering::Release);
}
