use crate::util::{DEFAULT_QUARANTINE_SIZE, DEFAULT_REDZONE};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Cached config values (read once at init, never re-read).
static REDZONE: AtomicUsize = AtomicUsize::new(DEFAULT_REDZONE);
static QUARANTINE_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_QUARANTINE_SIZE);
static VERBOSITY: AtomicUsize = AtomicUsize::new(0);
static STATS_INTERVAL: AtomicUsize = AtomicUsize::new(0);
static DEBUG: AtomicBool = AtomicBool::new(false);
static REALLOC_ZERO_FREES: AtomicBool = AtomicBool::new(false);

/// Read configuration from environment variables.
/// Must be called during init, before any allocations.
///
/// # Safety
/// Calls `libc::getenv`, which is not thread-safe, so must be called from
/// the single-threaded init path.
pub unsafe fn read_config() {
    if let Some(val) = getenv_usize(b"SHADOWMALLOC_REDZONE\0") {
        REDZONE.store(val, Ordering::Relaxed);
    }
    if let Some(val) = getenv_usize(b"SHADOWMALLOC_QUARANTINE_SIZE\0") {
        QUARANTINE_SIZE.store(val, Ordering::Relaxed);
    }
    if let Some(val) = getenv_usize(b"SHADOWMALLOC_VERBOSITY\0") {
        VERBOSITY.store(val, Ordering::Relaxed);
    }
    if let Some(val) = getenv_usize(b"SHADOWMALLOC_STATS\0") {
        STATS_INTERVAL.store(val, Ordering::Relaxed);
    }
    if let Some(val) = getenv_usize(b"SHADOWMALLOC_DEBUG\0") {
        DEBUG.store(val != 0, Ordering::Relaxed);
    }
    if let Some(val) = getenv_usize(b"SHADOWMALLOC_REALLOC_ZERO_FREES\0") {
        REALLOC_ZERO_FREES.store(val != 0, Ordering::Relaxed);
    }
}

/// Redzone width in bytes. Constant after init.
#[inline]
pub fn redzone() -> usize {
    REDZONE.load(Ordering::Relaxed)
}

/// Central quarantine byte budget.
#[inline]
pub fn quarantine_size() -> usize {
    QUARANTINE_SIZE.load(Ordering::Relaxed)
}

#[inline]
pub fn verbosity() -> usize {
    VERBOSITY.load(Ordering::Relaxed)
}

/// Stats-emission interval exponent; a status event is emitted every
/// `1 << stats_interval()` allocated bytes. 0 disables emission.
#[inline]
pub fn stats_interval() -> usize {
    STATS_INTERVAL.load(Ordering::Relaxed)
}

#[inline]
pub fn debug() -> bool {
    DEBUG.load(Ordering::Relaxed)
}

/// Whether `realloc(p, 0)` frees `p`. Off by default: the historical
/// behavior is to return null and leave `p` live.
#[inline]
pub fn realloc_zero_frees() -> bool {
    REALLOC_ZERO_FREES.load(Ordering::Relaxed)
}

/// Parse an environment variable as a usize.
///
/// # Safety
/// Calls `libc::getenv`.
unsafe fn getenv_usize(key: &[u8]) -> Option<usize> {
    let val = libc::getenv(key.as_ptr() as *const libc::c_char);
    if val.is_null() {
        return None;
    }

    // Parse manually; no allocation, no locale.
    let mut result: usize = 0;
    let mut ptr = val as *const u8;
    loop {
        let byte = *ptr;
        if byte == 0 {
            break;
        }
        if !byte.is_ascii_digit() {
            return None;
        }
        result = result.checked_mul(10)?.checked_add((byte - b'0') as usize)?;
        ptr = ptr.add(1);
    }
    Some(result)
}
