#![no_main]

use libfuzzer_sys::fuzz_target;
use shadowmalloc::api;
use shadowmalloc::trace::StackTrace;

/// Interpret the input as a sequence of allocator operations.
///
/// Each operation is encoded as:
///   byte 0: opcode (0=malloc, 1=free, 2=realloc, 3=calloc, 4=memalign)
///   byte 1-2: size (little-endian u16)
///   byte 3: slot index (which tracked pointer to operate on)
///
/// We track up to 64 live pointers and verify shadow/size invariants as we
/// go.
const MAX_SLOTS: usize = 64;

fuzz_target!(|data: &[u8]| {
    let trace = StackTrace::from_pcs(&[0xf00d]);
    let mut slots: [*mut u8; MAX_SLOTS] = [std::ptr::null_mut(); MAX_SLOTS];
    let mut sizes: [usize; MAX_SLOTS] = [0; MAX_SLOTS];

    let mut i = 0;
    while i + 4 <= data.len() {
        let opcode = data[i] % 5;
        let size = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
        let slot = (data[i + 3] as usize) % MAX_SLOTS;
        i += 4;

        unsafe {
            match opcode {
                0 => {
                    if !slots[slot].is_null() {
                        api::free(slots[slot], &trace);
                    }
                    let p = api::malloc(size, &trace);
                    assert!(!p.is_null());
                    let effective = if size == 0 { 1 } else { size };
                    assert_eq!(api::mz_size(p), effective);
                    std::ptr::write_bytes(p, 0xaa, effective.min(256));
                    slots[slot] = p;
                    sizes[slot] = effective;
                }
                1 => {
                    if !slots[slot].is_null() {
                        api::free(slots[slot], &trace);
                        assert_eq!(api::mz_size(slots[slot]), 0);
                        slots[slot] = std::ptr::null_mut();
                        sizes[slot] = 0;
                    }
                }
                2 => {
                    if size == 0 {
                        // Default config: realloc(p, 0) leaves p live.
                        continue;
                    }
                    let p = api::realloc(slots[slot], size, &trace);
                    assert!(!p.is_null());
                    assert_eq!(api::mz_size(p), size);
                    slots[slot] = p;
                    sizes[slot] = size;
                }
                3 => {
                    if !slots[slot].is_null() {
                        api::free(slots[slot], &trace);
                    }
                    let nmemb = (size >> 8).max(1);
                    let elem_size = (size & 0xff).max(1);
                    let p = api::calloc(nmemb, elem_size, &trace);
                    assert!(!p.is_null());
                    let total = nmemb * elem_size;
                    for j in 0..total.min(256) {
                        assert_eq!(*p.add(j), 0, "calloc memory not zeroed at {}", j);
                    }
                    slots[slot] = p;
                    sizes[slot] = total;
                }
                4 => {
                    if !slots[slot].is_null() {
                        api::free(slots[slot], &trace);
                    }
                    let alignment = 1usize << (8 + (size % 5)); // 256..4096
                    let p = api::memalign(alignment, size, &trace);
                    assert!(!p.is_null());
                    assert_eq!(p as usize % alignment, 0);
                    slots[slot] = p;
                    sizes[slot] = if size == 0 { 1 } else { size };
                }
                _ => unreachable!(),
            }
        }
    }

    unsafe {
        for slot in &mut slots {
            if !slot.is_null() {
                api::free(*slot, &trace);
                *slot = std::ptr::null_mut();
            }
        }
    }
});
