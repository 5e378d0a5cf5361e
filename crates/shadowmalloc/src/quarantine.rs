//! FIFO of freed chunks, accounted in chunk bytes (not user bytes).
//!
//! Freed chunks linger here before becoming reusable so that stale pointers
//! keep dereferencing poisoned shadow for as long as possible. Order is
//! strictly first-in first-out; splicing one list onto another preserves
//! the relative order of both.

use crate::chunk::ChunkHeader;
use core::ptr;

pub struct ChunkFifoList {
    first: *mut ChunkHeader,
    last: *mut ChunkHeader,
    bytes: usize,
}

impl ChunkFifoList {
    pub const fn new() -> Self {
        ChunkFifoList {
            first: ptr::null_mut(),
            last: ptr::null_mut(),
            bytes: 0,
        }
    }

    /// Sum of the chunk sizes currently queued.
    #[inline]
    pub fn byte_size(&self) -> usize {
        self.bytes
    }

    /// Append one chunk. The chunk must not be linked anywhere else.
    ///
    /// # Safety
    /// `n` must point to a valid chunk header owned by the caller.
    pub unsafe fn push(&mut self, n: *mut ChunkHeader) {
        debug_assert!((*n).next.is_null());
        if !self.last.is_null() {
            debug_assert!(!self.first.is_null());
            debug_assert!((*self.last).next.is_null());
            (*self.last).next = n;
            self.last = n;
        } else {
            debug_assert!(self.first.is_null());
            self.first = n;
            self.last = n;
        }
        self.bytes += (*n).size();
    }

    /// Splice all of `other` onto the tail of `self`, leaving `other`
    /// empty. Ownership of every queued chunk transfers.
    ///
    /// # Safety
    /// Both lists must be well formed and disjoint.
    pub unsafe fn push_list(&mut self, other: &mut ChunkFifoList) {
        if other.first.is_null() {
            return;
        }
        if !self.last.is_null() {
            debug_assert!(!self.first.is_null());
            debug_assert!((*self.last).next.is_null());
            (*self.last).next = other.first;
            self.last = other.last;
        } else {
            debug_assert!(self.first.is_null());
            self.first = other.first;
            self.last = other.last;
        }
        self.bytes += other.bytes;
        other.first = ptr::null_mut();
        other.last = ptr::null_mut();
        other.bytes = 0;
    }

    /// Detach and return the oldest chunk. The list must be non-empty.
    ///
    /// # Safety
    /// The list must be well formed.
    pub unsafe fn pop(&mut self) -> *mut ChunkHeader {
        assert!(!self.first.is_null());
        let res = self.first;
        self.first = (*res).next;
        if self.first.is_null() {
            self.last = ptr::null_mut();
        }
        (*res).next = ptr::null_mut();
        debug_assert!(self.bytes >= (*res).size());
        self.bytes -= (*res).size();
        res
    }
}
