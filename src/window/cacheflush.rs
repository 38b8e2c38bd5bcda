//! Explicit cache-line flush discipline for the shared window
//!
//! The window has no hardware coherence between nodes. Every reader-visible
//! write is followed by a flush, every cross-node read is preceded by an
//! invalidate. On x86-class targets `clflush` both writes back and
//! invalidates, so one primitive serves both directions; the fence placement
//! differs:
//!
//! - flush: fence, then flush the lines (publish a completed write)
//! - invalidate: flush the lines, then fence (drop stale data before reading)
//! - hard flush: fence on both sides (two-sided initialization)

use std::sync::atomic::{fence, Ordering};

/// Cache line size in bytes; wire structs are padded to this
pub const CL_SIZE: usize = 64;

#[cfg(target_arch = "x86_64")]
#[inline]
fn flush_lines(addr: *const u8, len: usize) {
    use std::arch::x86_64::_mm_clflush;
    let mut off = 0;
    while off < len {
        unsafe { _mm_clflush(addr.add(off)) };
        off += CL_SIZE;
    }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
fn flush_lines(_addr: *const u8, _len: usize) {
    // No portable line flush; the fences below still order the accesses.
}

/// Publish `len` bytes at `addr` to other nodes
#[inline]
pub fn flush(addr: *const u8, len: usize) {
    fence(Ordering::SeqCst);
    flush_lines(addr, len);
}

/// Drop locally cached copies of `len` bytes at `addr` before reading
#[inline]
pub fn invalidate(addr: *const u8, len: usize) {
    flush_lines(addr, len);
    fence(Ordering::SeqCst);
}

/// Two-sided flush used when initializing a region
#[inline]
pub fn hard_flush(addr: *const u8, len: usize) {
    fence(Ordering::SeqCst);
    flush_lines(addr, len);
    fence(Ordering::SeqCst);
}
