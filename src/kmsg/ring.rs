//! Single-producer single-consumer ring windows in shared memory
//!
//! Each ordered pair of nodes (sender, receiver) owns one ring laid out at a
//! deterministic offset in the shared window. The writer owns `head`, the
//! reader owns `tail`; each side observes the other's counter only after an
//! explicit cache invalidate, and publishes its own with a flush. Counters
//! are monotonic 64-bit values, so `head - tail` is the live message count
//! and `counter % RING_SLOTS` the slot index.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use log::warn;

use crate::error::CoherenceError;
use crate::kmsg::Message;
use crate::window::cacheflush::{self, CL_SIZE};
use crate::window::PAGE_SIZE;

/// Slots per ring; must be a power of two
pub const RING_SLOTS: usize = 65536;

const _: () = assert!(RING_SLOTS.is_power_of_two());

/// Byte offsets of the ring fields within its window region
const HEAD_OFF: usize = 0;
const TAIL_OFF: usize = 8;
const ENABLED_OFF: usize = 16;
/// Slot array starts on the next cache line after the control fields
const SLOTS_OFF: usize = CL_SIZE;

/// Total bytes a ring occupies before page rounding
pub const RING_BYTES: usize = SLOTS_OFF + RING_SLOTS * CL_SIZE;

/// Stride between consecutive (sender, receiver) ring windows
pub const fn ring_stride() -> u64 {
    (((RING_BYTES + PAGE_SIZE - 1) / PAGE_SIZE) * PAGE_SIZE) as u64
}

/// Offset of the (src, dst) ring within the ring area
pub const fn ring_offset(src: usize, dst: usize, node_count: usize) -> u64 {
    (src * node_count + dst) as u64 * ring_stride()
}

/// One SPSC ring mapped over shared-window memory
///
/// The struct itself holds only the base pointer; all state lives in the
/// window so both nodes observe the same bytes.
pub struct RingWindow {
    base: *mut u8,
}

unsafe impl Send for RingWindow {}
unsafe impl Sync for RingWindow {}

impl std::fmt::Debug for RingWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingWindow")
            .field("head", &self.head().load(Ordering::Relaxed))
            .field("tail", &self.tail().load(Ordering::Relaxed))
            .finish()
    }
}

impl RingWindow {
    /// Wrap a ring region at `base`
    ///
    /// # Safety
    /// `base` must point at `RING_BYTES` of mapped shared-window memory that
    /// no other object aliases as anything but a ring.
    pub unsafe fn from_base(base: *mut u8) -> Self {
        Self { base }
    }

    #[inline]
    fn head(&self) -> &AtomicU64 {
        unsafe { AtomicU64::from_ptr(self.base.add(HEAD_OFF).cast()) }
    }

    #[inline]
    fn tail(&self) -> &AtomicU64 {
        unsafe { AtomicU64::from_ptr(self.base.add(TAIL_OFF).cast()) }
    }

    #[inline]
    fn enabled(&self) -> &AtomicU8 {
        unsafe { AtomicU8::from_ptr(self.base.add(ENABLED_OFF)) }
    }

    #[inline]
    fn slot_ptr(&self, ticket: u64) -> *mut Message {
        let idx = (ticket & (RING_SLOTS as u64 - 1)) as usize;
        unsafe { self.base.add(SLOTS_OFF + idx * CL_SIZE).cast() }
    }

    /// Zero the ring and publish it; done once by the sending side
    pub fn init(&self) {
        self.head().store(0, Ordering::SeqCst);
        self.tail().store(0, Ordering::SeqCst);
        self.enabled().store(1, Ordering::SeqCst);
        unsafe {
            std::ptr::write_bytes(self.base.add(SLOTS_OFF), 0, RING_SLOTS * CL_SIZE);
        }
        cacheflush::hard_flush(self.base, RING_BYTES);
    }

    /// Messages currently in the ring
    #[inline]
    pub fn in_use(&self) -> u64 {
        self.head()
            .load(Ordering::SeqCst)
            .wrapping_sub(self.tail().load(Ordering::SeqCst))
    }

    /// Enqueue one message; sender side only
    ///
    /// Returns [`CoherenceError::RingFull`] when the ring already holds
    /// `RING_SLOTS - 1` messages; `tail` is left untouched.
    pub fn put(&self, msg: &Message) -> Result<(), CoherenceError> {
        msg.validate()?;

        // The reader owns tail; pull its latest value before judging space.
        cacheflush::invalidate(unsafe { self.base.add(TAIL_OFF) }, CL_SIZE);
        if self.in_use() >= RING_SLOTS as u64 - 1 {
            warn!("kmsg ring: window full, dropping message");
            return Err(CoherenceError::RingFull);
        }

        let ticket = self.head().load(Ordering::SeqCst);
        let slot = self.slot_ptr(ticket);
        unsafe { std::ptr::write_volatile(slot, *msg) };
        cacheflush::flush(slot.cast(), CL_SIZE);

        // fetch_add keeps the head update race-free should overlapping
        // writers ever be admitted on one ring.
        self.head().fetch_add(1, Ordering::SeqCst);
        cacheflush::flush(unsafe { self.base.add(HEAD_OFF) }, CL_SIZE);
        Ok(())
    }

    /// Dequeue one message; receiver side only
    pub fn get(&self) -> Option<Message> {
        // The writer owns head; pull its latest value before judging
        // emptiness.
        cacheflush::invalidate(unsafe { self.base.add(HEAD_OFF) }, CL_SIZE);
        if self.in_use() == 0 {
            return None;
        }

        let ticket = self.tail().load(Ordering::SeqCst);
        let slot = self.slot_ptr(ticket);
        cacheflush::invalidate(slot.cast(), CL_SIZE);
        let msg = unsafe { std::ptr::read_volatile(slot) };

        self.tail().fetch_add(1, Ordering::SeqCst);
        cacheflush::flush(unsafe { self.base.add(TAIL_OFF) }, CL_SIZE);
        Some(msg)
    }

    /// Whether the ring has been initialized by its sender
    pub fn is_enabled(&self) -> bool {
        cacheflush::invalidate(unsafe { self.base.add(ENABLED_OFF) }, CL_SIZE);
        self.enabled().load(Ordering::SeqCst) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmsg::{MsgHeader, Payload};
    use crate::window::SharedWindow;

    fn msg(seq: u64) -> Message {
        Message {
            header: MsgHeader {
                msg_type: 0,
                ws_id: seq as i32,
                from_nid: 0,
                to_nid: 1,
            },
            payload: Payload::new(seq * PAGE_SIZE as u64, 0, 0),
        }
    }

    fn test_ring(window: &SharedWindow) -> RingWindow {
        let ring = unsafe { RingWindow::from_base(window.at(0)) };
        ring.init();
        ring
    }

    #[test]
    fn stride_is_page_rounded() {
        assert_eq!(ring_stride() % PAGE_SIZE as u64, 0);
        assert!(ring_stride() as usize >= RING_BYTES);
    }

    #[test]
    fn fifo_order() {
        let window = SharedWindow::anonymous(ring_stride() as usize).unwrap();
        let ring = test_ring(&window);
        for i in 0..16 {
            ring.put(&msg(i)).unwrap();
        }
        for i in 0..16 {
            let got = ring.get().unwrap();
            assert_eq!(got.header.ws_id, i as i32);
            assert_eq!(got.payload.window_offset, i * PAGE_SIZE as u64);
        }
        assert!(ring.get().is_none());
    }

    #[test]
    fn full_ring_drops_and_leaves_tail() {
        let window = SharedWindow::anonymous(ring_stride() as usize).unwrap();
        let ring = test_ring(&window);
        for i in 0..RING_SLOTS as u64 - 1 {
            ring.put(&msg(i)).unwrap();
        }
        let err = ring.put(&msg(0)).unwrap_err();
        assert_eq!(err, CoherenceError::RingFull);
        assert_eq!(ring.in_use(), RING_SLOTS as u64 - 1);
    }

    #[test]
    fn counters_wrap_over_capacity() {
        let window = SharedWindow::anonymous(ring_stride() as usize).unwrap();
        let ring = test_ring(&window);
        // Push the counters past the slot-count boundary so the modulo
        // indexing wraps.
        let batch = 40_000u64;
        for round in 0..2u64 {
            for i in 0..batch {
                ring.put(&msg(round * batch + i)).unwrap();
            }
            for i in 0..batch {
                let got = ring.get().unwrap();
                assert_eq!(
                    got.payload.window_offset,
                    (round * batch + i) * PAGE_SIZE as u64
                );
            }
        }
        assert_eq!(ring.in_use(), 0);
    }

    #[test]
    fn put_rejects_invalid_message() {
        let window = SharedWindow::anonymous(ring_stride() as usize).unwrap();
        let ring = test_ring(&window);
        let mut bad = msg(0);
        bad.header.msg_type = 99;
        assert!(ring.put(&bad).is_err());
        assert_eq!(ring.in_use(), 0);
    }
}
