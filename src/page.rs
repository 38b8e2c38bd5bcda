//! Per-page metadata
//!
//! Every shared-window page this node has touched gets a [`PageMeta`] entry
//! keyed by its window offset. The entry carries the node-local MSI view
//! (SHARED/MODIFIED bits; both clear means Invalid, both set means
//! stale-Shared), the packed access-tracking word maintained by the hotness
//! sampler, and the replica slot.
//!
//! The replica slot and the replica's back-pointer are only written inside a
//! fault handle's critical section, so readers holding the bucket lock see a
//! consistent pair.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::replica::Replica;

/// Page flag bits, mirrored into fault-handle flag probes
pub const PG_SHARED: u32 = 0x01;
pub const PG_MODIFIED: u32 = 0x02;
/// Page participates in coherence (set on first fault)
pub const PG_COHERENCE: u32 = 0x04;

/// Node-local MSI state of one shared page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Invalid,
    Shared,
    Modified,
    /// Shared whose cached bytes are known to pre-date the latest write;
    /// must be refreshed before another local read is served
    StaleShared,
}

/// Metadata for one shared-window page, as seen by this node
#[derive(Debug)]
pub struct PageMeta {
    /// Shared-window offset; the cross-node identity of this page
    pub offset: u64,
    flags: AtomicU32,
    /// Packed access word: bits 63..32 access count, 31..16 last-accessed
    /// age, low bits reserved
    private: AtomicU64,
    replica: Mutex<Option<Arc<Replica>>>,
}

impl PageMeta {
    fn new(offset: u64) -> Self {
        Self {
            offset,
            flags: AtomicU32::new(0),
            private: AtomicU64::new(0),
            replica: Mutex::new(None),
        }
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        self.flags.load(Ordering::Acquire) & PG_SHARED != 0
    }

    #[inline]
    pub fn is_modified(&self) -> bool {
        self.flags.load(Ordering::Acquire) & PG_MODIFIED != 0
    }

    #[inline]
    pub fn is_coherence(&self) -> bool {
        self.flags.load(Ordering::Acquire) & PG_COHERENCE != 0
    }

    #[inline]
    pub fn set_flags(&self, bits: u32) {
        self.flags.fetch_or(bits, Ordering::AcqRel);
    }

    #[inline]
    pub fn clear_flags(&self, bits: u32) {
        self.flags.fetch_and(!bits, Ordering::AcqRel);
    }

    /// Decoded MSI state
    pub fn state(&self) -> PageState {
        let f = self.flags.load(Ordering::Acquire);
        match (f & PG_MODIFIED != 0, f & PG_SHARED != 0) {
            (false, false) => PageState::Invalid,
            (false, true) => PageState::Shared,
            (true, false) => PageState::Modified,
            (true, true) => PageState::StaleShared,
        }
    }

    /// Current replica, if this node holds one
    pub fn replica(&self) -> Option<Arc<Replica>> {
        self.replica
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_replicated(&self) -> bool {
        self.replica().is_some()
    }

    /// Install the replica pointer; the caller owns the fault-handle critical
    /// section
    pub fn set_replica(&self, replica: Arc<Replica>) {
        *self.replica.lock().unwrap_or_else(|e| e.into_inner()) = Some(replica);
    }

    /// Clear and return the replica pointer
    pub fn take_replica(&self) -> Option<Arc<Replica>> {
        self.replica
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Raw packed access word
    #[inline]
    pub fn access_word(&self) -> u64 {
        self.private.load(Ordering::Relaxed)
    }

    /// Store a packed access word built by [`pack_access`]
    #[inline]
    pub fn set_access_word(&self, word: u64) {
        self.private.store(word, Ordering::Relaxed);
    }

    /// Aged access count from the packed word
    #[inline]
    pub fn access_count(&self) -> u32 {
        unpack_access_count(self.access_word())
    }
}

/// Extract the 32-bit access count from a packed word
#[inline]
pub fn unpack_access_count(word: u64) -> u32 {
    (word >> 32) as u32
}

/// Extract the 16-bit last-accessed age from a packed word
#[inline]
pub fn unpack_last_age(word: u64) -> u16 {
    ((word >> 16) & 0xffff) as u16
}

/// Pack an access count and last-accessed age into the private word
#[inline]
pub fn pack_access(count: u32, age: u16) -> u64 {
    ((count as u64) << 32) | ((age as u64) << 16)
}

/// Concurrent registry of page metadata, keyed by window offset
#[derive(Debug, Default)]
pub struct PageRegistry {
    pages: DashMap<u64, Arc<PageMeta>>,
}

impl PageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or create the entry for `offset`
    pub fn get_or_insert(&self, offset: u64) -> Arc<PageMeta> {
        self.pages
            .entry(offset)
            .or_insert_with(|| Arc::new(PageMeta::new(offset)))
            .clone()
    }

    /// Fetch the entry for `offset` if this node has touched the page
    pub fn get(&self, offset: u64) -> Option<Arc<PageMeta>> {
        self.pages.get(&offset).map(|e| e.value().clone())
    }

    /// Number of tracked pages
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_decoding() {
        let reg = PageRegistry::new();
        let page = reg.get_or_insert(0x1000);
        assert_eq!(page.state(), PageState::Invalid);
        page.set_flags(PG_SHARED);
        assert_eq!(page.state(), PageState::Shared);
        page.clear_flags(PG_SHARED);
        page.set_flags(PG_MODIFIED);
        assert_eq!(page.state(), PageState::Modified);
        page.set_flags(PG_SHARED);
        assert_eq!(page.state(), PageState::StaleShared);
    }

    #[test]
    fn access_word_packing() {
        let word = pack_access(0x8000_0001, 42);
        assert_eq!(unpack_access_count(word), 0x8000_0001);
        assert_eq!(unpack_last_age(word), 42);
    }

    #[test]
    fn registry_returns_same_entry() {
        let reg = PageRegistry::new();
        let a = reg.get_or_insert(0x2000);
        let b = reg.get_or_insert(0x2000);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
    }
}
