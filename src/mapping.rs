//! Mapping-layer interface
//!
//! The mapping/filesystem layer that installs page-table entries lives
//! outside the core. The core consumes three things from it: a bulk unmap
//! primitive (so invalidated pages fault again), the per-page young bit
//! sampled across every VMA that maps the page, and virtual-address
//! resolution for the sampling feed.

use crate::window::PAGE_SIZE;

/// Operations the core needs from the external mapping layer
pub trait MappingLayer: Send + Sync {
    /// Remove every mapping of `pages` pages starting at window `offset`;
    /// subsequent accesses must fault back into the engine
    fn unmap_pages(&self, offset: u64, pages: usize);

    /// Write-protect every mapping of the range so the next store faults;
    /// used after a write-back downgrades the page
    fn write_protect(&self, offset: u64, pages: usize);

    /// Test and clear the young bit across all VMAs mapping the page at
    /// `offset`; true when any mapping was accessed since the last clear
    fn test_and_clear_young(&self, offset: u64) -> bool;

    /// Resolve a sampled virtual address in process `pid` to a window
    /// offset, or None when the address is outside the shared window
    fn resolve_sample(&self, vaddr: u64, pid: u32) -> Option<u64>;
}

/// Mapping layer with no process mappings
///
/// Sampled addresses are treated as window offsets directly. Useful for
/// tests and for running the core without a live filesystem integration.
#[derive(Debug, Default)]
pub struct DirectMapping {
    window_len: u64,
}

impl DirectMapping {
    pub fn new(window_len: u64) -> Self {
        Self { window_len }
    }
}

impl MappingLayer for DirectMapping {
    fn unmap_pages(&self, _offset: u64, _pages: usize) {}

    fn write_protect(&self, _offset: u64, _pages: usize) {}

    fn test_and_clear_young(&self, _offset: u64) -> bool {
        false
    }

    fn resolve_sample(&self, vaddr: u64, _pid: u32) -> Option<u64> {
        let offset = vaddr & !(PAGE_SIZE as u64 - 1);
        (offset < self.window_len).then_some(offset)
    }
}
