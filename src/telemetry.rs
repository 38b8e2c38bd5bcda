//! Observability counters
//!
//! Read-only counters exposed to external monitoring, mirroring the control
//! surface: fault totals with a read/write split, replica hit/create/free
//! counts, allocated replica pages, and the replication daemon's list
//! gauges. `reset()` zeroes the counters, as a write of `1` to the reset
//! endpoint would.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use serde::{Deserialize, Serialize};

/// Atomic counter block shared across the subsystems
#[derive(Debug, Default)]
pub struct CoherenceStats {
    /// Coherence faults handled
    pub fault_count: CachePadded<AtomicU64>,
    /// Read faults
    pub fault_read_count: CachePadded<AtomicU64>,
    /// Write faults
    pub fault_write_count: CachePadded<AtomicU64>,
    /// Faults served from an existing replica
    pub replica_found_count: CachePadded<AtomicU64>,
    /// Replicas created
    pub replica_created_count: CachePadded<AtomicU64>,
    /// Replicas written back and freed
    pub replica_freed_count: CachePadded<AtomicU64>,
    /// Pages currently allocated to replicas (grows by `1 << order`)
    pub allocated_pages: CachePadded<AtomicI64>,
    /// Replication candidates accumulated by the sampler
    pub replication_candidates: CachePadded<AtomicU64>,
    /// Pages queued for replication at the last daemon tick
    pub replication_list_len: CachePadded<AtomicU64>,
    /// Pages queued for eviction at the last daemon tick
    pub eviction_list_len: CachePadded<AtomicU64>,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CoherenceStatsSnapshot {
    pub fault_count: u64,
    pub fault_read_count: u64,
    pub fault_write_count: u64,
    pub replica_found_count: u64,
    pub replica_created_count: u64,
    pub replica_freed_count: u64,
    pub allocated_pages: i64,
    pub replication_candidates: u64,
    pub replication_list_len: u64,
    pub eviction_list_len: u64,
}

impl CoherenceStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one fault entry into the engine
    pub fn record_fault(&self, is_write: bool) {
        self.fault_count.fetch_add(1, Ordering::Relaxed);
        if is_write {
            self.fault_write_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fault_read_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Track a replica allocation of `1 << order` pages
    pub fn track_alloc(&self, order: u32) {
        self.allocated_pages
            .fetch_add(1i64 << order, Ordering::Relaxed);
    }

    /// Track a replica free of `1 << order` pages
    pub fn track_free(&self, order: u32) {
        self.allocated_pages
            .fetch_sub(1i64 << order, Ordering::Relaxed);
    }

    /// Capture the counters
    pub fn snapshot(&self) -> CoherenceStatsSnapshot {
        CoherenceStatsSnapshot {
            fault_count: self.fault_count.load(Ordering::Relaxed),
            fault_read_count: self.fault_read_count.load(Ordering::Relaxed),
            fault_write_count: self.fault_write_count.load(Ordering::Relaxed),
            replica_found_count: self.replica_found_count.load(Ordering::Relaxed),
            replica_created_count: self.replica_created_count.load(Ordering::Relaxed),
            replica_freed_count: self.replica_freed_count.load(Ordering::Relaxed),
            allocated_pages: self.allocated_pages.load(Ordering::Relaxed),
            replication_candidates: self.replication_candidates.load(Ordering::Relaxed),
            replication_list_len: self.replication_list_len.load(Ordering::Relaxed),
            eviction_list_len: self.eviction_list_len.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        self.fault_count.store(0, Ordering::Relaxed);
        self.fault_read_count.store(0, Ordering::Relaxed);
        self.fault_write_count.store(0, Ordering::Relaxed);
        self.replica_found_count.store(0, Ordering::Relaxed);
        self.replica_created_count.store(0, Ordering::Relaxed);
        self.replica_freed_count.store(0, Ordering::Relaxed);
        self.allocated_pages.store(0, Ordering::Relaxed);
        self.replication_candidates.store(0, Ordering::Relaxed);
        self.replication_list_len.store(0, Ordering::Relaxed);
        self.eviction_list_len.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_split_and_reset() {
        let stats = CoherenceStats::new();
        stats.record_fault(true);
        stats.record_fault(false);
        stats.record_fault(false);
        let snap = stats.snapshot();
        assert_eq!(snap.fault_count, 3);
        assert_eq!(snap.fault_write_count, 1);
        assert_eq!(snap.fault_read_count, 2);

        stats.reset();
        assert_eq!(stats.snapshot().fault_count, 0);
    }

    #[test]
    fn allocation_accounting_by_order() {
        let stats = CoherenceStats::new();
        stats.track_alloc(0);
        stats.track_alloc(9);
        assert_eq!(stats.snapshot().allocated_pages, 1 + 512);
        stats.track_free(9);
        assert_eq!(stats.snapshot().allocated_pages, 1);
    }
}
