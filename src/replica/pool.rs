//! Replica pool: allocation, write-back, and reclaim
//!
//! The pool owns the reclaim lists and the replica lifecycle. Creation
//! copies the shared page into local DRAM and unmaps the original so later
//! faults route back through the engine; destruction writes dirty bytes back
//! into the window before freeing. Reclaim follows the classic two-list
//! scheme: pages age from the active tail to the inactive list, and only
//! inactive pages whose young bit stays clear are actually freed.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::CoherenceError;
use crate::mapping::MappingLayer;
use crate::page::{PageMeta, PageRegistry};
use crate::replica::lru::ReplicaLists;
use crate::replica::Replica;
use crate::telemetry::CoherenceStats;
use crate::window::{SharedWindow, PAGE_SIZE};

/// Allocation attempts before giving up, each one triggering a manual shrink
const MAX_ALLOCATE_RETRIES: u32 = 3;
/// Pages scanned when the caller does not say how many
pub const DEFAULT_SCAN_PAGES: usize = 1024;
/// Inactive list must hold `2 * nr_to_scan` pages before direct reclaim
const INACTIVE_THRESHOLD_MULT: usize = 2;
/// Base aging batch relative to the scan request
const AGING_MULT: usize = 4;
/// Shrinker counts one quarter of the active list as reclaimable
const ACTIVE_TO_INACTIVE_RATIO: usize = 4;
/// Upper bound used by flush-all to age everything
const MAX_LIST_COUNT: usize = 1 << 20;

/// Result of [`ReplicaPool::create_replica`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Replica created and inserted at the active MRU end
    Created,
    /// Creation skipped: the page is stale-shared or already replicated
    Skipped,
}

/// Pool of local replica pages with two-list reclaim
pub struct ReplicaPool {
    window: Arc<SharedWindow>,
    pages: Arc<PageRegistry>,
    lists: ReplicaLists,
    mapping: Arc<dyn MappingLayer>,
    stats: Arc<CoherenceStats>,
}

impl std::fmt::Debug for ReplicaPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (active, inactive) = self.lists.lens();
        f.debug_struct("ReplicaPool")
            .field("active", &active)
            .field("inactive", &inactive)
            .finish()
    }
}

impl ReplicaPool {
    pub fn new(
        window: Arc<SharedWindow>,
        pages: Arc<PageRegistry>,
        mapping: Arc<dyn MappingLayer>,
        stats: Arc<CoherenceStats>,
    ) -> Self {
        Self {
            window,
            pages,
            lists: ReplicaLists::new(),
            mapping,
            stats,
        }
    }

    /// (active, inactive) list lengths
    pub fn list_lens(&self) -> (usize, usize) {
        self.lists.lens()
    }

    fn alloc_with_retry(&self, original: u64, order: u32) -> Result<Replica, CoherenceError> {
        let mut retries = 0;
        loop {
            match Replica::alloc(original, order) {
                Ok(r) => {
                    if retries > 0 {
                        info!(
                            "replica: allocation for 0x{:x} succeeded after {} retries",
                            original, retries
                        );
                    }
                    return Ok(r);
                }
                Err(_) if retries < MAX_ALLOCATE_RETRIES => {
                    let pages_to_free = if order == 0 { 1 } else { 16 };
                    warn!(
                        "replica: allocation failed (retry {}/{}), shrinking {} pages",
                        retries + 1,
                        MAX_ALLOCATE_RETRIES,
                        pages_to_free
                    );
                    self.scan_objects(pages_to_free);
                    std::thread::sleep(Duration::from_millis(10));
                    retries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Create a replica of the page at `offset`
    ///
    /// Copies the original's bytes, unmaps the original's process mappings
    /// so subsequent accesses fault through the engine, and inserts the
    /// replica at the active MRU end. Stale-shared pages are not replicated.
    pub fn create_replica(&self, offset: u64, order: u32) -> Result<CreateOutcome, CoherenceError> {
        let page = self.pages.get_or_insert(offset);
        if page.is_replicated() {
            debug!("replica: page 0x{:x} already replicated", offset);
            return Ok(CreateOutcome::Skipped);
        }

        let replica = self.alloc_with_retry(offset, order)?;

        let mut buf = vec![0u8; PAGE_SIZE];
        for i in 0..(1usize << order) {
            self.window
                .read_page(offset + (i * PAGE_SIZE) as u64, &mut buf);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    buf.as_ptr(),
                    replica.as_ptr().add(i * PAGE_SIZE),
                    PAGE_SIZE,
                );
            }
        }

        if page.is_modified() && page.is_shared() {
            debug!(
                "replica: page 0x{:x} is stale shared, skipping replication",
                offset
            );
            return Ok(CreateOutcome::Skipped);
        }

        let replica = Arc::new(replica);
        self.lists.insert_active(replica.clone());
        self.mapping.unmap_pages(offset, 1 << order);
        page.set_replica(replica);

        self.stats.track_alloc(order);
        self.stats
            .replica_created_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        debug!("replica: created for page 0x{:x} (order {})", offset, order);
        Ok(CreateOutcome::Created)
    }

    /// Copy a replica's bytes back into its shared page and flush them out
    pub fn writeback_replica(&self, replica: &Replica) {
        let mut buf = vec![0u8; PAGE_SIZE];
        for i in 0..(1usize << replica.order) {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    replica.as_ptr().add(i * PAGE_SIZE),
                    buf.as_mut_ptr(),
                    PAGE_SIZE,
                );
            }
            self.window
                .write_page(replica.original + (i * PAGE_SIZE) as u64, &buf);
        }
    }

    /// Refresh a replica from its shared page after a coherence transaction
    pub fn fetch_replica(&self, page: &PageMeta) -> Result<(), CoherenceError> {
        let replica = page
            .replica()
            .ok_or_else(|| CoherenceError::invariant("fetch on page without replica"))?;
        let mut buf = vec![0u8; PAGE_SIZE];
        for i in 0..(1usize << replica.order) {
            self.window
                .read_page(replica.original + (i * PAGE_SIZE) as u64, &mut buf);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    buf.as_ptr(),
                    replica.as_ptr().add(i * PAGE_SIZE),
                    PAGE_SIZE,
                );
            }
        }
        Ok(())
    }

    /// Write a replica back and destroy it
    pub fn flush_replica(&self, replica: &Arc<Replica>) -> Result<(), CoherenceError> {
        self.writeback_replica(replica);
        self.release_replica(replica);
        Ok(())
    }

    /// Destroy a replica without writing it back
    ///
    /// Remote INVALIDATE path: the losing copy's bytes must not reach the
    /// window.
    pub fn drop_replica(&self, replica: &Arc<Replica>) {
        self.release_replica(replica);
    }

    fn release_replica(&self, replica: &Arc<Replica>) {
        if let Some(page) = self.pages.get(replica.original) {
            page.take_replica();
        }
        self.lists.remove(replica);
        self.mapping
            .unmap_pages(replica.original, 1 << replica.order);
        self.stats.track_free(replica.order);
        self.stats
            .replica_freed_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    /// Age up to `nr` pages from the active tail toward the inactive list
    ///
    /// Pages observed young stay active at the MRU end; the rest move to the
    /// inactive MRU end. Returns the number aged.
    pub fn age_active_to_inactive(&self, nr: usize) -> usize {
        let mut remaining = nr;
        let mut aged = 0;
        while remaining > 0 {
            let batch = self.lists.collect_active_tail(remaining);
            if batch.is_empty() {
                break;
            }
            remaining -= batch.len();
            for replica in batch {
                if self.mapping.test_and_clear_young(replica.original) {
                    self.lists.move_to_active_mru(replica);
                } else {
                    self.lists.move_to_inactive_mru(replica);
                    aged += 1;
                }
            }
        }
        debug!("replica: aged {} pages active -> inactive", aged);
        aged
    }

    /// Reclaim up to `nr` pages from the inactive tail
    ///
    /// Pages observed young get a last chance back on the active list; the
    /// rest are written back and freed. Returns the number freed.
    pub fn reclaim_from_inactive(&self, nr: usize) -> usize {
        let mut remaining = nr;
        let mut freed = 0;
        while remaining > 0 {
            let batch = self.lists.collect_inactive_tail(remaining);
            if batch.is_empty() {
                break;
            }
            remaining -= batch.len();
            for replica in batch {
                if self.mapping.test_and_clear_young(replica.original) {
                    self.lists.move_to_active_mru(replica);
                    continue;
                }
                match self.flush_replica(&replica) {
                    Ok(()) => freed += 1,
                    Err(e) => {
                        warn!(
                            "replica: failed to flush 0x{:x}: {}, keeping inactive",
                            replica.original, e
                        );
                        self.lists.move_to_inactive_mru(replica);
                    }
                }
            }
        }
        debug!("replica: reclaimed {} pages from inactive", freed);
        freed
    }

    /// Shrinker count callback: inactive length plus a quarter of active
    pub fn count_objects(&self) -> usize {
        let (active, inactive) = self.lists.lens();
        inactive + active / ACTIVE_TO_INACTIVE_RATIO
    }

    /// Shrinker scan callback: free approximately `nr_to_scan` pages
    ///
    /// Reclaims directly while the inactive list is deep enough, otherwise
    /// ages active pages first. Both the aging and reclaim batch sizes
    /// double every pass. Stops when enough pages are freed or both lists
    /// together can no longer cover the request.
    pub fn scan_objects(&self, nr_to_scan: usize) -> usize {
        let nr_to_scan = if nr_to_scan == 0 {
            DEFAULT_SCAN_PAGES
        } else {
            nr_to_scan
        };
        let want_inactive = nr_to_scan * INACTIVE_THRESHOLD_MULT;
        let mut freed = 0;
        let mut age_mult = 1;
        let mut free_mult = 1;

        while freed < nr_to_scan {
            let (active_len, inactive_len) = self.lists.lens();

            if active_len + inactive_len < want_inactive {
                debug!("replica shrink: both lists too small, stopping");
                break;
            }

            if inactive_len >= want_inactive {
                freed += self.reclaim_from_inactive(nr_to_scan * free_mult);
                free_mult *= 2;
                continue;
            }

            // Not enough inactive pages; age active pages until there are.
            let mut aged = 0;
            while aged < want_inactive {
                aged += self.age_active_to_inactive(nr_to_scan * AGING_MULT * age_mult);
                let (active_len, _) = self.lists.lens();
                if active_len == 0 {
                    break;
                }
                age_mult *= 2;
            }

            let (_, inactive_len) = self.lists.lens();
            if inactive_len >= want_inactive {
                freed += self.reclaim_from_inactive(nr_to_scan * free_mult);
                free_mult *= 2;
            } else if aged == 0 {
                // Nothing aged and nothing reclaimable; no forward progress.
                break;
            }
        }

        info!(
            "replica shrink: requested {}, freed {}",
            nr_to_scan, freed
        );
        freed
    }

    /// Age everything to inactive, then reclaim the whole inactive list
    pub fn flush_all(&self) -> usize {
        let aged = self.age_active_to_inactive(MAX_LIST_COUNT);
        let (_, inactive_len) = self.lists.lens();
        let freed = self.reclaim_from_inactive(inactive_len);
        info!("replica: flush all aged {} and freed {}", aged, freed);
        freed
    }

    /// Detach and flush every listed replica considered cold by `is_cold`
    ///
    /// Eviction half of the replication daemon tick. Returns the number
    /// evicted.
    pub fn evict_cold<F: FnMut(&Arc<Replica>) -> bool>(&self, is_cold: F) -> usize {
        let cold = self.lists.drain_cold(is_cold);
        let count = cold.len();
        for replica in cold {
            if let Err(e) = self.flush_replica(&replica) {
                warn!("replica: eviction flush failed for 0x{:x}: {}", replica.original, e);
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::DirectMapping;

    fn pool(pages: usize) -> ReplicaPool {
        let window = Arc::new(SharedWindow::anonymous(pages * PAGE_SIZE).unwrap());
        let len = window.len() as u64;
        ReplicaPool::new(
            window,
            Arc::new(PageRegistry::new()),
            Arc::new(DirectMapping::new(len)),
            Arc::new(CoherenceStats::new()),
        )
    }

    #[test]
    fn create_then_flush_preserves_original_bytes() {
        let pool = pool(4);
        let offset = PAGE_SIZE as u64;
        let content = [0x5au8; PAGE_SIZE];
        pool.window.write_page(offset, &content);

        assert_eq!(
            pool.create_replica(offset, 0).unwrap(),
            CreateOutcome::Created
        );
        let page = pool.pages.get(offset).unwrap();
        let replica = page.replica().unwrap();
        let mut copy = [0u8; PAGE_SIZE];
        replica.copy_to(&mut copy);
        assert_eq!(copy, content);

        pool.flush_replica(&replica).unwrap();
        assert!(page.replica().is_none());
        assert_eq!(pool.list_lens(), (0, 0));

        let mut after = [0u8; PAGE_SIZE];
        pool.window.read_page(offset, &mut after);
        assert_eq!(after, content);
    }

    #[test]
    fn create_skips_already_replicated() {
        let pool = pool(4);
        assert_eq!(pool.create_replica(0, 0).unwrap(), CreateOutcome::Created);
        assert_eq!(pool.create_replica(0, 0).unwrap(), CreateOutcome::Skipped);
        assert_eq!(pool.list_lens(), (1, 0));
    }

    #[test]
    fn create_skips_stale_shared() {
        let pool = pool(4);
        let page = pool.pages.get_or_insert(0);
        page.set_flags(crate::page::PG_SHARED | crate::page::PG_MODIFIED);
        assert_eq!(pool.create_replica(0, 0).unwrap(), CreateOutcome::Skipped);
        assert_eq!(pool.list_lens(), (0, 0));
    }

    #[test]
    fn dirty_replica_writes_back_on_flush() {
        let pool = pool(4);
        pool.create_replica(0, 0).unwrap();
        let replica = pool.pages.get(0).unwrap().replica().unwrap();
        let dirty = [0x77u8; PAGE_SIZE];
        replica.copy_from(&dirty);
        pool.flush_replica(&replica).unwrap();
        let mut after = [0u8; PAGE_SIZE];
        pool.window.read_page(0, &mut after);
        assert_eq!(after, dirty);
    }

    #[test]
    fn drop_replica_discards_dirty_bytes() {
        let pool = pool(4);
        pool.create_replica(0, 0).unwrap();
        let replica = pool.pages.get(0).unwrap().replica().unwrap();
        replica.copy_from(&[0x99u8; PAGE_SIZE]);
        pool.drop_replica(&replica);
        let mut after = [0u8; PAGE_SIZE];
        pool.window.read_page(0, &mut after);
        assert!(after.iter().all(|&b| b == 0));
    }

    #[test]
    fn count_objects_weights_active_by_quarter() {
        let pool = pool(64);
        for i in 0..8u64 {
            pool.create_replica(i * PAGE_SIZE as u64, 0).unwrap();
        }
        // All eight sit on the active list.
        assert_eq!(pool.count_objects(), 8 / 4);
        pool.age_active_to_inactive(4);
        assert_eq!(pool.count_objects(), 4 + 4 / 4);
    }

    #[test]
    fn scan_objects_frees_requested_amount() {
        let pool = pool(256);
        for i in 0..128u64 {
            pool.create_replica(i * PAGE_SIZE as u64, 0).unwrap();
        }
        let freed = pool.scan_objects(16);
        assert!(freed >= 16);
        let (active, inactive) = pool.list_lens();
        assert_eq!(active + inactive + freed, 128);
    }

    #[test]
    fn scan_objects_stops_when_lists_too_small() {
        let pool = pool(16);
        for i in 0..4u64 {
            pool.create_replica(i * PAGE_SIZE as u64, 0).unwrap();
        }
        // 4 < 2 * 16: no spin, nothing freed.
        assert_eq!(pool.scan_objects(16), 0);
        assert_eq!(pool.list_lens().0, 4);
    }

    #[test]
    fn flush_all_empties_both_lists() {
        let pool = pool(64);
        for i in 0..10u64 {
            pool.create_replica(i * PAGE_SIZE as u64, 0).unwrap();
        }
        pool.age_active_to_inactive(5);
        let freed = pool.flush_all();
        assert_eq!(freed, 10);
        assert_eq!(pool.list_lens(), (0, 0));
        assert_eq!(pool.stats.snapshot().allocated_pages, 0);
    }
}
