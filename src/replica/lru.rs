//! Active/inactive reclaim lists
//!
//! Both lists are ordered MRU to LRU and guarded by a single lock. Critical
//! sections only move bounded batches of replicas into a caller-owned
//! process list; reference sampling and write-back happen outside the lock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use arrayvec::ArrayVec;

use super::{ListMembership, Replica};

/// Replicas moved per lock acquisition when collecting from a list tail
pub const COLLECT_BATCH: usize = 64;

#[derive(Debug, Default)]
struct Lists {
    /// MRU at the front, LRU at the back
    active: VecDeque<Arc<Replica>>,
    inactive: VecDeque<Arc<Replica>>,
}

/// The two reclaim lists
#[derive(Debug, Default)]
pub struct ReplicaLists {
    inner: Mutex<Lists>,
}

impl ReplicaLists {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Lists> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// (active, inactive) lengths
    pub fn lens(&self) -> (usize, usize) {
        let g = self.lock();
        (g.active.len(), g.inactive.len())
    }

    /// Insert a fresh replica at the active MRU end
    pub fn insert_active(&self, replica: Arc<Replica>) {
        replica.set_membership(ListMembership::Active);
        self.lock().active.push_front(replica);
    }

    /// Move a replica back to the active MRU end
    pub fn move_to_active_mru(&self, replica: Arc<Replica>) {
        replica.set_membership(ListMembership::Active);
        self.lock().active.push_front(replica);
    }

    /// Move a replica to the inactive MRU end
    pub fn move_to_inactive_mru(&self, replica: Arc<Replica>) {
        replica.set_membership(ListMembership::Inactive);
        self.lock().inactive.push_front(replica);
    }

    /// Detach a replica from whichever list holds it
    pub fn remove(&self, replica: &Arc<Replica>) {
        let mut g = self.lock();
        match replica.membership() {
            ListMembership::Active => g.active.retain(|r| !Arc::ptr_eq(r, replica)),
            ListMembership::Inactive => g.inactive.retain(|r| !Arc::ptr_eq(r, replica)),
            ListMembership::None => {}
        }
        replica.set_membership(ListMembership::None);
    }

    /// Pop up to [`COLLECT_BATCH`] replicas from the active LRU tail
    pub fn collect_active_tail(&self, max: usize) -> ArrayVec<Arc<Replica>, COLLECT_BATCH> {
        let mut batch = ArrayVec::new();
        let mut g = self.lock();
        while batch.len() < max.min(COLLECT_BATCH) {
            match g.active.pop_back() {
                Some(r) => {
                    r.set_membership(ListMembership::None);
                    batch.push(r);
                }
                None => break,
            }
        }
        batch
    }

    /// Pop up to [`COLLECT_BATCH`] replicas from the inactive LRU tail
    pub fn collect_inactive_tail(&self, max: usize) -> ArrayVec<Arc<Replica>, COLLECT_BATCH> {
        let mut batch = ArrayVec::new();
        let mut g = self.lock();
        while batch.len() < max.min(COLLECT_BATCH) {
            match g.inactive.pop_back() {
                Some(r) => {
                    r.set_membership(ListMembership::None);
                    batch.push(r);
                }
                None => break,
            }
        }
        batch
    }

    /// Detach every replica on either list for which `cold` returns true
    ///
    /// Used by the replication daemon's eviction sweep.
    pub fn drain_cold<F: FnMut(&Arc<Replica>) -> bool>(&self, mut cold: F) -> Vec<Arc<Replica>> {
        let mut g = self.lock();
        let g = &mut *g;
        let mut out = Vec::new();
        for list in [&mut g.active, &mut g.inactive] {
            let mut keep = VecDeque::with_capacity(list.len());
            while let Some(r) = list.pop_front() {
                if cold(&r) {
                    r.set_membership(ListMembership::None);
                    out.push(r);
                } else {
                    keep.push_back(r);
                }
            }
            *list = keep;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(offset: u64) -> Arc<Replica> {
        Arc::new(Replica::alloc(offset, 0).unwrap())
    }

    #[test]
    fn insert_and_collect_order() {
        let lists = ReplicaLists::new();
        for i in 0..4 {
            lists.insert_active(replica(i * 4096));
        }
        // Tail of the active list is the least recently inserted.
        let batch = lists.collect_active_tail(2);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].original, 0);
        assert_eq!(batch[1].original, 4096);
        assert_eq!(lists.lens(), (2, 0));
    }

    #[test]
    fn membership_tracks_moves() {
        let lists = ReplicaLists::new();
        let r = replica(0);
        lists.insert_active(r.clone());
        assert_eq!(r.membership(), ListMembership::Active);
        lists.remove(&r);
        assert_eq!(r.membership(), ListMembership::None);
        lists.move_to_inactive_mru(r.clone());
        assert_eq!(r.membership(), ListMembership::Inactive);
        assert_eq!(lists.lens(), (0, 1));
    }

    #[test]
    fn drain_cold_detaches_from_both_lists() {
        let lists = ReplicaLists::new();
        lists.insert_active(replica(0));
        lists.insert_active(replica(4096));
        lists.move_to_inactive_mru(replica(8192));
        let cold = lists.drain_cold(|r| r.original != 4096);
        assert_eq!(cold.len(), 2);
        assert_eq!(lists.lens(), (1, 0));
        assert!(cold.iter().all(|r| r.membership() == ListMembership::None));
    }

    #[test]
    fn collect_respects_batch_bound() {
        let lists = ReplicaLists::new();
        for i in 0..(COLLECT_BATCH as u64 + 10) {
            lists.insert_active(replica(i * 4096));
        }
        let batch = lists.collect_active_tail(usize::MAX);
        assert_eq!(batch.len(), COLLECT_BATCH);
    }
}
