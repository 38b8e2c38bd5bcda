//! Hotness sampling and the replication daemon
//!
//! An external feed of sampled user loads/stores delivers `{address, pid}`
//! tuples. Each sample resolves to a shared-window page and bumps the
//! page's aged access count; pages whose count clears the hotness
//! threshold become replication candidates. On every replication interval
//! the daemon evicts replicas that went cold, replicates the hot
//! candidates, advances the aging age, re-derives the threshold from the
//! histogram, and cools the histogram.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info, warn};

use crate::config::DEFAULT_HOTNESS_THRESHOLD;
use crate::hotness::histogram::{msb_index, AccessHistogram};
use crate::mapping::MappingLayer;
use crate::page::{pack_access, unpack_access_count, unpack_last_age, PageRegistry};
use crate::replica::pool::ReplicaPool;
use crate::telemetry::CoherenceStats;

/// One tuple from the address-sampling feed
#[derive(Debug, Clone, Copy)]
pub struct AccessSample {
    pub vaddr: u64,
    pub pid: u32,
}

/// Shared hotness state: histogram, threshold, aging age, candidates
pub struct HotnessSampler {
    pages: Arc<PageRegistry>,
    pool: Arc<ReplicaPool>,
    mapping: Arc<dyn MappingLayer>,
    stats: Arc<CoherenceStats>,
    hist: AccessHistogram,
    /// Minimum MSB index a page needs to count as hot this interval
    hotness_threshold: AtomicU32,
    /// Monotonic tick incremented every replication interval
    monitoring_age: AtomicU64,
    hot_page_percent: AtomicU32,
    candidates: Mutex<Vec<u64>>,
}

impl std::fmt::Debug for HotnessSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotnessSampler")
            .field("threshold", &self.hotness_threshold.load(Ordering::Relaxed))
            .field("age", &self.monitoring_age.load(Ordering::Relaxed))
            .finish()
    }
}

impl HotnessSampler {
    pub fn new(
        pages: Arc<PageRegistry>,
        pool: Arc<ReplicaPool>,
        mapping: Arc<dyn MappingLayer>,
        stats: Arc<CoherenceStats>,
        hot_page_percent: u32,
    ) -> Self {
        Self {
            pages,
            pool,
            mapping,
            stats,
            hist: AccessHistogram::new(),
            hotness_threshold: AtomicU32::new(DEFAULT_HOTNESS_THRESHOLD),
            monitoring_age: AtomicU64::new(0),
            hot_page_percent: AtomicU32::new(hot_page_percent),
            candidates: Mutex::new(Vec::new()),
        }
    }

    /// Current hotness threshold (MSB index)
    pub fn hotness_threshold(&self) -> u32 {
        self.hotness_threshold.load(Ordering::Relaxed)
    }

    /// Change the share of the histogram considered hot
    pub fn set_hot_page_percent(&self, percent: u32) {
        self.hot_page_percent.store(percent, Ordering::Relaxed);
    }

    /// Current aging age
    pub fn monitoring_age(&self) -> u64 {
        self.monitoring_age.load(Ordering::Relaxed)
    }

    /// Histogram bucket sum; equals the number of pages with samples
    pub fn tracked_pages(&self) -> u64 {
        self.hist.total()
    }

    /// Feed one sampled access into the tracking state
    ///
    /// Returns false when the sample does not resolve to a
    /// coherence-enabled window page.
    pub fn handle_sample(&self, sample: AccessSample) -> bool {
        let Some(offset) = self.mapping.resolve_sample(sample.vaddr, sample.pid) else {
            return false;
        };
        let Some(page) = self.pages.get(offset) else {
            return false;
        };
        if !page.is_coherence() {
            debug!("sampler: page 0x{:x} not coherence-enabled, skipping", offset);
            return false;
        }

        let word = page.access_word();
        let mut count = unpack_access_count(word);
        let last_age = unpack_last_age(word) as u64;
        let age = self.monitoring_age.load(Ordering::Relaxed);

        // Older samples decay exponentially with the age delta.
        if age > last_age {
            let shift = (age - last_age).min(31) as u32;
            count >>= shift;
        }
        let new_count = count.saturating_add(1);
        page.set_access_word(pack_access(new_count, age as u16));
        self.hist.record_transition(count, new_count);

        if msb_index(new_count).map_or(0, |i| i as u32) >= self.hotness_threshold() {
            self.candidates
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(offset);
            self.stats
                .replication_candidates
                .fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    /// One replication interval: evict cold, replicate hot, age, re-derive
    /// the threshold, cool the histogram
    pub fn replication_pass(&self) {
        let threshold = self.hotness_threshold();

        // Drop listed replicas whose aged count fell below the threshold.
        let pages = self.pages.clone();
        let evicted = self.pool.evict_cold(|replica| {
            let count = pages
                .get(replica.original)
                .map(|p| p.access_count())
                .unwrap_or(0);
            msb_index(count).map_or(0, |i| i as u32) < threshold
        });
        self.stats
            .eviction_list_len
            .store(evicted as u64, Ordering::Relaxed);

        // Candidates that are not yet replicated get a replica now.
        let drained: Vec<u64> = {
            let mut guard = self.candidates.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        let mut replication_list: Vec<u64> = Vec::new();
        for offset in drained {
            let replicated = self
                .pages
                .get(offset)
                .map(|p| p.is_replicated())
                .unwrap_or(false);
            if !replicated && !replication_list.contains(&offset) {
                replication_list.push(offset);
            }
        }
        self.stats
            .replication_list_len
            .store(replication_list.len() as u64, Ordering::Relaxed);
        self.stats.replication_candidates.store(0, Ordering::Relaxed);

        for offset in &replication_list {
            if let Err(e) = self.pool.create_replica(*offset, 0) {
                warn!("replication: failed to replicate 0x{:x}: {}", offset, e);
            }
        }

        self.monitoring_age.fetch_add(1, Ordering::Relaxed);

        let percent = self.hot_page_percent.load(Ordering::Relaxed);
        let new_threshold = self.hist.threshold_for_percentile(percent, threshold);
        self.hotness_threshold
            .store(new_threshold, Ordering::Relaxed);

        self.hist.cool();

        info!(
            "replication pass: evicted {}, replicated {}, threshold {} -> {}",
            evicted,
            replication_list.len(),
            threshold,
            new_threshold
        );
    }
}

/// Handle to the running replication daemon
#[derive(Debug)]
pub struct ReplicationDaemon {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReplicationDaemon {
    /// Spawn the daemon: drain `samples`, run a replication pass every
    /// `interval`
    pub fn spawn(
        sampler: Arc<HotnessSampler>,
        samples: Receiver<AccessSample>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("kreplicationd".to_string())
            .spawn(move || {
                info!("replication daemon started, interval {:?}", interval);
                let mut next_pass = Instant::now() + interval;
                while !flag.load(Ordering::Relaxed) {
                    match samples.recv_timeout(Duration::from_millis(100)) {
                        Ok(sample) => {
                            sampler.handle_sample(sample);
                            // Keep up with a bursty feed before checking the
                            // clock again.
                            while let Ok(sample) = samples.try_recv() {
                                sampler.handle_sample(sample);
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if Instant::now() >= next_pass {
                        sampler.replication_pass();
                        next_pass = Instant::now() + interval;
                    }
                }
                info!("replication daemon stopped");
            })?;
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Signal the daemon to stop and join it
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReplicationDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::DirectMapping;
    use crate::page::PG_COHERENCE;
    use crate::window::{SharedWindow, PAGE_SIZE};

    fn sampler(percent: u32) -> (Arc<HotnessSampler>, Arc<PageRegistry>, Arc<ReplicaPool>) {
        let window = Arc::new(SharedWindow::anonymous(64 * PAGE_SIZE).unwrap());
        let pages = Arc::new(PageRegistry::new());
        let mapping: Arc<dyn MappingLayer> = Arc::new(DirectMapping::new(window.len() as u64));
        let stats = Arc::new(CoherenceStats::new());
        let pool = Arc::new(ReplicaPool::new(
            window,
            pages.clone(),
            mapping.clone(),
            stats.clone(),
        ));
        let sampler = Arc::new(HotnessSampler::new(
            pages.clone(),
            pool.clone(),
            mapping,
            stats,
            percent,
        ));
        (sampler, pages, pool)
    }

    fn touch(pages: &PageRegistry, offset: u64) {
        pages.get_or_insert(offset).set_flags(PG_COHERENCE);
    }

    #[test]
    fn sample_outside_tracking_is_rejected() {
        let (sampler, pages, _pool) = sampler(20);
        // Unknown page: no metadata entry yet.
        assert!(!sampler.handle_sample(AccessSample { vaddr: 0x1000, pid: 1 }));
        // Known but not coherence-enabled.
        pages.get_or_insert(0x1000);
        assert!(!sampler.handle_sample(AccessSample { vaddr: 0x1000, pid: 1 }));
    }

    #[test]
    fn samples_accumulate_and_age() {
        let (sampler, pages, _pool) = sampler(20);
        touch(&pages, 0x1000);
        for _ in 0..5 {
            assert!(sampler.handle_sample(AccessSample { vaddr: 0x1000, pid: 1 }));
        }
        let page = pages.get(0x1000).unwrap();
        assert_eq!(page.access_count(), 5);
        assert_eq!(sampler.tracked_pages(), 1);

        // Two intervals pass; the next sample decays the count by 4x.
        sampler.monitoring_age.store(2, Ordering::Relaxed);
        sampler.handle_sample(AccessSample { vaddr: 0x1000, pid: 1 });
        assert_eq!(page.access_count(), 5 / 4 + 1);
    }

    #[test]
    fn hot_candidate_gets_replicated_on_pass() {
        let (sampler, pages, pool) = sampler(20);
        // Force every sampled page over the threshold.
        sampler.hotness_threshold.store(0, Ordering::Relaxed);
        touch(&pages, 0x2000);
        sampler.handle_sample(AccessSample { vaddr: 0x2000, pid: 1 });

        sampler.replication_pass();
        assert!(pages.get(0x2000).unwrap().is_replicated());
        assert_eq!(pool.list_lens(), (1, 0));

        // A second pass does not replicate the page twice.
        sampler.handle_sample(AccessSample { vaddr: 0x2000, pid: 1 });
        sampler.replication_pass();
        assert_eq!(pool.list_lens(), (1, 0));
    }

    #[test]
    fn cold_replicas_are_evicted_on_pass() {
        let (sampler, pages, pool) = sampler(20);
        touch(&pages, 0x3000);
        pool.create_replica(0x3000, 0).unwrap();
        assert_eq!(pool.list_lens(), (1, 0));

        // No samples for the page and a positive threshold: cold.
        sampler.hotness_threshold.store(5, Ordering::Relaxed);
        sampler.replication_pass();
        assert_eq!(pool.list_lens(), (0, 0));
        assert!(!pages.get(0x3000).unwrap().is_replicated());
    }

    #[test]
    fn pass_advances_age_and_rederives_threshold() {
        let (sampler, pages, _pool) = sampler(20);
        for i in 0..10u64 {
            let offset = 0x1000 * (i + 1);
            touch(&pages, offset);
            // Two pages get hot counts, the rest stay at one sample.
            let samples = if i < 2 { 1024 } else { 1 };
            for _ in 0..samples {
                sampler.handle_sample(AccessSample {
                    vaddr: offset,
                    pid: 1,
                });
            }
        }
        assert_eq!(sampler.monitoring_age(), 0);
        sampler.replication_pass();
        assert_eq!(sampler.monitoring_age(), 1);
        // The top 20% of ten pages are the two in bin 10.
        assert_eq!(sampler.hotness_threshold(), 10);
        // Cooling preserved the page population.
        assert_eq!(sampler.tracked_pages(), 10);
    }
}
