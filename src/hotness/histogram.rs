//! Access-count histogram
//!
//! Thirty-two buckets, where bucket `i` counts pages whose aged access
//! count has its most significant bit at position `i`. The replication
//! daemon reads the hotness threshold off the histogram as the MSB index
//! covering the top P percent of tracked pages, then cools the whole
//! signal by shifting every bucket down one bin, which models all counts
//! halving and keeps the bucket sum equal to the number of tracked pages.

use std::sync::atomic::{AtomicU64, Ordering};

/// Number of histogram buckets; one per possible MSB position
pub const HIST_BUCKETS: usize = 32;

/// MSB index of a 32-bit access count; None for a count of zero
#[inline]
pub fn msb_index(count: u32) -> Option<usize> {
    if count == 0 {
        None
    } else {
        Some(31 - count.leading_zeros() as usize)
    }
}

/// MSB-position histogram of aged access counts
#[derive(Debug, Default)]
pub struct AccessHistogram {
    buckets: [AtomicU64; HIST_BUCKETS],
}

impl AccessHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move one page between MSB buckets after its count changed
    pub fn record_transition(&self, old_count: u32, new_count: u32) {
        let old_bin = msb_index(old_count);
        let new_bin = msb_index(new_count);
        if old_bin == new_bin {
            return;
        }
        if let Some(bin) = old_bin {
            self.buckets[bin].fetch_sub(1, Ordering::Relaxed);
        }
        if let Some(bin) = new_bin {
            self.buckets[bin].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Sum over every bucket; equals the number of tracked pages
    pub fn total(&self) -> u64 {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .sum()
    }

    /// Bucket contents, for tests and monitoring
    pub fn snapshot(&self) -> [u64; HIST_BUCKETS] {
        std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed))
    }

    /// MSB index covering the hottest `percentile` percent of pages
    ///
    /// Returns `fallback` while the histogram is empty.
    pub fn threshold_for_percentile(&self, percentile: u32, fallback: u32) -> u32 {
        let total = self.total();
        if total == 0 {
            return fallback;
        }
        // At least one page must qualify, or a tiny population would pin
        // the threshold at the top bucket.
        let target = (total * percentile as u64 / 100).max(1);
        let mut cumulative = 0;
        for i in (0..HIST_BUCKETS).rev() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            if cumulative >= target {
                return i as u32;
            }
        }
        0
    }

    /// Cool the signal: shift every bucket down one bin
    ///
    /// Bucket 0 absorbs bucket 1 so the total is preserved.
    pub fn cool(&self) {
        for i in 1..HIST_BUCKETS {
            let moved = self.buckets[i].swap(0, Ordering::Relaxed);
            self.buckets[i - 1].fetch_add(moved, Ordering::Relaxed);
        }
    }
}
