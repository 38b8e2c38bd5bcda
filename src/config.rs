//! Configuration for the coherence core
//!
//! Plain serde-derived structs carried by the builder. Geometry values must be
//! identical on every node sharing the window; the builder validates them
//! before any window bytes are touched.

use serde::{Deserialize, Serialize};

use crate::error::CoherenceError;
use crate::window::PAGE_SIZE;

/// Default replication interval in seconds
pub const DEFAULT_REPLICATION_INTERVAL_SECS: u64 = 60;
/// Default share of the histogram considered hot
pub const DEFAULT_HOT_PAGE_PERCENT: u32 = 20;
/// Default hotness threshold (MSB index) before the first histogram pass
pub const DEFAULT_HOTNESS_THRESHOLD: u32 = 10;

/// Node identity and shared-window geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoherenceConfig {
    /// This node's id, in `0..node_count`
    pub node_id: usize,
    /// Number of nodes sharing the window
    pub node_count: usize,
    /// Byte offset of the ring area within the shared window
    pub ring_base: u64,
    /// Replication daemon tick, seconds
    pub replication_interval_secs: u64,
    /// Percentile of the histogram treated as hot
    pub hot_page_percent: u32,
}

impl Default for CoherenceConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            node_count: 2,
            ring_base: 0,
            replication_interval_secs: DEFAULT_REPLICATION_INTERVAL_SECS,
            hot_page_percent: DEFAULT_HOT_PAGE_PERCENT,
        }
    }
}

impl CoherenceConfig {
    /// Validate identity and geometry before mapping anything
    pub fn validate(&self) -> Result<(), CoherenceError> {
        if self.node_count < 2 {
            return Err(CoherenceError::InvalidConfiguration(format!(
                "node_count must be at least 2, got {}",
                self.node_count
            )));
        }
        if self.node_id >= self.node_count {
            return Err(CoherenceError::InvalidConfiguration(format!(
                "node_id {} out of range 0..{}",
                self.node_id, self.node_count
            )));
        }
        if self.ring_base % PAGE_SIZE as u64 != 0 {
            return Err(CoherenceError::InvalidConfiguration(format!(
                "ring_base 0x{:x} is not page aligned",
                self.ring_base
            )));
        }
        if self.hot_page_percent == 0 || self.hot_page_percent > 100 {
            return Err(CoherenceError::InvalidConfiguration(format!(
                "hot_page_percent must be in 1..=100, got {}",
                self.hot_page_percent
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(CoherenceConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_single_node() {
        let cfg = CoherenceConfig {
            node_count: 1,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unaligned_ring_base() {
        let cfg = CoherenceConfig {
            ring_base: 100,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
