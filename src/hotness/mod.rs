//! Hotness tracking and background replication
//!
//! Sampling-driven access counts with exponential aging, an MSB histogram
//! that sets the hotness threshold at a configurable percentile, and the
//! daemon that periodically replicates hot pages and evicts cold replicas.

pub mod daemon;
pub mod histogram;

pub use daemon::{AccessSample, HotnessSampler, ReplicationDaemon};
