//! Msilox - software-maintained page coherence for shared memory windows
//!
//! Hardware gives multiple hosts raw access to one fabric-attached memory
//! window but no cache coherence across them. Msilox maintains per-page
//! MSI-style coherence (Modified / Shared / Invalid, with a transient
//! stale-Shared state) entirely in software, using cache-line flushes, page
//! replicas, and inter-node messages over lock-free shared-memory rings.
//!
//! # Architecture
//!
//! - **Fault engine**: serializes local and remote faults per page, drives
//!   the MSI state machine through a fixed action table, and maps each
//!   fault to the raw shared page or a local replica
//! - **Messaging rings**: one SPSC ring per ordered node pair, laid out in
//!   the shared window with an explicit cache flush/invalidate discipline
//! - **Replica pool**: local copies of hot remote pages on a two-list
//!   (active/inactive) reclaim structure with write-back on evict
//! - **Wait stations**: multi-ACK rendezvous objects with recycled ids
//! - **Hotness sampler**: access sampling, aged counts, and a histogram
//!   driven replication/eviction daemon

pub mod config;
pub mod error;
pub mod window;

pub mod kmsg;
pub mod wait_station;

pub mod mapping;
pub mod page;
pub mod replica;

pub mod coherence;
pub mod hotness;

pub mod telemetry;

pub mod msilox;
pub mod prelude;

pub use coherence::{CoherenceEngine, FaultResolution};
pub use config::CoherenceConfig;
pub use error::{CoherenceError, RecoveryHint};
pub use msilox::{Msilox, MsiloxBuilder};
pub use prelude::*;
