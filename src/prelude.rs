//! Convenience re-exports for embedding the coherence core

pub use crate::coherence::FaultResolution;
pub use crate::config::CoherenceConfig;
pub use crate::error::CoherenceError;
pub use crate::hotness::AccessSample;
pub use crate::mapping::MappingLayer;
pub use crate::msilox::{Msilox, MsiloxBuilder};
pub use crate::page::PageState;
pub use crate::telemetry::CoherenceStatsSnapshot;
pub use crate::window::PAGE_SIZE;
