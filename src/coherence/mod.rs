//! Page coherence engine
//!
//! Per-page MSI coherence maintained entirely in software: the fault-handle
//! table serializes work per page, the action table encodes the protocol,
//! and the engine issues FETCH/INVALIDATE transactions over the messaging
//! layer. Asynchronous fetch completions run through a dedicated work-ring
//! daemon.

pub mod action;
pub mod async_work;
pub mod engine;
pub mod fault_handle;

pub use engine::{CoherenceEngine, FaultResolution};
