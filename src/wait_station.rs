//! Wait-station registry
//!
//! A wait station turns one outbound broadcast needing K ACKs into one
//! sleepable object. Ids come from a bounded, recycled pool; ACK/NACK
//! delivery decrements the expected count, and the waiter that armed the
//! station is woken exactly once when it reaches zero. A NACK from any peer
//! collapses the whole station to failure.
//!
//! Stations used for asynchronous FETCH transactions carry the faulting
//! page's offset; when the last ACK lands, the station is handed to the
//! async-completion work-ring instead of waking a sleeper.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender};
use crossbeam_queue::ArrayQueue;
use crossbeam_utils::CachePadded;
use dashmap::DashMap;
use log::{debug, error, warn};

use crate::error::CoherenceError;

/// Size of the station id space
pub const MAX_WAIT_STATIONS: usize = 65536;
/// Soft threshold: 80% of the pool; above this, async transactions are
/// refused and callers fall back to the synchronous path
pub const WAIT_STATION_THRESHOLD: i64 = 52428;
/// Capacity of the async-completion work-ring
pub const ASYNC_WORK_RING_SIZE: usize = 1024;

/// Outcome observed by the waiter when the expected count reaches zero
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationOutcome {
    /// Every peer acked
    Acked,
    /// At least one peer nacked; the transaction failed as a whole
    Nacked,
}

/// Work handed to the async-completion daemon for an async station
#[derive(Debug, Clone, Copy)]
pub struct AsyncCompletion {
    /// Shared-window offset of the page the FETCH was issued for
    pub window_offset: u64,
    /// Whether the station collapsed to NACK
    pub nacked: bool,
}

struct Station {
    pendings: AtomicI32,
    nacked: AtomicBool,
    /// Page offset for async FETCH stations; None for synchronous waiters
    async_page: Option<u64>,
    done_tx: Sender<StationOutcome>,
}

/// Handle returned by [`WaitStationRegistry::acquire`]
///
/// Holds the station id and the wake channel; the id is recycled when the
/// waiter finishes (or, for async stations, when the completion is queued).
#[derive(Debug)]
pub struct StationHandle {
    pub id: i32,
    done_rx: Receiver<StationOutcome>,
}

/// Per-node registry of in-flight wait stations
pub struct WaitStationRegistry {
    stations: DashMap<i32, Station>,
    free_ids: Mutex<Vec<i32>>,
    next_id: AtomicI32,
    /// Completed async stations, drained by the completion daemon
    completions: Arc<ArrayQueue<AsyncCompletion>>,
    /// Global ACK-count priority datum: incremented every time one of this
    /// node's transactions is fully acked. Lower means higher priority in
    /// write/write races.
    acked_fault_count: CachePadded<AtomicI64>,
    /// Transactions issued but not yet fully acked
    in_flight: CachePadded<AtomicI64>,
}

impl std::fmt::Debug for WaitStationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitStationRegistry")
            .field("active", &self.stations.len())
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish()
    }
}

impl WaitStationRegistry {
    /// Create a registry whose async completions drain into `completions`
    pub fn new(completions: Arc<ArrayQueue<AsyncCompletion>>) -> Self {
        Self {
            stations: DashMap::new(),
            free_ids: Mutex::new(Vec::new()),
            next_id: AtomicI32::new(0),
            completions,
            acked_fault_count: CachePadded::new(AtomicI64::new(0)),
            in_flight: CachePadded::new(AtomicI64::new(0)),
        }
    }

    fn alloc_id(&self) -> Result<i32, CoherenceError> {
        if let Some(id) = self.free_ids.lock().unwrap_or_else(|e| e.into_inner()).pop() {
            return Ok(id);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if id as usize >= MAX_WAIT_STATIONS {
            self.next_id.fetch_sub(1, Ordering::Relaxed);
            return Err(CoherenceError::out_of_resources("wait station id pool"));
        }
        Ok(id)
    }

    fn release_id(&self, id: i32) {
        self.stations.remove(&id);
        self.free_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(id);
    }

    /// Draw a station expecting `expected_acks` ACKs
    ///
    /// `async_page` attaches the faulting page for asynchronous FETCH
    /// transactions; such stations complete into the work-ring instead of
    /// waking the returned handle.
    pub fn acquire(
        &self,
        expected_acks: usize,
        async_page: Option<u64>,
    ) -> Result<StationHandle, CoherenceError> {
        let id = self.alloc_id()?;
        let (done_tx, done_rx) = bounded(1);
        self.stations.insert(
            id,
            Station {
                pendings: AtomicI32::new(expected_acks as i32),
                nacked: AtomicBool::new(false),
                async_page,
                done_tx,
            },
        );
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        Ok(StationHandle { id, done_rx })
    }

    /// Deliver one ACK for station `id`
    pub fn deliver_ack(&self, id: i32) {
        self.deliver(id, false);
    }

    /// Deliver one NACK for station `id`; collapses the station's result
    pub fn deliver_nack(&self, id: i32) {
        self.deliver(id, true);
    }

    fn deliver(&self, id: i32, nack: bool) {
        let Some(station) = self.stations.get(&id) else {
            warn!("wait station: delivery for unknown station id {}", id);
            return;
        };
        if nack {
            station.nacked.store(true, Ordering::Relaxed);
        }
        let remaining = station.pendings.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining > 0 {
            debug!("wait station {}: {} acks still pending", id, remaining);
            return;
        }

        // Last delivery: settle the station.
        let outcome = if station.nacked.load(Ordering::Relaxed) {
            StationOutcome::Nacked
        } else {
            StationOutcome::Acked
        };
        let async_page = station.async_page;
        let done_tx = station.done_tx.clone();
        drop(station);

        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.acked_fault_count.fetch_add(1, Ordering::Relaxed);

        match async_page {
            Some(window_offset) => {
                if self
                    .completions
                    .push(AsyncCompletion {
                        window_offset,
                        nacked: outcome == StationOutcome::Nacked,
                    })
                    .is_err()
                {
                    error!(
                        "wait station {}: async work-ring full, dropping completion",
                        id
                    );
                }
                self.release_id(id);
            }
            None => {
                // Exactly one waiter sleeps on the channel; release happens
                // in wait().
                let _ = done_tx.send(outcome);
            }
        }
    }

    /// Block the caller until every ACK/NACK has arrived
    pub fn wait(&self, handle: StationHandle) -> Result<(), CoherenceError> {
        let outcome = handle
            .done_rx
            .recv()
            .map_err(|_| CoherenceError::out_of_resources("wait station channel"))?;
        self.release_id(handle.id);
        match outcome {
            StationOutcome::Acked => Ok(()),
            StationOutcome::Nacked => Err(CoherenceError::Nacked),
        }
    }

    /// Abandon a station whose broadcast never went out
    pub fn abort(&self, handle: StationHandle) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.release_id(handle.id);
    }

    /// This node's acked-fault count, carried in outbound payloads
    #[inline]
    pub fn acked_fault_count(&self) -> i64 {
        self.acked_fault_count.load(Ordering::Relaxed)
    }

    /// Transactions issued but not yet fully acked
    #[inline]
    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Whether in-flight pressure forces the synchronous transaction path
    #[inline]
    pub fn over_soft_threshold(&self) -> bool {
        self.in_flight() > WAIT_STATION_THRESHOLD
    }
}
