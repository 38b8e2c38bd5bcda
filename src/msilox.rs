//! Public API for the coherence core
//!
//! [`Msilox`] wires the subsystems together for one node: the shared-window
//! mapping, the ring transport and its receive loop, the fault engine, the
//! replica pool, the async-completion daemon, and the hotness sampler. The
//! mapping layer calls [`Msilox::on_local_fault`] from its fault upcall;
//! everything else is the control surface.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use crossbeam_queue::ArrayQueue;
use log::warn;

use crate::coherence::async_work::AsyncCompletionDaemon;
use crate::coherence::{CoherenceEngine, FaultResolution};
use crate::config::CoherenceConfig;
use crate::error::CoherenceError;
use crate::hotness::{AccessSample, HotnessSampler, ReplicationDaemon};
use crate::kmsg::receiver::ReceiveLoop;
use crate::kmsg::shm::ShmTransport;
use crate::kmsg::KmsgRouter;
use crate::mapping::{DirectMapping, MappingLayer};
use crate::page::{PageRegistry, PageState};
use crate::replica::pool::ReplicaPool;
use crate::replica::Replica;
use crate::telemetry::{CoherenceStats, CoherenceStatsSnapshot};
use crate::wait_station::{WaitStationRegistry, ASYNC_WORK_RING_SIZE};
use crate::window::SharedWindow;

enum WindowSource {
    File(PathBuf, usize),
    Anonymous(usize),
}

/// Builder for [`Msilox`]
pub struct MsiloxBuilder {
    config: CoherenceConfig,
    window: Option<WindowSource>,
    mapping: Option<Arc<dyn MappingLayer>>,
}

impl Default for MsiloxBuilder {
    fn default() -> Self {
        Self {
            config: CoherenceConfig::default(),
            window: None,
            mapping: None,
        }
    }
}

impl MsiloxBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// This node's id within the window-sharing group
    pub fn node_id(mut self, node_id: usize) -> Self {
        self.config.node_id = node_id;
        self
    }

    /// Number of nodes sharing the window
    pub fn node_count(mut self, node_count: usize) -> Self {
        self.config.node_count = node_count;
        self
    }

    /// Byte offset of the ring area inside the window; must be identical on
    /// every node
    pub fn ring_base(mut self, ring_base: u64) -> Self {
        self.config.ring_base = ring_base;
        self
    }

    /// Map `len` bytes of a devdax device or DAX file as the shared window
    pub fn window_path(mut self, path: impl Into<PathBuf>, len: usize) -> Self {
        self.window = Some(WindowSource::File(path.into(), len));
        self
    }

    /// Use an anonymous mapping; only meaningful for a single process
    pub fn window_anonymous(mut self, len: usize) -> Self {
        self.window = Some(WindowSource::Anonymous(len));
        self
    }

    /// Install the external mapping layer
    pub fn mapping(mut self, mapping: Arc<dyn MappingLayer>) -> Self {
        self.mapping = Some(mapping);
        self
    }

    /// Replication daemon tick in seconds
    pub fn replication_interval_secs(mut self, secs: u64) -> Self {
        self.config.replication_interval_secs = secs;
        self
    }

    /// Percentile of the histogram treated as hot
    pub fn hot_page_percent(mut self, percent: u32) -> Self {
        self.config.hot_page_percent = percent;
        self
    }

    /// Map the window, initialize this node's rings, and start the receive
    /// loop and completion daemon
    pub fn build(self) -> Result<Msilox, CoherenceError> {
        self.config.validate()?;

        let window = Arc::new(match self.window.ok_or_else(|| {
            CoherenceError::InvalidConfiguration("no shared window configured".to_string())
        })? {
            WindowSource::File(path, len) => SharedWindow::map_file(&path, len)?,
            WindowSource::Anonymous(len) => SharedWindow::anonymous(len)?,
        });

        let pages = Arc::new(PageRegistry::new());
        let stats = Arc::new(CoherenceStats::new());
        let mapping = self
            .mapping
            .unwrap_or_else(|| Arc::new(DirectMapping::new(window.len() as u64)));

        let work_ring = Arc::new(ArrayQueue::new(ASYNC_WORK_RING_SIZE));
        let stations = Arc::new(WaitStationRegistry::new(work_ring.clone()));
        let pool = Arc::new(ReplicaPool::new(
            window.clone(),
            pages.clone(),
            mapping.clone(),
            stats.clone(),
        ));
        let router = Arc::new(KmsgRouter::new());

        let engine = Arc::new(CoherenceEngine::new(
            self.config.clone(),
            window.clone(),
            pages.clone(),
            stations,
            pool.clone(),
            router.clone(),
            mapping.clone(),
            stats.clone(),
        ));
        engine.register_callbacks();

        let transport = Arc::new(ShmTransport::new(window.clone(), &self.config)?);
        router.register_ops(transport.clone())?;

        let recv_loop = ReceiveLoop::spawn(transport, router.clone())
            .map_err(|e| CoherenceError::out_of_resources(format!("receive loop: {}", e)))?;
        let async_daemon =
            AsyncCompletionDaemon::spawn(work_ring, window.clone(), pages.clone())
                .map_err(|e| CoherenceError::out_of_resources(format!("async daemon: {}", e)))?;

        let sampler = Arc::new(HotnessSampler::new(
            pages.clone(),
            pool.clone(),
            mapping,
            stats.clone(),
            self.config.hot_page_percent,
        ));
        let (sample_tx, samples_rx) = unbounded();

        Ok(Msilox {
            config: self.config,
            window,
            pages,
            stats,
            pool,
            router,
            engine,
            sampler,
            sample_tx,
            samples_rx,
            recv_loop,
            async_daemon,
            replicationd: Mutex::new(None),
        })
    }
}

/// One node's software-coherence stack over a fabric-shared memory window
pub struct Msilox {
    config: CoherenceConfig,
    window: Arc<SharedWindow>,
    pages: Arc<PageRegistry>,
    stats: Arc<CoherenceStats>,
    pool: Arc<ReplicaPool>,
    router: Arc<KmsgRouter>,
    engine: Arc<CoherenceEngine>,
    sampler: Arc<HotnessSampler>,
    sample_tx: Sender<AccessSample>,
    samples_rx: Receiver<AccessSample>,
    recv_loop: ReceiveLoop,
    async_daemon: AsyncCompletionDaemon,
    replicationd: Mutex<Option<ReplicationDaemon>>,
}

impl std::fmt::Debug for Msilox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Msilox")
            .field("node_id", &self.config.node_id)
            .field("enabled", &self.engine.is_enabled())
            .finish()
    }
}

impl Msilox {
    pub fn builder() -> MsiloxBuilder {
        MsiloxBuilder::new()
    }

    /// This node's id
    pub fn node_id(&self) -> usize {
        self.config.node_id
    }

    /// Turn the coherence layer on; the mapping layer must start routing
    /// fault upcalls through [`Msilox::on_local_fault`]
    pub fn enable(&self) {
        self.engine.set_enabled(true);
    }

    /// Turn the coherence layer off; faults map the raw frame again
    pub fn disable(&self) {
        self.engine.set_enabled(false);
    }

    /// Whether fault upcalls are currently handled
    pub fn is_enabled(&self) -> bool {
        self.engine.is_enabled()
    }

    /// Fault upcall from the mapping layer
    pub fn on_local_fault(
        &self,
        offset: u64,
        is_write: bool,
    ) -> Result<FaultResolution, CoherenceError> {
        self.engine.on_local_fault(offset, is_write)
    }

    /// Feed end for the address-sampling source
    pub fn sample_sender(&self) -> Sender<AccessSample> {
        self.sample_tx.clone()
    }

    /// Start the replication daemon
    pub fn replication_start(
        &self,
        interval: Duration,
        hot_page_percent: u32,
    ) -> Result<(), CoherenceError> {
        let mut guard = self.replicationd.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return Err(CoherenceError::InvalidConfiguration(
                "replication daemon already running".to_string(),
            ));
        }
        self.sampler.set_hot_page_percent(hot_page_percent);
        let daemon =
            ReplicationDaemon::spawn(self.sampler.clone(), self.samples_rx.clone(), interval)
                .map_err(|e| {
                    CoherenceError::out_of_resources(format!("replication daemon: {}", e))
                })?;
        *guard = Some(daemon);
        Ok(())
    }

    /// Stop the replication daemon
    pub fn replication_stop(&self) {
        let daemon = self
            .replicationd
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut daemon) = daemon {
            daemon.stop();
        } else {
            warn!("replication daemon not running");
        }
    }

    /// Run one replication pass now, outside the daemon's schedule
    pub fn replication_pass(&self) {
        // Settle any queued samples first so the pass sees them.
        while let Ok(sample) = self.samples_rx.try_recv() {
            self.sampler.handle_sample(sample);
        }
        self.sampler.replication_pass();
    }

    /// Age all active replicas, then write back and free the entire
    /// inactive list
    pub fn flush_replicas(&self) -> usize {
        self.pool.flush_all()
    }

    /// Shrinker count callback for an external memory-pressure driver
    pub fn shrinker_count(&self) -> usize {
        self.pool.count_objects()
    }

    /// Shrinker scan callback; tries to free about `nr_to_scan` pages
    pub fn shrinker_scan(&self, nr_to_scan: usize) -> usize {
        self.pool.scan_objects(nr_to_scan)
    }

    /// Point-in-time counters
    pub fn stats(&self) -> CoherenceStatsSnapshot {
        self.stats.snapshot()
    }

    /// Zero the counters
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// This node's MSI view of a page
    pub fn page_state(&self, offset: u64) -> PageState {
        self.pages
            .get(offset)
            .map(|p| p.state())
            .unwrap_or(PageState::Invalid)
    }

    /// This node's replica of a page, if one exists
    pub fn replica(&self, offset: u64) -> Option<Arc<Replica>> {
        self.pages.get(offset).and_then(|p| p.replica())
    }

    /// The shared window mapping
    pub fn window(&self) -> &Arc<SharedWindow> {
        &self.window
    }
}

impl Drop for Msilox {
    fn drop(&mut self) {
        self.replication_stop();
        self.recv_loop.stop();
        self.async_daemon.stop();
        self.router.clear_callbacks();
        self.router.unregister_ops();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmsg::ring::ring_stride;
    use crate::window::PAGE_SIZE;

    #[test]
    fn builder_requires_a_window() {
        let err = Msilox::builder().build().unwrap_err();
        assert!(matches!(err, CoherenceError::InvalidConfiguration(_)));
    }

    #[test]
    fn single_node_stack_runs_disabled_by_default() {
        let len = 16 * PAGE_SIZE + (ring_stride() * 4) as usize;
        let lox = Msilox::builder()
            .node_id(0)
            .node_count(2)
            .ring_base(16 * PAGE_SIZE as u64)
            .window_anonymous(len)
            .build()
            .unwrap();
        assert!(!lox.is_enabled());
        let res = lox.on_local_fault(0, false).unwrap();
        assert!(matches!(res, FaultResolution::Original(0)));
        assert_eq!(lox.stats().fault_count, 0);
    }

    #[test]
    fn replication_daemon_start_stop() {
        let len = 16 * PAGE_SIZE + (ring_stride() * 4) as usize;
        let lox = Msilox::builder()
            .node_id(0)
            .node_count(2)
            .ring_base(16 * PAGE_SIZE as u64)
            .window_anonymous(len)
            .build()
            .unwrap();
        lox.replication_start(Duration::from_secs(60), 20).unwrap();
        assert!(lox.replication_start(Duration::from_secs(60), 20).is_err());
        lox.replication_stop();
        lox.replication_start(Duration::from_secs(60), 20).unwrap();
        lox.replication_stop();
    }
}
