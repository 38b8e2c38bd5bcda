//! The fault engine
//!
//! Sole authority over page-state transitions. Application threads enter
//! through [`CoherenceEngine::on_local_fault`]; the receive loop enters
//! through the per-type message handlers installed by
//! [`CoherenceEngine::register_callbacks`]. Each fault serializes against
//! all other work on its page via the fault-handle table, probes the page's
//! metadata bits, and dispatches the fixed action mask from the action
//! table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, error, warn};

use crate::coherence::action::{
    ACT_INVALID, ACT_ISSUE_ASYNC_TRANSACTION, ACT_ISSUE_SYNC_TRANSACTION, ACT_MAP_VPN_TO_PFN,
    ACT_UPDATE_METADATA, ACT_WAIT_FOR_ASYNC_TRANSACTION, ACT_WRITEBACK, ACT_INVALIDATE,
};
use crate::coherence::fault_handle::{
    FaultTable, LocalStart, RemoteStart, FH_MODIFIED, FH_NEEDWRITE, FH_REPLICATED, FH_SHARED,
};
use crate::config::CoherenceConfig;
use crate::error::CoherenceError;
use crate::kmsg::{KmsgRouter, Message, MessageHandler, MsgType, Payload};
use crate::mapping::MappingLayer;
use crate::page::{PageMeta, PageRegistry, PG_COHERENCE, PG_MODIFIED, PG_SHARED};
use crate::replica::pool::{CreateOutcome, ReplicaPool};
use crate::replica::Replica;
use crate::telemetry::CoherenceStats;
use crate::wait_station::WaitStationRegistry;
use crate::window::{SharedWindow, PMD_ORDER};

/// Back-off before asking the caller to re-drive a fault
const RETRY_SLEEP: Duration = Duration::from_millis(1);
/// Sleep between wait-station or broadcast retries
const TRANSIENT_SLEEP: Duration = Duration::from_millis(10);
/// Transient-failure retries before giving up on a transaction
const MAX_TRANSIENT_RETRIES: u32 = 1000;
/// Polls while waiting for an in-flight async fetch to settle
const MAX_ASYNC_WAIT_POLLS: u32 = 100;

/// What the mapping layer should install for a handled fault
#[derive(Debug, Clone)]
pub enum FaultResolution {
    /// Map the raw shared page at this window offset
    Original(u64),
    /// Map the local replica
    Replica(Arc<Replica>),
    /// Re-drive the fault from scratch after a short back-off
    Retry,
}

/// Per-node coherence engine
pub struct CoherenceEngine {
    config: CoherenceConfig,
    window: Arc<SharedWindow>,
    pages: Arc<PageRegistry>,
    faults: FaultTable,
    stations: Arc<WaitStationRegistry>,
    pool: Arc<ReplicaPool>,
    router: Arc<KmsgRouter>,
    mapping: Arc<dyn MappingLayer>,
    stats: Arc<CoherenceStats>,
    enabled: AtomicBool,
}

impl std::fmt::Debug for CoherenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoherenceEngine")
            .field("node_id", &self.config.node_id)
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .finish()
    }
}

impl CoherenceEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CoherenceConfig,
        window: Arc<SharedWindow>,
        pages: Arc<PageRegistry>,
        stations: Arc<WaitStationRegistry>,
        pool: Arc<ReplicaPool>,
        router: Arc<KmsgRouter>,
        mapping: Arc<dyn MappingLayer>,
        stats: Arc<CoherenceStats>,
    ) -> Self {
        Self {
            config,
            window,
            pages,
            faults: FaultTable::new(),
            stations,
            pool,
            router,
            mapping,
            stats,
            enabled: AtomicBool::new(false),
        }
    }

    /// Toggle the coherence layer; while disabled, faults map the raw frame
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        log::info!(
            "page coherence {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Install this engine's message callbacks on the router
    pub fn register_callbacks(self: &Arc<Self>) {
        let requests: Arc<dyn MessageHandler> = Arc::new(RequestHandler(Arc::downgrade(self)));
        let delivery: Arc<dyn MessageHandler> = Arc::new(DeliveryHandler(Arc::downgrade(self)));
        for ty in [MsgType::Fetch, MsgType::Invalidate] {
            self.router.register_callback(ty, requests.clone());
        }
        for ty in [
            MsgType::FetchAck,
            MsgType::FetchNack,
            MsgType::InvalidateAck,
            MsgType::InvalidateNack,
        ] {
            self.router.register_callback(ty, delivery.clone());
        }
        self.router
            .register_callback(MsgType::Error, Arc::new(PeerErrorHandler));
    }

    /// Handle a fault upcall from the mapping layer
    ///
    /// May block until the coherence transaction for this page completes.
    /// On [`FaultResolution::Retry`] the caller must re-drive the fault from
    /// scratch.
    pub fn on_local_fault(
        &self,
        offset: u64,
        is_write: bool,
    ) -> Result<FaultResolution, CoherenceError> {
        if !self.is_enabled() || !self.window.contains_page(offset) {
            return Ok(FaultResolution::Original(offset));
        }

        self.stats.record_fault(is_write);
        let page = self.pages.get_or_insert(offset);
        page.set_flags(PG_COHERENCE);

        let fh = match self.faults.start_local(&page, is_write) {
            LocalStart::Owner(fh) => fh,
            LocalStart::Redrive => {
                std::thread::sleep(RETRY_SLEEP);
                return Ok(FaultResolution::Retry);
            }
        };

        let action = fh.action();
        if action == ACT_INVALID {
            let flags = fh.flags();
            self.faults.finish_local(&fh);
            return Err(CoherenceError::invariant(format!(
                "local fault hit invalid action cell, flags 0x{:x}",
                flags
            )));
        }

        if action & ACT_WAIT_FOR_ASYNC_TRANSACTION != 0 {
            self.wait_for_async_fetch(&page);
        }

        let had_replica = fh.has_flag(FH_REPLICATED);
        let mut took_sync = false;

        // Synchronous when the action demands it, or when in-flight pressure
        // leaves no room for the latency-hiding path.
        if action & ACT_ISSUE_SYNC_TRANSACTION != 0
            || (action & ACT_ISSUE_ASYNC_TRANSACTION != 0 && self.stations.over_soft_threshold())
        {
            took_sync = true;
            match self.issue_sync_transaction(&fh) {
                Ok(()) => {}
                Err(CoherenceError::Nacked) => {
                    debug!("fault 0x{:x}: transaction nacked, re-driving", offset);
                    self.faults.finish_local(&fh);
                    std::thread::sleep(RETRY_SLEEP);
                    return Ok(FaultResolution::Retry);
                }
                Err(e) => {
                    self.faults.finish_local(&fh);
                    return Err(e);
                }
            }
        } else if action & ACT_ISSUE_ASYNC_TRANSACTION != 0 {
            if let Err(e) = self.issue_async_transaction(&fh) {
                self.faults.finish_local(&fh);
                return Err(e);
            }
        }

        if action & ACT_UPDATE_METADATA != 0 {
            update_local_metadata(&page, is_write);
        }

        // A completed synchronous transaction promoted the page to S or M;
        // shadow it locally so later accesses stay off the fabric.
        if took_sync && action & ACT_MAP_VPN_TO_PFN != 0 && !had_replica {
            match self.pool.create_replica(offset, 0) {
                Ok(CreateOutcome::Created) => fh.set_flag(FH_REPLICATED),
                Ok(CreateOutcome::Skipped) => {}
                Err(e) => {
                    // Degrade to mapping the raw frame.
                    warn!("fault 0x{:x}: replica creation failed: {}", offset, e);
                }
            }
        }

        let resolution = if action & ACT_MAP_VPN_TO_PFN != 0 && fh.has_flag(FH_REPLICATED) {
            match page.replica() {
                Some(replica) => {
                    if had_replica {
                        self.stats
                            .replica_found_count
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    FaultResolution::Replica(replica)
                }
                None => FaultResolution::Original(offset),
            }
        } else {
            FaultResolution::Original(offset)
        };

        if self.faults.finish_local(&fh) {
            debug!("fault 0x{:x}: lost a write race, re-driving", offset);
            std::thread::sleep(RETRY_SLEEP);
            return Ok(FaultResolution::Retry);
        }
        Ok(resolution)
    }

    /// Wait for an in-flight async fetch on a stale-Shared page to settle
    fn wait_for_async_fetch(&self, page: &PageMeta) {
        for _ in 0..MAX_ASYNC_WAIT_POLLS {
            if !(page.is_modified() && page.is_shared()) {
                return;
            }
            std::thread::sleep(RETRY_SLEEP);
        }
        debug!(
            "fault 0x{:x}: async fetch still pending, proceeding synchronously",
            page.offset
        );
    }

    /// Broadcast the transactions this fault requires and sleep on the ACKs
    fn issue_sync_transaction(
        &self,
        fh: &crate::coherence::fault_handle::FaultHandle,
    ) -> Result<(), CoherenceError> {
        // Get Shared.
        if !fh.has_flag(FH_NEEDWRITE) && !fh.has_flag(FH_SHARED) && !fh.has_flag(FH_MODIFIED) {
            self.broadcast_and_wait(MsgType::Fetch, fh.offset)?;
        }
        // Get Modified / upgrade.
        if fh.has_flag(FH_NEEDWRITE) && !fh.has_flag(FH_MODIFIED) {
            self.broadcast_and_wait(MsgType::Invalidate, fh.offset)?;
        }
        // A replica that was not in Shared state holds pre-transaction
        // bytes; refresh it from the window.
        if fh.has_flag(FH_REPLICATED) && !fh.has_flag(FH_SHARED) {
            let page = self.pages.get_or_insert(fh.offset);
            self.pool.fetch_replica(&page)?;
        }
        Ok(())
    }

    fn broadcast_and_wait(&self, msg_type: MsgType, offset: u64) -> Result<(), CoherenceError> {
        let node_count = self.router.node_count();
        if node_count < 2 {
            // No transport, or nobody to talk to; the local path still
            // completes.
            return Ok(());
        }
        let payload = Payload::new(offset, 0, self.stations.acked_fault_count());

        let mut attempts = 0;
        let ws = loop {
            match self.stations.acquire(node_count - 1, None) {
                Ok(ws) => break ws,
                Err(e) => {
                    attempts += 1;
                    if attempts > MAX_TRANSIENT_RETRIES {
                        return Err(e);
                    }
                    warn!("fault 0x{:x}: wait station unavailable, retrying", offset);
                    std::thread::sleep(TRANSIENT_SLEEP);
                }
            }
        };

        let mut attempts = 0;
        loop {
            match self.router.broadcast(msg_type, ws.id, payload) {
                Ok(()) => break,
                Err(CoherenceError::TransportUnavailable) => {
                    self.stations.abort(ws);
                    return Ok(());
                }
                Err(e) => {
                    attempts += 1;
                    if attempts > MAX_TRANSIENT_RETRIES {
                        self.stations.abort(ws);
                        return Err(e);
                    }
                    warn!(
                        "fault 0x{:x}: broadcast of {:?} failed ({}), retrying",
                        offset, msg_type, e
                    );
                    std::thread::sleep(TRANSIENT_SLEEP);
                }
            }
        }

        self.stations.wait(ws)
    }

    /// Broadcast a FETCH without waiting; completion runs through the
    /// async work-ring
    fn issue_async_transaction(
        &self,
        fh: &crate::coherence::fault_handle::FaultHandle,
    ) -> Result<(), CoherenceError> {
        let node_count = self.router.node_count();
        if node_count < 2 {
            return Ok(());
        }
        let payload = Payload::new(fh.offset, 0, self.stations.acked_fault_count());
        let ws = self.stations.acquire(node_count - 1, Some(fh.offset))?;
        match self.router.broadcast(MsgType::Fetch, ws.id, payload) {
            Ok(()) => Ok(()),
            Err(CoherenceError::TransportUnavailable) => {
                self.stations.abort(ws);
                Ok(())
            }
            Err(e) => {
                self.stations.abort(ws);
                Err(e)
            }
        }
    }

    /// Service a FETCH or INVALIDATE from a peer; always answers exactly once
    pub fn on_remote_message(&self, msg: Message) -> Result<(), CoherenceError> {
        let ty = msg
            .msg_type()
            .ok_or_else(|| CoherenceError::invalid_message("unknown type".to_string()))?;
        let is_write = ty == MsgType::Invalidate;
        let ws_id = msg.header.ws_id;
        let from = msg.header.from_nid as usize;
        let payload = msg.payload;

        if payload.page_order != 0 && payload.page_order != PMD_ORDER {
            warn!(
                "remote fault: bad page order {} from node {}",
                payload.page_order, from
            );
            let _ = self.router.unicast(ty.nack(), ws_id, from, payload);
            return Err(CoherenceError::invalid_message(format!(
                "page order {}",
                payload.page_order
            )));
        }
        if !self.window.contains_page(payload.window_offset) {
            warn!(
                "remote fault: offset 0x{:x} outside window, from node {}",
                payload.window_offset, from
            );
            let _ = self.router.unicast(ty.nack(), ws_id, from, payload);
            return Err(CoherenceError::invalid_message(format!(
                "offset 0x{:x}",
                payload.window_offset
            )));
        }

        let page = self.pages.get_or_insert(payload.window_offset);
        match self.faults.start_remote(
            &page,
            is_write,
            payload.acked_fault_count,
            msg.header.from_nid,
            self.config.node_id as i32,
            self.stations.acked_fault_count(),
        ) {
            RemoteStart::Nack => {
                debug!(
                    "remote fault 0x{:x}: nacking node {}",
                    payload.window_offset, from
                );
                self.router.unicast(ty.nack(), ws_id, from, payload)
            }
            RemoteStart::Attached(fh) => {
                // A local fault owns the page but the remote side won the
                // priority check; it was marked for retry, so just ACK.
                let result = self.router.unicast(ty.ack(), ws_id, from, payload);
                self.faults.finish_remote(&fh);
                result
            }
            RemoteStart::Owner(fh) => {
                let action = fh.action();
                if action == ACT_INVALID {
                    error!(
                        "remote fault 0x{:x}: invalid action cell, flags 0x{:x}; acking best-effort",
                        payload.window_offset,
                        fh.flags()
                    );
                    let result = self.router.unicast(ty.ack(), ws_id, from, payload);
                    self.faults.finish_remote(&fh);
                    return result;
                }
                if action & ACT_WRITEBACK != 0 {
                    self.writeback_page(&page);
                }
                if action & ACT_INVALIDATE != 0 {
                    self.invalidate_page(&page);
                }
                if action & ACT_UPDATE_METADATA != 0 {
                    update_remote_metadata(&page, is_write);
                }
                let result = self.router.unicast(ty.ack(), ws_id, from, payload);
                self.faults.finish_remote(&fh);
                result
            }
        }
    }

    /// Drain modified data back into the shared page
    fn writeback_page(&self, page: &PageMeta) {
        match page.replica() {
            Some(replica) => self.pool.writeback_replica(&replica),
            // Dirty lines may still sit in this CPU's cache.
            None => self.window.flush_page(page.offset),
        }
        self.mapping.write_protect(page.offset, 1);
    }

    /// Drop this node's copy of the page
    fn invalidate_page(&self, page: &PageMeta) {
        match page.replica() {
            Some(replica) => self.pool.drop_replica(&replica),
            None => self.mapping.unmap_pages(page.offset, 1),
        }
    }

    /// Deliver an ACK or NACK to its wait station
    pub fn on_delivery(&self, msg: Message) -> Result<(), CoherenceError> {
        match msg.msg_type() {
            Some(MsgType::FetchNack) | Some(MsgType::InvalidateNack) => {
                self.stations.deliver_nack(msg.header.ws_id);
            }
            _ => self.stations.deliver_ack(msg.header.ws_id),
        }
        Ok(())
    }

    /// Shared page registry
    pub fn pages(&self) -> &Arc<PageRegistry> {
        &self.pages
    }

    /// Replica pool
    pub fn pool(&self) -> &Arc<ReplicaPool> {
        &self.pool
    }
}

/// Metadata transition after a local fault
fn update_local_metadata(page: &PageMeta, is_write: bool) {
    if is_write {
        page.set_flags(PG_MODIFIED);
        page.clear_flags(PG_SHARED);
    } else {
        page.set_flags(PG_SHARED);
        page.clear_flags(PG_MODIFIED);
    }
}

/// Metadata transition after servicing a remote fault
fn update_remote_metadata(page: &PageMeta, is_write: bool) {
    if is_write {
        // Invalidation: drop to I.
        page.clear_flags(PG_MODIFIED | PG_SHARED);
    } else {
        // Downgrade M to S.
        page.set_flags(PG_SHARED);
        page.clear_flags(PG_MODIFIED);
    }
}

struct RequestHandler(Weak<CoherenceEngine>);

impl MessageHandler for RequestHandler {
    fn handle(&self, msg: Message) -> Result<(), CoherenceError> {
        match self.0.upgrade() {
            Some(engine) => engine.on_remote_message(msg),
            None => Ok(()),
        }
    }
}

struct DeliveryHandler(Weak<CoherenceEngine>);

impl MessageHandler for DeliveryHandler {
    fn handle(&self, msg: Message) -> Result<(), CoherenceError> {
        match self.0.upgrade() {
            Some(engine) => engine.on_delivery(msg),
            None => Ok(()),
        }
    }
}

struct PeerErrorHandler;

impl MessageHandler for PeerErrorHandler {
    fn handle(&self, msg: Message) -> Result<(), CoherenceError> {
        error!(
            "peer error from node {} for offset 0x{:x}",
            msg.header.from_nid, msg.payload.window_offset
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::DirectMapping;
    use crate::wait_station::ASYNC_WORK_RING_SIZE;
    use crate::window::PAGE_SIZE;
    use crossbeam_queue::ArrayQueue;

    fn engine() -> Arc<CoherenceEngine> {
        let config = CoherenceConfig::default();
        let window = Arc::new(SharedWindow::anonymous(64 * PAGE_SIZE).unwrap());
        let pages = Arc::new(PageRegistry::new());
        let mapping: Arc<dyn MappingLayer> = Arc::new(DirectMapping::new(window.len() as u64));
        let stats = Arc::new(CoherenceStats::new());
        let stations = Arc::new(WaitStationRegistry::new(Arc::new(ArrayQueue::new(
            ASYNC_WORK_RING_SIZE,
        ))));
        let pool = Arc::new(ReplicaPool::new(
            window.clone(),
            pages.clone(),
            mapping.clone(),
            stats.clone(),
        ));
        let router = Arc::new(KmsgRouter::new());
        let engine = Arc::new(CoherenceEngine::new(
            config, window, pages, stations, pool, router, mapping, stats,
        ));
        engine.set_enabled(true);
        engine
    }

    #[test]
    fn disabled_engine_maps_raw_frame() {
        let engine = engine();
        engine.set_enabled(false);
        let res = engine.on_local_fault(0, false).unwrap();
        assert!(matches!(res, FaultResolution::Original(0)));
        assert_eq!(engine.stats.snapshot().fault_count, 0);
    }

    #[test]
    fn out_of_window_fault_maps_raw_frame() {
        let engine = engine();
        let res = engine.on_local_fault(1 << 40, false).unwrap();
        assert!(matches!(res, FaultResolution::Original(_)));
    }

    // Without a registered transport the remote effect is a no-op but the
    // local path must still complete.
    #[test]
    fn read_fault_without_transport_becomes_shared() {
        let engine = engine();
        let offset = PAGE_SIZE as u64;
        let res = engine.on_local_fault(offset, false).unwrap();
        assert!(matches!(res, FaultResolution::Original(_)));
        let page = engine.pages.get(offset).unwrap();
        assert!(page.is_shared());
        assert!(!page.is_modified());
        assert!(page.is_coherence());
    }

    #[test]
    fn write_fault_without_transport_becomes_modified_with_replica() {
        let engine = engine();
        let offset = 2 * PAGE_SIZE as u64;
        let content = [0x42u8; PAGE_SIZE];
        engine.window.write_page(offset, &content);

        let res = engine.on_local_fault(offset, true).unwrap();
        let page = engine.pages.get(offset).unwrap();
        assert!(page.is_modified());
        assert!(!page.is_shared());
        match res {
            FaultResolution::Replica(replica) => {
                let mut copy = [0u8; PAGE_SIZE];
                replica.copy_to(&mut copy);
                assert_eq!(copy, content);
            }
            other => panic!("expected replica mapping, got {:?}", other),
        }
        assert_eq!(engine.stats.snapshot().fault_write_count, 1);
    }

    #[test]
    fn modified_page_faults_stay_local() {
        let engine = engine();
        let offset = 3 * PAGE_SIZE as u64;
        engine.on_local_fault(offset, true).unwrap();
        // Second write fault: already Modified, no transaction, replica hit.
        let res = engine.on_local_fault(offset, true).unwrap();
        assert!(matches!(res, FaultResolution::Replica(_)));
        assert_eq!(engine.stats.snapshot().replica_found_count, 1);
    }

    #[test]
    fn invalid_local_cell_is_reported() {
        let engine = engine();
        let offset = 4 * PAGE_SIZE as u64;
        let page = engine.pages.get_or_insert(offset);
        engine.pool.create_replica(offset, 0).unwrap();
        page.set_flags(PG_SHARED | PG_MODIFIED);

        let err = engine.on_local_fault(offset, false).unwrap_err();
        assert!(matches!(err, CoherenceError::InvariantViolation(_)));
        // The handle was cleaned up; a later fault may proceed.
        page.clear_flags(PG_MODIFIED);
        engine.on_local_fault(offset, false).unwrap();
    }

    #[test]
    fn remote_invalidate_drops_to_invalid() {
        let engine = engine();
        let offset = 5 * PAGE_SIZE as u64;
        engine.on_local_fault(offset, true).unwrap();
        let page = engine.pages.get(offset).unwrap();
        assert!(page.is_modified());
        assert!(page.is_replicated());

        let msg = Message {
            header: crate::kmsg::MsgHeader {
                msg_type: MsgType::Invalidate as i32,
                ws_id: 3,
                from_nid: 1,
                to_nid: 0,
            },
            payload: Payload::new(offset, 0, 0),
        };
        // No transport: the ACK send reports TransportUnavailable.
        let err = engine.on_remote_message(msg).unwrap_err();
        assert_eq!(err, CoherenceError::TransportUnavailable);
        assert!(!page.is_modified());
        assert!(!page.is_shared());
        assert!(!page.is_replicated());
    }

    #[test]
    fn remote_fetch_downgrades_modified_to_shared() {
        let engine = engine();
        let offset = 6 * PAGE_SIZE as u64;
        engine.on_local_fault(offset, true).unwrap();
        let page = engine.pages.get(offset).unwrap();
        let replica = page.replica().unwrap();
        let dirty = [0x77u8; PAGE_SIZE];
        replica.copy_from(&dirty);

        let msg = Message {
            header: crate::kmsg::MsgHeader {
                msg_type: MsgType::Fetch as i32,
                ws_id: 9,
                from_nid: 1,
                to_nid: 0,
            },
            payload: Payload::new(offset, 0, 0),
        };
        let _ = engine.on_remote_message(msg);
        assert!(page.is_shared());
        assert!(!page.is_modified());
        // The dirty replica bytes were drained back into the window.
        let mut after = [0u8; PAGE_SIZE];
        engine.window.read_page(offset, &mut after);
        assert_eq!(after, dirty);
    }

    #[test]
    fn remote_bad_page_order_is_invalid_message() {
        let engine = engine();
        let msg = Message {
            header: crate::kmsg::MsgHeader {
                msg_type: MsgType::Fetch as i32,
                ws_id: 0,
                from_nid: 1,
                to_nid: 0,
            },
            payload: Payload::new(0, 3, 0),
        };
        let err = engine.on_remote_message(msg).unwrap_err();
        assert!(matches!(err, CoherenceError::InvalidMessage(_)));
    }
}
