//! Shared-memory ring transport
//!
//! The production [`MessagingOps`] implementation: N·(N-1) SPSC rings inside
//! the shared window, one per ordered node pair. Each node initializes the
//! rings it sends on; receive rings are initialized by their senders.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info};

use crate::config::CoherenceConfig;
use crate::error::CoherenceError;
use crate::kmsg::ring::{ring_offset, ring_stride, RingWindow, RING_BYTES};
use crate::kmsg::{Message, MessagingOps, MsgHeader, MsgType, Payload};
use crate::window::SharedWindow;

/// Ring transport over the shared window
pub struct ShmTransport {
    node_id: usize,
    node_count: usize,
    /// tx[d]: ring this node sends on toward node d (None for self)
    tx: Vec<Option<RingWindow>>,
    /// rx[s]: ring this node receives on from node s (None for self)
    rx: Vec<Option<RingWindow>>,
    /// Round-robin cursor over receive rings
    poll_cursor: AtomicUsize,
    _window: Arc<SharedWindow>,
}

impl std::fmt::Debug for ShmTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmTransport")
            .field("node_id", &self.node_id)
            .field("node_count", &self.node_count)
            .finish()
    }
}

impl ShmTransport {
    /// Map and initialize this node's rings inside the window's ring area
    pub fn new(
        window: Arc<SharedWindow>,
        config: &CoherenceConfig,
    ) -> Result<Self, CoherenceError> {
        let n = config.node_count;
        let area_len = ring_stride() * (n * n) as u64;
        let area_end = config.ring_base + area_len;
        if area_end > window.len() as u64 {
            return Err(CoherenceError::window(format!(
                "ring area [0x{:x}, 0x{:x}) exceeds window length 0x{:x}",
                config.ring_base,
                area_end,
                window.len()
            )));
        }

        let mut tx = Vec::with_capacity(n);
        let mut rx = Vec::with_capacity(n);
        for peer in 0..n {
            if peer == config.node_id {
                tx.push(None);
                rx.push(None);
                continue;
            }
            let tx_off = config.ring_base + ring_offset(config.node_id, peer, n);
            let rx_off = config.ring_base + ring_offset(peer, config.node_id, n);
            let tx_ring = unsafe { RingWindow::from_base(window.at(tx_off)) };
            // The sender owns initialization; the receive ring is set up by
            // the peer.
            tx_ring.init();
            let rx_ring = unsafe { RingWindow::from_base(window.at(rx_off)) };
            debug!(
                "kmsg shm: node {} mapped tx[{}] at 0x{:x}, rx[{}] at 0x{:x}",
                config.node_id, peer, tx_off, peer, rx_off
            );
            tx.push(Some(tx_ring));
            rx.push(Some(rx_ring));
        }

        info!(
            "kmsg shm: node {} ready ({} tx + {} rx rings, {} bytes each)",
            config.node_id,
            n - 1,
            n - 1,
            RING_BYTES
        );

        Ok(Self {
            node_id: config.node_id,
            node_count: n,
            tx,
            rx,
            poll_cursor: AtomicUsize::new(0),
            _window: window,
        })
    }

    fn build_message(
        &self,
        msg_type: MsgType,
        ws_id: i32,
        dest_nid: usize,
        payload: Payload,
    ) -> Message {
        Message {
            header: MsgHeader {
                msg_type: msg_type as i32,
                ws_id,
                from_nid: self.node_id as i32,
                to_nid: dest_nid as i32,
            },
            payload,
        }
    }

    /// Dequeue at most one message, round-robining over the receive rings
    pub fn poll(&self) -> Option<(usize, Message)> {
        let start = self.poll_cursor.fetch_add(1, Ordering::Relaxed);
        for i in 0..self.node_count {
            let src = (start + i) % self.node_count;
            if let Some(ring) = &self.rx[src] {
                if let Some(msg) = ring.get() {
                    return Some((src, msg));
                }
            }
        }
        None
    }
}

impl MessagingOps for ShmTransport {
    fn name(&self) -> &str {
        "shm_ring"
    }

    fn node_count(&self) -> usize {
        self.node_count
    }

    fn unicast(
        &self,
        msg_type: MsgType,
        ws_id: i32,
        dest_nid: usize,
        payload: Payload,
    ) -> Result<(), CoherenceError> {
        if dest_nid >= self.node_count || dest_nid == self.node_id {
            return Err(CoherenceError::invalid_message(format!(
                "invalid destination node {}",
                dest_nid
            )));
        }
        let ring = self.tx[dest_nid]
            .as_ref()
            .ok_or(CoherenceError::TransportUnavailable)?;
        let msg = self.build_message(msg_type, ws_id, dest_nid, payload);
        ring.put(&msg)
    }

    fn broadcast(
        &self,
        msg_type: MsgType,
        ws_id: i32,
        payload: Payload,
    ) -> Result<(), CoherenceError> {
        for dest in 0..self.node_count {
            if dest == self.node_id {
                continue;
            }
            self.unicast(msg_type, ws_id, dest, payload)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Arc<SharedWindow>, ShmTransport, ShmTransport) {
        let cfg_a = CoherenceConfig {
            node_id: 0,
            node_count: 2,
            ring_base: 0,
            ..Default::default()
        };
        let cfg_b = CoherenceConfig {
            node_id: 1,
            ..cfg_a.clone()
        };
        let window =
            Arc::new(SharedWindow::anonymous((ring_stride() * 4) as usize).unwrap());
        let a = ShmTransport::new(window.clone(), &cfg_a).unwrap();
        let b = ShmTransport::new(window.clone(), &cfg_b).unwrap();
        (window, a, b)
    }

    #[test]
    fn unicast_crosses_nodes_in_order() {
        let (_w, a, b) = pair();
        for i in 0..8 {
            a.unicast(MsgType::Fetch, i, 1, Payload::new(i as u64 * 4096, 0, 0))
                .unwrap();
        }
        for i in 0..8 {
            let (src, msg) = b.poll().unwrap();
            assert_eq!(src, 0);
            assert_eq!(msg.header.ws_id, i);
            assert_eq!(msg.header.from_nid, 0);
            assert_eq!(msg.header.to_nid, 1);
        }
        assert!(b.poll().is_none());
    }

    #[test]
    fn unicast_to_self_is_rejected() {
        let (_w, a, _b) = pair();
        assert!(a.unicast(MsgType::Fetch, 0, 0, Payload::new(0, 0, 0)).is_err());
    }

    #[test]
    fn broadcast_reaches_every_peer() {
        let (_w, a, b) = pair();
        a.broadcast(MsgType::Invalidate, 7, Payload::new(4096, 0, 5))
            .unwrap();
        let (src, msg) = b.poll().unwrap();
        assert_eq!(src, 0);
        assert_eq!(msg.msg_type(), Some(MsgType::Invalidate));
        assert_eq!(msg.payload.acked_fault_count, 5);
    }
}
