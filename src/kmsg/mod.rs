//! Inter-node messaging
//!
//! This module is the abstraction seam between the coherence engine and the
//! transport that actually moves bytes. The engine talks to a registered
//! [`MessagingOps`] vector (unicast/broadcast/node count) and installs
//! per-type [`MessageHandler`] callbacks; the shared-memory ring transport in
//! [`shm`] is the production implementation of the ops vector.

pub mod receiver;
pub mod ring;
pub mod shm;

use std::sync::Arc;
use std::sync::RwLock;

use log::{error, info, warn};

use crate::error::CoherenceError;
use crate::window::cacheflush::CL_SIZE;

/// Message types carried on the wire
///
/// The discriminant values are part of the wire format and must be identical
/// on every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MsgType {
    Fetch = 0,
    FetchAck = 1,
    FetchNack = 2,
    Invalidate = 3,
    InvalidateAck = 4,
    InvalidateNack = 5,
    Error = 6,
}

/// Number of message types; the valid range is `0..MSG_TYPE_MAX`
pub const MSG_TYPE_MAX: i32 = 7;

impl MsgType {
    /// Decode a raw wire discriminant
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(MsgType::Fetch),
            1 => Some(MsgType::FetchAck),
            2 => Some(MsgType::FetchNack),
            3 => Some(MsgType::Invalidate),
            4 => Some(MsgType::InvalidateAck),
            5 => Some(MsgType::InvalidateNack),
            6 => Some(MsgType::Error),
            _ => None,
        }
    }

    /// The NACK type answering a request of this type
    pub fn nack(self) -> MsgType {
        match self {
            MsgType::Invalidate => MsgType::InvalidateNack,
            _ => MsgType::FetchNack,
        }
    }

    /// The ACK type answering a request of this type
    pub fn ack(self) -> MsgType {
        match self {
            MsgType::Invalidate => MsgType::InvalidateAck,
            _ => MsgType::FetchAck,
        }
    }
}

/// Message header; 16 bytes on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct MsgHeader {
    /// Raw [`MsgType`] discriminant
    pub msg_type: i32,
    /// Wait-station id at the sender
    pub ws_id: i32,
    /// Sender node id, filled in by the transport
    pub from_nid: i32,
    /// Destination node id
    pub to_nid: i32,
}

/// Message payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Payload {
    /// Shared-window offset of the page
    pub window_offset: u64,
    /// Page order: 0 for a base page, [`crate::window::PMD_ORDER`] for huge
    pub page_order: i32,
    /// Sender's acked-fault count at send time, for write-race priority
    pub acked_fault_count: i64,
}

impl Payload {
    pub fn new(window_offset: u64, page_order: i32, acked_fault_count: i64) -> Self {
        Self {
            window_offset,
            page_order,
            acked_fault_count,
        }
    }
}

/// One wire message: header + payload, padded to a cache line
#[derive(Debug, Clone, Copy)]
#[repr(C, align(64))]
pub struct Message {
    pub header: MsgHeader,
    pub payload: Payload,
}

const _: () = assert!(std::mem::size_of::<Message>() == CL_SIZE);

impl Message {
    /// Decoded message type, if the raw discriminant is in range
    #[inline]
    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::from_raw(self.header.msg_type)
    }

    /// Reject out-of-range type values and negative header fields
    pub fn validate(&self) -> Result<(), CoherenceError> {
        if self.msg_type().is_none() {
            return Err(CoherenceError::invalid_message(format!(
                "type {} out of range",
                self.header.msg_type
            )));
        }
        if self.header.ws_id < 0 || self.header.from_nid < 0 || self.header.to_nid < 0 {
            return Err(CoherenceError::invalid_message(
                "negative header field".to_string(),
            ));
        }
        Ok(())
    }
}

/// Transport operations registered by a messaging layer
pub trait MessagingOps: Send + Sync {
    /// Name of the messaging implementation, for logs
    fn name(&self) -> &str;

    /// Number of nodes sharing the window
    fn node_count(&self) -> usize;

    /// Send one message to a single peer
    fn unicast(
        &self,
        msg_type: MsgType,
        ws_id: i32,
        dest_nid: usize,
        payload: Payload,
    ) -> Result<(), CoherenceError>;

    /// Fan the message out to every peer; the first error wins
    fn broadcast(&self, msg_type: MsgType, ws_id: i32, payload: Payload)
        -> Result<(), CoherenceError>;
}

/// Per-type message callback installed by the coherence engine
pub trait MessageHandler: Send + Sync {
    fn handle(&self, msg: Message) -> Result<(), CoherenceError>;
}

/// Registry tying the ops vector and the per-type callbacks together
///
/// One router per node. The receive loop hands every inbound message to
/// [`KmsgRouter::process_message`], which dispatches it to the callback for
/// its type on a spawned worker so the loop itself never blocks on a fault
/// bucket lock.
#[derive(Default)]
pub struct KmsgRouter {
    ops: RwLock<Option<Arc<dyn MessagingOps>>>,
    callbacks: RwLock<[Option<Arc<dyn MessageHandler>>; MSG_TYPE_MAX as usize]>,
}

impl KmsgRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the messaging ops vector; at most one may be registered
    pub fn register_ops(&self, ops: Arc<dyn MessagingOps>) -> Result<(), CoherenceError> {
        let mut slot = self.ops.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = slot.as_ref() {
            return Err(CoherenceError::InvalidConfiguration(format!(
                "messaging ops already registered ({})",
                existing.name()
            )));
        }
        info!("kmsg: registered messaging ops: {}", ops.name());
        *slot = Some(ops);
        Ok(())
    }

    /// Drop the registered ops vector
    pub fn unregister_ops(&self) {
        let mut slot = self.ops.write().unwrap_or_else(|e| e.into_inner());
        if let Some(ops) = slot.take() {
            info!("kmsg: unregistered messaging ops: {}", ops.name());
        }
    }

    /// Install the callback for one message type
    pub fn register_callback(&self, msg_type: MsgType, handler: Arc<dyn MessageHandler>) {
        let mut cbs = self.callbacks.write().unwrap_or_else(|e| e.into_inner());
        cbs[msg_type as usize] = Some(handler);
    }

    /// Remove every installed callback; used at shutdown
    pub fn clear_callbacks(&self) {
        let mut cbs = self.callbacks.write().unwrap_or_else(|e| e.into_inner());
        for cb in cbs.iter_mut() {
            *cb = None;
        }
    }

    fn ops(&self) -> Result<Arc<dyn MessagingOps>, CoherenceError> {
        self.ops
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(CoherenceError::TransportUnavailable)
    }

    /// Send one message to a single peer through the registered ops
    pub fn unicast(
        &self,
        msg_type: MsgType,
        ws_id: i32,
        dest_nid: usize,
        payload: Payload,
    ) -> Result<(), CoherenceError> {
        self.ops()?.unicast(msg_type, ws_id, dest_nid, payload)
    }

    /// Broadcast through the registered ops
    pub fn broadcast(
        &self,
        msg_type: MsgType,
        ws_id: i32,
        payload: Payload,
    ) -> Result<(), CoherenceError> {
        self.ops()?.broadcast(msg_type, ws_id, payload)
    }

    /// Number of nodes, or 0 when no ops vector is registered
    pub fn node_count(&self) -> usize {
        self.ops().map(|ops| ops.node_count()).unwrap_or(0)
    }

    /// Dispatch one inbound message to its callback on a worker thread
    pub fn process_message(self: &Arc<Self>, msg: Message) -> Result<(), CoherenceError> {
        msg.validate()?;
        let idx = msg.header.msg_type as usize;
        let handler = {
            let cbs = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
            cbs[idx].clone()
        };
        let Some(handler) = handler else {
            warn!(
                "kmsg: no callback registered for message type {}",
                msg.header.msg_type
            );
            return Err(CoherenceError::invalid_message(format!(
                "no callback for type {}",
                msg.header.msg_type
            )));
        };
        std::thread::Builder::new()
            .name("kmsg-worker".to_string())
            .spawn(move || {
                if let Err(e) = handler.handle(msg) {
                    error!("kmsg: message handler failed: {}", e);
                }
            })
            .map_err(|e| CoherenceError::out_of_resources(format!("worker spawn: {}", e)))?;
        Ok(())
    }

    /// Dispatch one inbound message inline on the calling thread
    ///
    /// ACK/NACK delivery is a counter decrement and never takes a bucket
    /// lock, so the receive loop runs it directly instead of paying a spawn.
    pub fn process_message_inline(&self, msg: Message) -> Result<(), CoherenceError> {
        msg.validate()?;
        let idx = msg.header.msg_type as usize;
        let handler = {
            let cbs = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
            cbs[idx].clone()
        };
        match handler {
            Some(handler) => handler.handle(msg),
            None => Err(CoherenceError::invalid_message(format!(
                "no callback for type {}",
                msg.header.msg_type
            ))),
        }
    }
}
