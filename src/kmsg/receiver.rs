//! Receive loop
//!
//! One long-lived thread per node drains every inbound ring in round-robin
//! with a 1 ms sleep between passes. Request messages (FETCH/INVALIDATE) are
//! dispatched to spawned workers so the loop never blocks on a fault bucket
//! lock; ACK/NACK delivery is a counter decrement and runs inline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{info, warn};

use crate::kmsg::shm::ShmTransport;
use crate::kmsg::{KmsgRouter, MsgType};

/// Polling interval between ring sweeps
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Handle to the running receive loop
#[derive(Debug)]
pub struct ReceiveLoop {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReceiveLoop {
    /// Spawn the receive thread for this node
    pub fn spawn(transport: Arc<ShmTransport>, router: Arc<KmsgRouter>) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("kmsg-recv".to_string())
            .spawn(move || {
                info!("kmsg recv: receive loop started");
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(POLL_INTERVAL);
                    // Drain every ring until a full pass finds nothing.
                    while let Some((src, msg)) = transport.poll() {
                        let result = match msg.msg_type() {
                            Some(MsgType::Fetch) | Some(MsgType::Invalidate) => {
                                router.process_message(msg)
                            }
                            _ => router.process_message_inline(msg),
                        };
                        if let Err(e) = result {
                            warn!("kmsg recv: failed to process message from node {}: {}", src, e);
                        }
                    }
                }
                info!("kmsg recv: receive loop stopped");
            })?;
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Signal the loop to stop and join it
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReceiveLoop {
    fn drop(&mut self) {
        self.stop();
    }
}
