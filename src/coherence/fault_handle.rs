//! Per-page fault handles
//!
//! A fault handle serializes all local and remote work for one shared page.
//! Handles hash by page offset into a fixed set of buckets, each guarded by
//! its own lock; at most one handle exists per page at any time. A local
//! fault that finds an in-progress handle attaches a completion and sleeps
//! until the current owner finishes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Sender};
use log::debug;

use crate::page::PageMeta;

/// Fault-handle flag bits; the low five double as the action-table index
pub const FH_SHARED: u32 = 0x01;
pub const FH_MODIFIED: u32 = 0x02;
pub const FH_NEEDWRITE: u32 = 0x04;
pub const FH_REPLICATED: u32 = 0x08;
pub const FH_REMOTE: u32 = 0x10;
pub const FH_RETRY: u32 = 0x20;

/// Number of hash buckets in the fault table
const FAULT_HASH_SIZE: usize = 31;

/// Serialization and rendezvous object for one page's in-flight fault
#[derive(Debug)]
pub struct FaultHandle {
    /// Shared-window offset of the faulting page
    pub offset: u64,
    flags: AtomicU32,
    action: AtomicU32,
    /// Local faults waiting for the current owner to finish
    waiters: Mutex<Vec<Sender<()>>>,
}

impl FaultHandle {
    fn new(offset: u64) -> Self {
        Self {
            offset,
            flags: AtomicU32::new(0),
            action: AtomicU32::new(0),
            waiters: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    #[inline]
    pub fn has_flag(&self, bit: u32) -> bool {
        self.flags() & bit != 0
    }

    #[inline]
    pub fn set_flag(&self, bit: u32) {
        self.flags.fetch_or(bit, Ordering::AcqRel);
    }

    #[inline]
    pub fn clear_flag(&self, bit: u32) {
        self.flags.fetch_and(!bit, Ordering::AcqRel);
    }

    #[inline]
    pub fn action(&self) -> u32 {
        self.action.load(Ordering::Acquire)
    }

    fn set_action(&self, action: u32) {
        self.action.store(action, Ordering::Release);
    }

    /// Reset flags for a fresh fault and recompute the action mask
    fn arm(&self, remote: bool, is_write: bool, page: &PageMeta) {
        let mut flags = 0;
        if remote {
            flags |= FH_REMOTE;
        }
        if is_write {
            flags |= FH_NEEDWRITE;
        }
        if page.is_shared() {
            flags |= FH_SHARED;
        }
        if page.is_modified() {
            flags |= FH_MODIFIED;
        }
        if page.is_replicated() {
            flags |= FH_REPLICATED;
        }
        self.flags.store(flags, Ordering::Release);
        self.set_action(super::action::action_for(flags));
    }
}

/// Outcome of entering the table for a local fault
#[derive(Debug)]
pub enum LocalStart {
    /// Caller owns the fault; proceed with the handle's action mask
    Owner(Arc<FaultHandle>),
    /// Woken under a write race; the fault must be re-driven from scratch
    Redrive,
}

/// Outcome of entering the table for a remote fault
#[derive(Debug)]
pub enum RemoteStart {
    /// Refuse the request
    Nack,
    /// Fresh remote handle; perform the handle's remote actions, then ACK
    Owner(Arc<FaultHandle>),
    /// A local fault for the page is in progress but the remote side wins;
    /// ACK without performing remote actions
    Attached(Arc<FaultHandle>),
}

/// Sharded fault-handle table
#[derive(Debug)]
pub struct FaultTable {
    buckets: [Mutex<Vec<Arc<FaultHandle>>>; FAULT_HASH_SIZE],
}

impl Default for FaultTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultTable {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| Mutex::new(Vec::new())),
        }
    }

    #[inline]
    fn bucket(&self, offset: u64) -> &Mutex<Vec<Arc<FaultHandle>>> {
        let page_number = offset >> crate::window::PAGE_SHIFT;
        &self.buckets[(page_number % FAULT_HASH_SIZE as u64) as usize]
    }

    /// Begin local fault handling for `page`
    ///
    /// Blocks while another fault owns the page. The woken waiter re-arms
    /// the existing handle, unless the owner was upgrading for a write, in
    /// which case the caller must re-drive the fault.
    pub fn start_local(&self, page: &PageMeta, is_write: bool) -> LocalStart {
        let bucket = self.bucket(page.offset);
        let mut guard = bucket.lock().unwrap_or_else(|e| e.into_inner());

        let existing = guard.iter().find(|fh| fh.offset == page.offset).cloned();
        let handle = match existing {
            Some(fh) => {
                debug!(
                    "fault 0x{:x}: attaching to in-progress {} handle",
                    page.offset,
                    if fh.has_flag(FH_REMOTE) { "remote" } else { "local" }
                );
                let (tx, rx) = bounded(1);
                fh.waiters
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(tx);
                drop(guard);
                let _ = rx.recv();

                if fh.has_flag(FH_NEEDWRITE) {
                    // The previous owner invalidated our would-be state.
                    let mut guard = bucket.lock().unwrap_or_else(|e| e.into_inner());
                    guard.retain(|h| !Arc::ptr_eq(h, &fh));
                    return LocalStart::Redrive;
                }
                guard = bucket.lock().unwrap_or_else(|e| e.into_inner());
                fh
            }
            None => {
                let fh = Arc::new(FaultHandle::new(page.offset));
                guard.push(fh.clone());
                fh
            }
        };

        handle.arm(false, is_write, page);
        drop(guard);
        debug!(
            "fault 0x{:x}: local handle armed, action 0x{:x}",
            page.offset,
            handle.action()
        );
        LocalStart::Owner(handle)
    }

    /// Finish local fault handling; true when the fault must be re-driven
    pub fn finish_local(&self, fh: &Arc<FaultHandle>) -> bool {
        let bucket = self.bucket(fh.offset);
        let guard = bucket.lock().unwrap_or_else(|e| e.into_inner());
        let retry = fh.has_flag(FH_RETRY);

        let waiter = fh
            .waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        match waiter {
            Some(tx) => {
                // Hand the handle to the next local fault in line.
                drop(guard);
                let _ = tx.send(());
            }
            None => {
                let mut guard = guard;
                guard.retain(|h| !Arc::ptr_eq(h, fh));
            }
        }
        retry
    }

    /// Begin remote fault handling, applying the priority rules
    ///
    /// `remote_acked_count` is the sender's acked-fault count snapshot from
    /// the message payload; lower count wins write/write races, node id
    /// breaks ties.
    pub fn start_remote(
        &self,
        page: &PageMeta,
        is_write: bool,
        remote_acked_count: i64,
        remote_nid: i32,
        local_nid: i32,
        local_acked_count: i64,
    ) -> RemoteStart {
        let bucket = self.bucket(page.offset);
        let mut guard = bucket.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(fh) = guard.iter().find(|fh| fh.offset == page.offset).cloned() {
            if fh.has_flag(FH_REMOTE) {
                // Another remote fault is already being serviced.
                return RemoteStart::Nack;
            }
            if remote_has_lower_priority(
                &fh,
                is_write,
                remote_acked_count,
                remote_nid,
                local_nid,
                local_acked_count,
            ) {
                return RemoteStart::Nack;
            }
            // The remote side wins or the faults are compatible. A winning
            // write forces the local owner to re-drive once it wakes.
            if is_write {
                fh.set_flag(FH_RETRY);
            }
            return RemoteStart::Attached(fh);
        }

        let fh = Arc::new(FaultHandle::new(page.offset));
        fh.arm(true, is_write, page);
        guard.push(fh.clone());
        debug!(
            "fault 0x{:x}: remote handle armed, action 0x{:x}",
            page.offset,
            fh.action()
        );
        RemoteStart::Owner(fh)
    }

    /// Finish remote fault handling
    pub fn finish_remote(&self, fh: &Arc<FaultHandle>) {
        let bucket = self.bucket(fh.offset);
        let guard = bucket.lock().unwrap_or_else(|e| e.into_inner());

        let waiter = fh
            .waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        if let Some(tx) = waiter {
            drop(guard);
            let _ = tx.send(());
            return;
        }
        if fh.has_flag(FH_REMOTE) {
            let mut guard = guard;
            guard.retain(|h| !Arc::ptr_eq(h, fh));
        }
    }

    /// Number of live handles, across all buckets
    #[cfg(test)]
    pub fn live_handles(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.lock().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }
}

/// Priority rule for an incoming remote fault against a local in-progress
/// fault; true means the remote side loses and must be NACKed
fn remote_has_lower_priority(
    fh: &FaultHandle,
    remote_is_write: bool,
    remote_acked_count: i64,
    remote_nid: i32,
    local_nid: i32,
    local_acked_count: i64,
) -> bool {
    let local_is_write = fh.has_flag(FH_NEEDWRITE);

    // A write always beats a read.
    if !remote_is_write && local_is_write {
        return true;
    }

    if remote_is_write && local_is_write {
        if remote_acked_count < local_acked_count {
            return false;
        }
        if remote_acked_count > local_acked_count {
            return true;
        }
        // Equal ACK counts: lower node id wins.
        return local_nid < remote_nid;
    }

    false
}
