//! Async-transaction completion daemon
//!
//! Asynchronous FETCH transactions return to the faulting thread before
//! their ACKs arrive; the receive loop completes the wait station and hands
//! the page to the work-ring. This daemon drains the ring, flushes the
//! page's cache lines so stale data cached before the fetch is dropped, and
//! clears the MODIFIED bit, moving the page from stale-Shared to Shared.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use log::{debug, info, warn};

use crate::page::{PageRegistry, PG_MODIFIED};
use crate::wait_station::AsyncCompletion;
use crate::window::SharedWindow;

/// Sleep between polls when the work-ring is empty
const IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Handle to the running completion daemon
#[derive(Debug)]
pub struct AsyncCompletionDaemon {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AsyncCompletionDaemon {
    /// Spawn the daemon draining `work_ring`
    pub fn spawn(
        work_ring: Arc<ArrayQueue<AsyncCompletion>>,
        window: Arc<SharedWindow>,
        pages: Arc<PageRegistry>,
    ) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("async-completion".to_string())
            .spawn(move || {
                info!("async completion daemon started");
                while !flag.load(Ordering::Relaxed) {
                    match work_ring.pop() {
                        Some(work) => complete_one(&window, &pages, work),
                        None => std::thread::sleep(IDLE_SLEEP),
                    }
                }
                // Settle anything still queued before exiting.
                while let Some(work) = work_ring.pop() {
                    complete_one(&window, &pages, work);
                }
                info!("async completion daemon stopped");
            })?;
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Signal the daemon to stop and join it
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AsyncCompletionDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}

fn complete_one(window: &SharedWindow, pages: &PageRegistry, work: AsyncCompletion) {
    if work.nacked {
        // The fetch was refused; the page stays stale-Shared and the next
        // read fault will issue a synchronous fetch.
        warn!(
            "async completion: fetch for 0x{:x} was nacked, leaving page stale",
            work.window_offset
        );
        return;
    }
    debug!("async completion: finishing fetch for 0x{:x}", work.window_offset);

    // Drop any stale lines cached before the peers acked, then let the page
    // serve reads as a clean Shared copy.
    window.flush_page(work.window_offset);
    if let Some(page) = pages.get(work.window_offset) {
        page.clear_flags(PG_MODIFIED);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PG_SHARED;
    use crate::wait_station::ASYNC_WORK_RING_SIZE;
    use crate::window::PAGE_SIZE;

    #[test]
    fn completion_clears_modified_bit() {
        let window = Arc::new(SharedWindow::anonymous(4 * PAGE_SIZE).unwrap());
        let pages = Arc::new(PageRegistry::new());
        let page = pages.get_or_insert(PAGE_SIZE as u64);
        page.set_flags(PG_SHARED | PG_MODIFIED);

        let ring = Arc::new(ArrayQueue::new(ASYNC_WORK_RING_SIZE));
        ring.push(AsyncCompletion {
            window_offset: PAGE_SIZE as u64,
            nacked: false,
        })
        .unwrap();

        let mut daemon =
            AsyncCompletionDaemon::spawn(ring.clone(), window, pages.clone()).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while page.is_modified() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        daemon.stop();

        assert!(!page.is_modified());
        assert!(page.is_shared());
    }

    #[test]
    fn nacked_completion_leaves_page_stale() {
        let window = Arc::new(SharedWindow::anonymous(4 * PAGE_SIZE).unwrap());
        let pages = Arc::new(PageRegistry::new());
        let page = pages.get_or_insert(0);
        page.set_flags(PG_SHARED | PG_MODIFIED);

        let ring = Arc::new(ArrayQueue::new(ASYNC_WORK_RING_SIZE));
        ring.push(AsyncCompletion {
            window_offset: 0,
            nacked: true,
        })
        .unwrap();

        let mut daemon =
            AsyncCompletionDaemon::spawn(ring.clone(), window, pages.clone()).unwrap();
        // Stop drains the queue before exiting.
        daemon.stop();

        assert!(page.is_modified());
        assert!(page.is_shared());
    }
}
