// src/request.rs
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::conn::monotonic_ms;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Request and response payloads of one in-flight command invocation.
#[derive(Default)]
pub struct RequestBody {
    pub request: Vec<u8>,
    pub response: Vec<u8>,
}

/// One in-flight request slot.
///
/// Ownership hands over exactly once: the I/O thread fills the record and
/// enqueues its index; the worker that pops the index owns it until release.
/// The reaper only reads the atomic fields, under the queue mutex.
pub struct Request {
    client_fd: AtomicI32,
    created_ms: AtomicU64,
    body: UnsafeCell<RequestBody>,
}

// `body` is confined to the single owner at any point in time; the atomics
// carry everything that is read concurrently.
unsafe impl Sync for Request {}

impl Default for Request {
    fn default() -> Self {
        Self {
            client_fd: AtomicI32::new(-1),
            created_ms: AtomicU64::new(0),
            body: UnsafeCell::new(RequestBody::default()),
        }
    }
}

impl Request {
    /// Fill the slot for a freshly framed request. Runs under exclusive
    /// ownership, before the index is enqueued.
    pub fn initialize(&self, client_fd: RawFd, payload: Vec<u8>) {
        self.client_fd.store(client_fd, Ordering::Release);
        self.created_ms.store(monotonic_ms(), Ordering::Release);
        // Exclusive until the index is published through the queue.
        let body = unsafe { &mut *self.body.get() };
        body.request = payload;
        body.response.clear();
    }

    pub fn client_fd(&self) -> RawFd {
        self.client_fd.load(Ordering::Acquire)
    }

    pub fn is_timed_out(&self) -> bool {
        let created = self.created_ms.load(Ordering::Acquire);
        monotonic_ms().saturating_sub(created) > REQUEST_TIMEOUT.as_millis() as u64
    }

    /// Mutable access to the payloads.
    ///
    /// # Safety
    ///
    /// The caller must be the slot's current exclusive owner: the filling
    /// I/O thread before the index is enqueued, or the worker that popped it.
    pub(crate) unsafe fn body_mut(&self) -> &mut RequestBody {
        &mut *self.body.get()
    }

    #[cfg(test)]
    pub(crate) fn backdate_created(&self, by: Duration) {
        let created = self.created_ms.load(Ordering::Acquire);
        self.created_ms
            .store(created.saturating_sub(by.as_millis() as u64), Ordering::Release);
    }
}

/// FIFO of request-slot indices shared between the I/O thread and workers.
/// Bounded implicitly by the request pool's capacity. One condvar wakes
/// workers on push, the other paces the reaper.
pub(crate) struct RequestQueue {
    indices: Mutex<VecDeque<usize>>,
    ready: Condvar,
    reaper: Condvar,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            indices: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            reaper: Condvar::new(),
        }
    }

    pub fn push(&self, index: usize) {
        self.lock().push_back(index);
        self.ready.notify_one();
    }

    /// Block until an index is available, the deadline passes, or `running`
    /// clears. Returns `None` on timeout or shutdown.
    pub fn pop_timeout(&self, timeout: Duration, running: &AtomicBool) -> Option<usize> {
        let guard = self.lock();
        let (mut guard, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |queue| {
                queue.is_empty() && running.load(Ordering::Acquire)
            })
            .unwrap_or_else(PoisonError::into_inner);

        if !running.load(Ordering::Acquire) {
            return None;
        }
        guard.pop_front()
    }

    /// Sleep one reaper interval, waking early on shutdown broadcast.
    pub fn reaper_wait(&self, timeout: Duration) {
        let guard = self.lock();
        let _ = self
            .reaper
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner);
    }

    pub fn wake_all(&self) {
        self.ready.notify_all();
        self.reaper.notify_all();
    }

    pub fn lock(&self) -> MutexGuard<'_, VecDeque<usize>> {
        self.indices.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_request_record_lifecycle() {
        let req = Request::default();
        req.initialize(9, b"payload".to_vec());
        assert_eq!(req.client_fd(), 9);
        assert!(!req.is_timed_out());

        let body = unsafe { req.body_mut() };
        assert_eq!(body.request, b"payload");
        assert!(body.response.is_empty());

        req.backdate_created(REQUEST_TIMEOUT + Duration::from_secs(1));
        assert!(req.is_timed_out());
    }

    #[test]
    fn test_queue_fifo_order() {
        let running = AtomicBool::new(true);
        let queue = RequestQueue::new();
        queue.push(3);
        queue.push(1);
        queue.push(2);

        assert_eq!(queue.pop_timeout(Duration::from_millis(10), &running), Some(3));
        assert_eq!(queue.pop_timeout(Duration::from_millis(10), &running), Some(1));
        assert_eq!(queue.pop_timeout(Duration::from_millis(10), &running), Some(2));
        assert_eq!(queue.pop_timeout(Duration::from_millis(10), &running), None);
    }

    #[test]
    fn test_pop_wakes_on_push() {
        let running = Arc::new(AtomicBool::new(true));
        let queue = Arc::new(RequestQueue::new());

        let popper = {
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);
            thread::spawn(move || queue.pop_timeout(Duration::from_secs(5), &running))
        };

        thread::sleep(Duration::from_millis(20));
        queue.push(7);
        assert_eq!(popper.join().unwrap(), Some(7));
    }

    #[test]
    fn test_pop_returns_none_on_shutdown() {
        let running = Arc::new(AtomicBool::new(true));
        let queue = Arc::new(RequestQueue::new());

        let popper = {
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);
            thread::spawn(move || queue.pop_timeout(Duration::from_secs(5), &running))
        };

        thread::sleep(Duration::from_millis(20));
        running.store(false, Ordering::Release);
        queue.wake_all();
        assert_eq!(popper.join().unwrap(), None);
    }
}
