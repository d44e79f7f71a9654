// src/conn.rs
use std::cell::UnsafeCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use crate::syscalls;

pub const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const INVALID_FD: RawFd = -1;

// Grow the read buffer once the spare space drops below this.
const BUFFER_HEADROOM: usize = 256;

/// Milliseconds on a process-wide monotonic clock.
pub(crate) fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Per-connection inbound byte buffer. `offset` marks the filled prefix;
/// the rest is spare capacity for the next read.
pub struct ReadBuffer {
    data: Vec<u8>,
    offset: usize,
}

impl ReadBuffer {
    fn new() -> Self {
        Self {
            data: vec![0; INITIAL_BUFFER_CAPACITY],
            offset: 0,
        }
    }

    pub fn reset(&mut self) {
        self.offset = 0;
    }

    pub fn filled(&self) -> &[u8] {
        &self.data[..self.offset]
    }

    pub fn len(&self) -> usize {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }

    pub fn spare_mut(&mut self) -> &mut [u8] {
        let offset = self.offset;
        &mut self.data[offset..]
    }

    pub fn advance(&mut self, n: usize) {
        self.offset += n;
        debug_assert!(self.offset <= self.data.len());
    }

    /// Drop the first `n` filled bytes, shifting the tail down.
    pub fn consume(&mut self, n: usize) {
        if n >= self.offset {
            self.offset = 0;
        } else {
            self.data.copy_within(n..self.offset, 0);
            self.offset -= n;
        }
    }

    /// Double the capacity when the spare space is nearly gone. The frame
    /// cap bounds how far this can go before the connection is closed.
    pub fn grow_if_near_full(&mut self) {
        if self.data.len() - self.offset < BUFFER_HEADROOM {
            let new_len = self.data.len() * 2;
            self.data.resize(new_len, 0);
        }
    }
}

/// One client connection slot.
///
/// Fields inspected across threads (workers, reaper) are atomics. The read
/// buffer belongs to the I/O thread alone and sits behind an `UnsafeCell`;
/// see [`buffer_mut`](Connection::buffer_mut).
pub struct Connection {
    fd: AtomicI32,
    active: AtomicBool,
    pending_requests: AtomicUsize,
    last_activity_ms: AtomicU64,
    // A complete frame is parked in the buffer because the request pool was
    // exhausted; the I/O loop retries it each cycle.
    parked_frames: AtomicBool,
    // Held while one framed response is written, so frames from different
    // workers never interleave on the wire.
    write_gate: Mutex<()>,
    buffer: UnsafeCell<ReadBuffer>,
}

// All fields are Sync except `buffer`, which only the I/O thread touches
// (the contract on `buffer_mut`).
unsafe impl Sync for Connection {}

impl Default for Connection {
    fn default() -> Self {
        Self {
            fd: AtomicI32::new(INVALID_FD),
            active: AtomicBool::new(false),
            pending_requests: AtomicUsize::new(0),
            last_activity_ms: AtomicU64::new(0),
            parked_frames: AtomicBool::new(false),
            write_gate: Mutex::new(()),
            buffer: UnsafeCell::new(ReadBuffer::new()),
        }
    }
}

impl Connection {
    /// Bind the slot to a freshly accepted socket. Runs under exclusive
    /// ownership, right after the slot is claimed.
    pub fn initialize(&self, fd: RawFd) {
        self.pending_requests.store(0, Ordering::Relaxed);
        self.parked_frames.store(false, Ordering::Relaxed);
        self.touch();
        // Exclusive: the slot is not yet visible to other threads.
        unsafe { (*self.buffer.get()).reset() };
        self.fd.store(fd, Ordering::Release);
        self.active.store(true, Ordering::Release);
    }

    /// Close the socket iff the slot still carries `expected`. Exactly one
    /// of several racing closers wins the CAS and performs the close.
    pub fn close_if(&self, expected: RawFd) -> bool {
        if expected == INVALID_FD {
            return false;
        }
        if self
            .fd
            .compare_exchange(expected, INVALID_FD, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.active.store(false, Ordering::Release);
            syscalls::close_fd(expected);
            true
        } else {
            false
        }
    }

    /// Unconditional close, for shutdown sweeps.
    pub fn close(&self) {
        self.active.store(false, Ordering::Release);
        let fd = self.fd.swap(INVALID_FD, Ordering::AcqRel);
        if fd != INVALID_FD {
            syscalls::close_fd(fd);
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        self.last_activity_ms.store(monotonic_ms(), Ordering::Release);
    }

    pub fn is_timed_out(&self) -> bool {
        let last = self.last_activity_ms.load(Ordering::Acquire);
        monotonic_ms().saturating_sub(last) > CONNECTION_TIMEOUT.as_millis() as u64
    }

    pub fn pending_requests(&self) -> usize {
        self.pending_requests.load(Ordering::Acquire)
    }

    pub fn add_pending(&self) {
        self.pending_requests.fetch_add(1, Ordering::AcqRel);
    }

    pub fn sub_pending(&self) {
        let _ = self
            .pending_requests
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn set_parked_frames(&self, parked: bool) {
        self.parked_frames.store(parked, Ordering::Release);
    }

    pub fn has_parked_frames(&self) -> bool {
        self.parked_frames.load(Ordering::Acquire)
    }

    pub(crate) fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutable access to the read buffer.
    ///
    /// # Safety
    ///
    /// Only the I/O thread may call this, and the returned borrow must end
    /// before the next call. Every other thread is limited to the atomic
    /// fields above.
    pub(crate) unsafe fn buffer_mut(&self) -> &mut ReadBuffer {
        &mut *self.buffer.get()
    }

    #[cfg(test)]
    fn backdate_activity(&self, by: Duration) {
        let last = self.last_activity_ms.load(Ordering::Acquire);
        self.last_activity_ms
            .store(last.saturating_sub(by.as_millis() as u64), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_fds() -> (RawFd, RawFd) {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_initialize_and_close() {
        let (read_fd, write_fd) = pipe_fds();
        let conn = Connection::default();
        assert!(!conn.is_active());

        conn.initialize(read_fd);
        assert!(conn.is_active());
        assert_eq!(conn.fd(), read_fd);
        assert_eq!(conn.pending_requests(), 0);

        assert!(!conn.close_if(read_fd + 1000));
        assert!(conn.close_if(read_fd));
        assert!(!conn.is_active());
        assert_eq!(conn.fd(), INVALID_FD);
        // Second close finds nothing to do.
        assert!(!conn.close_if(read_fd));

        syscalls::close_fd(write_fd);
    }

    #[test]
    fn test_pending_counter_never_underflows() {
        let conn = Connection::default();
        conn.add_pending();
        conn.sub_pending();
        conn.sub_pending();
        assert_eq!(conn.pending_requests(), 0);
    }

    #[test]
    fn test_timeout_tracking() {
        let conn = Connection::default();
        conn.touch();
        assert!(!conn.is_timed_out());
        conn.backdate_activity(CONNECTION_TIMEOUT + Duration::from_secs(1));
        assert!(conn.is_timed_out());
    }

    #[test]
    fn test_buffer_fill_consume_grow() {
        let mut buf = ReadBuffer::new();
        assert!(buf.is_empty());

        buf.spare_mut()[..5].copy_from_slice(b"abcde");
        buf.advance(5);
        assert_eq!(buf.filled(), b"abcde");

        buf.consume(2);
        assert_eq!(buf.filled(), b"cde");
        buf.consume(10);
        assert!(buf.is_empty());

        let spare = buf.spare_mut().len();
        buf.advance(spare - 10);
        buf.grow_if_near_full();
        assert!(buf.spare_mut().len() >= INITIAL_BUFFER_CAPACITY);
    }
}
