// src/server.rs
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::conn::{Connection, INVALID_FD};
use crate::error::{Error, Result};
use crate::frame::{self, FrameError};
use crate::pool::SlotPool;
use crate::registry::HandlerRegistry;
use crate::request::{Request, RequestQueue};
use crate::signal::SignalDispatcher;
use crate::stats::{Statistics, StatsSnapshot};
use crate::syscalls;

pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
pub const DEFAULT_MAX_REQUESTS: usize = 100_000;

const POLL_INTERVAL_MS: libc::c_int = 100;
const WORKER_WAIT: Duration = Duration::from_millis(100);
const REAPER_INTERVAL: Duration = Duration::from_secs(5);
// Workers run the request-timeout sweep once per this many requests.
const SWEEP_EVERY: u64 = 1000;
// Accept is skipped while the connection pool is this full.
const ACCEPT_HIGH_WATER: f64 = 0.95;

/// Multi-threaded request/response service over an AF_UNIX stream socket.
///
/// One I/O thread (the caller of [`run`](Self::run)) owns the poll set and
/// all socket reads; N workers execute handlers and write framed responses;
/// one reaper expires idle connections and stale queued requests. Connection
/// and request records come from fixed-capacity lock-free pools.
pub struct ServiceManager {
    shared: Arc<Shared>,
    worker_count: usize,
}

struct Shared {
    socket_path: PathBuf,
    max_connections: usize,
    max_requests: usize,
    listener: AtomicI32,
    running: AtomicBool,
    connections: SlotPool<Connection>,
    requests: SlotPool<Request>,
    queue: RequestQueue,
    registry: HandlerRegistry,
    signals: SignalDispatcher,
    stats: Statistics,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceManager {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self::with_limits(socket_path, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_REQUESTS)
    }

    /// Pool capacities are fixed here; they cannot change after construction.
    pub fn with_limits(
        socket_path: impl AsRef<Path>,
        max_connections: usize,
        max_requests: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                socket_path: socket_path.as_ref().to_path_buf(),
                max_connections,
                max_requests,
                listener: AtomicI32::new(INVALID_FD),
                running: AtomicBool::new(false),
                connections: SlotPool::new(max_connections),
                requests: SlotPool::new(max_requests),
                queue: RequestQueue::new(),
                registry: HandlerRegistry::new(),
                signals: SignalDispatcher::new(),
                stats: Statistics::default(),
                threads: Mutex::new(Vec::new()),
            }),
            worker_count: num_cpus::get().max(1),
        }
    }

    /// Override the worker thread count (defaults to hardware concurrency).
    pub fn workers(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    pub fn register_handler(
        &self,
        command: impl Into<String>,
        handler: impl Fn(&[u8], &mut Vec<u8>) + Send + Sync + 'static,
    ) {
        self.shared.registry.register(command, handler);
    }

    /// Bind the listener, wire the default signals, and spawn the worker and
    /// reaper threads. The poll loop itself runs in [`run`](Self::run).
    pub fn start(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.running.load(Ordering::Acquire) {
            return Err(Error::AlreadyRunning);
        }

        self.setup_default_signals()?;

        let listener = syscalls::create_unix_listener(&shared.socket_path)?;
        shared.listener.store(listener, Ordering::Release);
        shared.running.store(true, Ordering::Release);

        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let mut threads = shared.threads.lock().unwrap_or_else(PoisonError::into_inner);

        for i in 0..self.worker_count {
            let worker_shared = Arc::clone(shared);
            let core_id = if core_ids.is_empty() {
                None
            } else {
                Some(core_ids[i % core_ids.len()])
            };

            let handle = thread::Builder::new()
                .name(format!("ravel-worker-{i}"))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if !core_affinity::set_for_current(id) {
                            tracing::debug!(worker = i, "could not pin worker to a core");
                        }
                    }
                    worker_loop(&worker_shared);
                })
                .map_err(|e| {
                    shared.running.store(false, Ordering::Release);
                    Error::Io(e)
                })?;
            threads.push(handle);
        }

        let reaper_shared = Arc::clone(shared);
        let handle = thread::Builder::new()
            .name("ravel-reaper".to_string())
            .spawn(move || reaper_loop(&reaper_shared))
            .map_err(|e| {
                shared.running.store(false, Ordering::Release);
                Error::Io(e)
            })?;
        threads.push(handle);
        drop(threads);

        tracing::info!(
            path = %shared.socket_path.display(),
            max_connections = shared.max_connections,
            max_requests = shared.max_requests,
            workers = self.worker_count,
            "service manager started"
        );
        Ok(())
    }

    fn setup_default_signals(&self) -> Result<()> {
        let weak = Arc::downgrade(&self.shared);
        self.shared
            .signals
            .register_many(&[libc::SIGINT, libc::SIGTERM], move |signum| {
                tracing::info!(signum, "received shutdown signal");
                if let Some(shared) = weak.upgrade() {
                    shared.shutdown();
                }
            })?;

        self.shared.signals.register(libc::SIGHUP, |signum| {
            // Reload hook; configuration reload is not implemented.
            tracing::info!(signum, "received SIGHUP");
        })?;

        let weak = Arc::downgrade(&self.shared);
        self.shared.signals.register(libc::SIGUSR1, move |_| {
            if let Some(shared) = weak.upgrade() {
                shared.print_statistics();
            }
        })?;
        Ok(())
    }

    /// Drive the poll/accept/dispatch loop on the calling thread until
    /// [`stop`](Self::stop) or a shutdown signal flips the running flag.
    pub fn run(&self) {
        io_loop(&self.shared);
    }

    pub fn stop(&self) {
        self.shared.shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn statistics(&self) -> StatsSnapshot {
        self.shared
            .stats
            .snapshot(self.shared.max_connections, self.shared.max_requests)
    }

    pub fn print_statistics(&self) {
        self.shared.print_statistics();
    }

    pub fn socket_path(&self) -> &Path {
        &self.shared.socket_path
    }
}

impl Drop for ServiceManager {
    fn drop(&mut self) {
        self.shared.shutdown();
        self.shared.signals.stop();
    }
}

impl Shared {
    /// Stop accepting, drain every thread and resource, unlink the socket.
    /// Idempotent; callable from the I/O thread (signal callback) or any
    /// other non-worker thread.
    fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        self.queue.wake_all();

        let handles: Vec<JoinHandle<()>> = {
            let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
            threads.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }

        let listener = self.listener.swap(INVALID_FD, Ordering::AcqRel);
        if listener != INVALID_FD {
            syscalls::close_fd(listener);
        }

        self.close_all_connections();
        syscalls::unlink_socket(&self.socket_path);
        tracing::info!("service manager stopped");
    }

    fn close_all_connections(&self) {
        for index in 0..self.connections.capacity() {
            self.connections.with_slot(index, |conn| conn.close());
            self.connections.release(index);
        }

        // Workers are gone; anything still queued is released here.
        let drained: Vec<usize> = self.queue.lock().drain(..).collect();
        for index in drained {
            self.requests.release(index);
        }

        self.stats.reset_gauges();
    }

    fn print_statistics(&self) {
        let s = self.stats.snapshot(self.max_connections, self.max_requests);
        tracing::info!(
            active_connections = s.active_connections,
            max_connections = s.max_connections,
            pending_requests = s.pending_requests,
            max_requests = s.max_requests,
            total_requests_processed = s.total_requests_processed,
            connection_timeouts = s.connection_timeouts,
            request_timeouts = s.request_timeouts,
            "service statistics"
        );
    }
}

// ---- I/O thread ----

#[derive(Clone, Copy)]
enum PollToken {
    Listener,
    Signals,
    Client { index: usize, fd: RawFd },
}

fn io_loop(shared: &Shared) {
    let mut pollfds: Vec<libc::pollfd> = Vec::new();
    let mut tokens: Vec<PollToken> = Vec::new();

    while shared.running.load(Ordering::Acquire) {
        retry_parked_frames(shared);
        build_poll_set(shared, &mut pollfds, &mut tokens);

        let ready = match syscalls::poll(&mut pollfds, POLL_INTERVAL_MS) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "poll failed");
                continue;
            }
        };
        if ready == 0 {
            continue;
        }

        process_events(shared, &pollfds, &tokens);
    }
}

fn build_poll_set(shared: &Shared, pollfds: &mut Vec<libc::pollfd>, tokens: &mut Vec<PollToken>) {
    pollfds.clear();
    tokens.clear();

    let listener = shared.listener.load(Ordering::Acquire);
    if listener != INVALID_FD {
        pollfds.push(libc::pollfd {
            fd: listener,
            events: libc::POLLIN,
            revents: 0,
        });
        tokens.push(PollToken::Listener);
    }

    let signal_fd = shared.signals.descriptor();
    if signal_fd != INVALID_FD {
        pollfds.push(libc::pollfd {
            fd: signal_fd,
            events: libc::POLLIN,
            revents: 0,
        });
        tokens.push(PollToken::Signals);
    }

    for index in shared.connections.active_indices() {
        let fd = shared
            .connections
            .with_slot(index, |conn| conn.fd())
            .unwrap_or(INVALID_FD);
        if fd == INVALID_FD {
            continue;
        }
        pollfds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
        tokens.push(PollToken::Client { index, fd });
    }
}

fn process_events(shared: &Shared, pollfds: &[libc::pollfd], tokens: &[PollToken]) {
    for (pfd, token) in pollfds.iter().zip(tokens) {
        // A signal callback may have torn everything down mid-batch.
        if !shared.running.load(Ordering::Acquire) {
            return;
        }
        if pfd.revents == 0 {
            continue;
        }

        match *token {
            PollToken::Listener => {
                if pfd.revents & libc::POLLIN != 0 {
                    accept_ready(shared);
                }
                if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                    tracing::error!("listener socket error; stopping");
                    shared.shutdown();
                    return;
                }
            }
            PollToken::Signals => {
                if pfd.revents & libc::POLLIN != 0 {
                    shared.signals.process_pending();
                }
            }
            PollToken::Client { index, fd } => {
                if pfd.revents & libc::POLLIN != 0 {
                    handle_client_input(shared, index, fd);
                }
                if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                    close_client(shared, index, fd);
                }
            }
        }
    }
}

/// One accept per listener-readable event; level-triggered poll re-arms the
/// listener next cycle while the backlog is non-empty, so a connection burst
/// cannot starve client I/O within a single cycle.
fn accept_ready(shared: &Shared) {
    let listener = shared.listener.load(Ordering::Acquire);
    if listener == INVALID_FD {
        return;
    }

    // Backpressure: leave the accept queue alone while nearly full.
    let high_water = shared.max_connections as f64 * ACCEPT_HIGH_WATER;
    if shared.stats.active_connections() as f64 >= high_water {
        return;
    }

    match syscalls::accept_connection(listener) {
        Ok(Some(fd)) => {
            if shared.connections.acquire(|conn| conn.initialize(fd)).is_some() {
                shared.stats.connection_opened();
                tracing::debug!(fd, "accepted connection");
            } else {
                syscalls::close_fd(fd);
                tracing::warn!("connection pool exhausted; dropping accepted socket");
            }
        }
        Ok(None) => {}
        Err(e) => {
            tracing::error!(error = %e, "accept failed");
        }
    }
}

fn handle_client_input(shared: &Shared, index: usize, fd: RawFd) {
    // Re-validate: the slot may have been released and re-used since the
    // poll set was built.
    let Some(conn) = shared.connections.get(index) else {
        return;
    };
    if !conn.is_active() || conn.fd() != fd {
        return;
    }

    loop {
        // Sole I/O thread: buffer access here is exclusive.
        let read_result = {
            let buffer = unsafe { conn.buffer_mut() };
            buffer.grow_if_near_full();
            syscalls::read_nonblocking(fd, buffer.spare_mut())
        };

        match read_result {
            Ok(0) => {
                // Peer hung up.
                close_client(shared, index, fd);
                return;
            }
            Ok(n) => {
                unsafe { conn.buffer_mut() }.advance(n);
                conn.touch();
                if !drain_frames(shared, index, conn) {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => {
                tracing::error!(fd, error = %e, "read error");
                close_client(shared, index, fd);
                return;
            }
        }
    }
}

/// Extract every complete frame from the connection buffer, move each into a
/// request slot, and enqueue it. Returns false when the connection was
/// closed (framing violation).
fn drain_frames(shared: &Shared, index: usize, conn: &Connection) -> bool {
    conn.set_parked_frames(false);

    loop {
        let (payload, total_len) = {
            let buffer = unsafe { conn.buffer_mut() };
            match frame::parse_frame(buffer.filled()) {
                Ok(f) => (f.payload.to_vec(), f.total_len),
                Err(FrameError::Incomplete) => return true,
                Err(FrameError::Oversize(length)) => {
                    tracing::error!(fd = conn.fd(), length, "oversized frame; closing connection");
                    close_client(shared, index, conn.fd());
                    return false;
                }
            }
        };

        let client_fd = conn.fd();
        match shared
            .requests
            .acquire(|req| req.initialize(client_fd, payload))
        {
            Some(request_index) => {
                conn.add_pending();
                shared.stats.request_enqueued();
                shared.queue.push(request_index);
                unsafe { conn.buffer_mut() }.consume(total_len);
            }
            None => {
                // Request pool exhausted: the frame stays buffered and the
                // I/O loop retries it next cycle.
                conn.set_parked_frames(true);
                tracing::debug!(fd = client_fd, "request pool exhausted; frame parked");
                return true;
            }
        }
    }
}

/// Frames parked on pool exhaustion get another chance each poll cycle.
fn retry_parked_frames(shared: &Shared) {
    for index in shared.connections.active_indices() {
        let Some(conn) = shared.connections.get(index) else {
            continue;
        };
        if conn.is_active() && conn.has_parked_frames() {
            drain_frames(shared, index, conn);
        }
    }
}

fn close_client(shared: &Shared, index: usize, fd: RawFd) {
    let closed = shared
        .connections
        .with_slot(index, |conn| conn.close_if(fd))
        .unwrap_or(false);

    if closed {
        shared.connections.release(index);
        shared.stats.connection_closed();
        tracing::debug!(fd, "connection closed");
    }
}

// ---- Workers ----

fn worker_loop(shared: &Shared) {
    let mut processed: u64 = 0;

    while shared.running.load(Ordering::Acquire) {
        let Some(request_index) = shared.queue.pop_timeout(WORKER_WAIT, &shared.running) else {
            continue;
        };

        process_request(shared, request_index);

        processed += 1;
        if processed % SWEEP_EVERY == 0 {
            sweep_request_timeouts(shared);
        }
    }
}

fn process_request(shared: &Shared, request_index: usize) {
    let Some(request) = shared.requests.get(request_index) else {
        return;
    };

    // Popping the index transferred ownership of the record to this worker.
    let body = unsafe { request.body_mut() };
    shared.registry.dispatch(&body.request, &mut body.response);

    let client_fd = request.client_fd();
    if client_fd != INVALID_FD {
        send_response(shared, client_fd, &body.response);

        if let Some(conn_index) = shared.connections.find(|c| c.fd() == client_fd) {
            shared
                .connections
                .with_slot(conn_index, |conn| conn.sub_pending());
        }
    }

    shared.stats.request_completed();
    shared.requests.release(request_index);
}

/// Frame and write a response. Yields through EAGAIN; any other write error
/// closes the connection.
fn send_response(shared: &Shared, client_fd: RawFd, response: &[u8]) -> bool {
    let Some(index) = shared.connections.find(|c| c.fd() == client_fd) else {
        return false;
    };
    let Some(conn) = shared.connections.get(index) else {
        return false;
    };
    if !conn.is_active() || conn.fd() != client_fd {
        return false;
    }

    let packet = frame::encode_frame(response);

    let gate = conn.lock_writes();
    let mut written = 0;
    while written < packet.len() {
        match syscalls::write_nonblocking(client_fd, &packet[written..]) {
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // A peer that never drains must not pin a worker past
                // shutdown; the connection is torn down right after anyway.
                if !shared.running.load(Ordering::Acquire) {
                    drop(gate);
                    return false;
                }
                thread::yield_now();
            }
            Err(e) => {
                tracing::error!(fd = client_fd, error = %e, "write error");
                drop(gate);
                close_client(shared, index, client_fd);
                return false;
            }
        }
    }
    drop(gate);

    conn.touch();
    true
}

// ---- Reaper ----

fn reaper_loop(shared: &Shared) {
    while shared.running.load(Ordering::Acquire) {
        shared.queue.reaper_wait(REAPER_INTERVAL);
        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        sweep_connection_timeouts(shared);
        sweep_request_timeouts(shared);
    }
}

/// Close connections idle past the deadline, unless responses are still
/// outstanding for them.
fn sweep_connection_timeouts(shared: &Shared) {
    for index in shared.connections.active_indices() {
        let expired = shared
            .connections
            .with_slot(index, |conn| {
                if conn.is_active() && conn.is_timed_out() && conn.pending_requests() == 0 {
                    Some(conn.fd())
                } else {
                    None
                }
            })
            .flatten();

        let Some(fd) = expired else { continue };
        if fd == INVALID_FD {
            continue;
        }

        let closed = shared
            .connections
            .with_slot(index, |conn| conn.close_if(fd))
            .unwrap_or(false);
        if closed {
            shared.connections.release(index);
            shared.stats.connection_closed();
            shared.stats.connection_timed_out();
            tracing::info!(fd, "closed idle connection");
        }
    }
}

/// Drop queued requests older than the deadline. Runs under the queue mutex,
/// so entries cannot be popped out from underneath the scan.
fn sweep_request_timeouts(shared: &Shared) {
    let mut queue = shared.queue.lock();
    queue.retain(|&request_index| {
        match shared
            .requests
            .with_slot(request_index, |req| (req.is_timed_out(), req.client_fd()))
        {
            Some((true, client_fd)) => {
                if let Some(conn_index) = shared.connections.find(|c| c.fd() == client_fd) {
                    shared
                        .connections
                        .with_slot(conn_index, |conn| conn.sub_pending());
                }
                shared.requests.release(request_index);
                shared.stats.request_timed_out();
                tracing::warn!(fd = client_fd, "request timed out in queue");
                false
            }
            Some((false, _)) => true,
            // Slot no longer claimed; drop the stale index.
            None => false,
        }
    });
}
