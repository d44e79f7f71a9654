// src/signal.rs
//
// Turns asynchronous signal delivery into a readable descriptor. Registered
// signals are blocked in the calling thread (and inherited by threads
// spawned afterwards), so the kernel queues them on a signalfd instead of
// interrupting; the I/O loop polls the descriptor and pumps
// `process_pending` to run the callbacks.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::Result;
use crate::syscalls;

pub type SignalCallback = Arc<dyn Fn(i32) + Send + Sync>;

pub struct SignalDispatcher {
    fd: AtomicI32,
    callbacks: Mutex<HashMap<i32, SignalCallback>>,
}

impl Default for SignalDispatcher {
    fn default() -> Self {
        Self {
            fd: AtomicI32::new(-1),
            callbacks: Mutex::new(HashMap::new()),
        }
    }
}

impl SignalDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `signum` to `callback`. Replaces any previous registration for
    /// the same signal.
    pub fn register(&self, signum: i32, callback: impl Fn(i32) + Send + Sync + 'static) -> Result<()> {
        self.insert(&[signum], Arc::new(callback))
    }

    /// Route every signal in `signums` to one shared callback.
    pub fn register_many(
        &self,
        signums: &[i32],
        callback: impl Fn(i32) + Send + Sync + 'static,
    ) -> Result<()> {
        self.insert(signums, Arc::new(callback))
    }

    fn insert(&self, signums: &[i32], callback: SignalCallback) -> Result<()> {
        {
            let mut callbacks = self.lock_callbacks();
            for &signum in signums {
                callbacks.insert(signum, Arc::clone(&callback));
            }
        }
        syscalls::block_signals(signums)?;
        self.rebuild_descriptor()
    }

    pub fn unregister(&self, signum: i32) -> Result<()> {
        self.lock_callbacks().remove(&signum);
        self.rebuild_descriptor()
    }

    /// Recreate the signalfd to cover the current registration set.
    fn rebuild_descriptor(&self) -> Result<()> {
        let signals: Vec<i32> = self.lock_callbacks().keys().copied().collect();

        let old = self.fd.swap(-1, Ordering::AcqRel);
        if old != -1 {
            syscalls::close_fd(old);
        }

        if !signals.is_empty() {
            let fd = syscalls::create_signalfd(&signals)?;
            self.fd.store(fd, Ordering::Release);
        }
        Ok(())
    }

    /// The descriptor to add to a poll set, or -1 when nothing is registered.
    pub fn descriptor(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    /// Drain the descriptor and run the callback for each delivered signal.
    /// A panicking callback is logged and the loop continues.
    pub fn process_pending(&self) {
        let fd = self.descriptor();
        if fd == -1 {
            return;
        }

        loop {
            match syscalls::read_signal(fd) {
                Ok(Some(signo)) => {
                    // Cloned out so a callback may touch the dispatcher.
                    let callback = self.lock_callbacks().get(&(signo as i32)).cloned();
                    if let Some(callback) = callback {
                        if panic::catch_unwind(AssertUnwindSafe(|| callback(signo as i32))).is_err() {
                            tracing::error!(signo, "signal callback panicked");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "signalfd read failed");
                    break;
                }
            }
        }
    }

    /// Close the descriptor, unblock everything, and drop all callbacks.
    pub fn stop(&self) {
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd != -1 {
            syscalls::close_fd(fd);
        }
        syscalls::unblock_all_signals();
        self.lock_callbacks().clear();
    }

    fn lock_callbacks(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<i32, SignalCallback>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SignalDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    // SIGUSR2 raised at this thread lands on the signalfd because
    // registration blocked it here first.
    #[test]
    fn test_signal_delivery_and_dispatch() {
        let dispatcher = SignalDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicI32::new(0));

        {
            let hits = Arc::clone(&hits);
            let seen = Arc::clone(&seen);
            dispatcher
                .register(libc::SIGUSR2, move |signum| {
                    hits.fetch_add(1, Ordering::Relaxed);
                    seen.store(signum, Ordering::Relaxed);
                })
                .unwrap();
        }
        assert!(dispatcher.descriptor() != -1);

        unsafe { libc::raise(libc::SIGUSR2) };
        dispatcher.process_pending();

        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(seen.load(Ordering::Relaxed), libc::SIGUSR2);

        // Drained: nothing further to dispatch.
        dispatcher.process_pending();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_panicking_callback_does_not_stop_the_loop() {
        let dispatcher = SignalDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        {
            let hits = Arc::clone(&hits);
            dispatcher
                .register(libc::SIGUSR2, move |_| {
                    hits.fetch_add(1, Ordering::Relaxed);
                    panic!("callback failure");
                })
                .unwrap();
        }

        unsafe { libc::raise(libc::SIGUSR2) };
        dispatcher.process_pending();
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        // Still operational after the panic.
        unsafe { libc::raise(libc::SIGUSR2) };
        dispatcher.process_pending();
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_stop_clears_registrations() {
        let dispatcher = SignalDispatcher::new();
        dispatcher.register(libc::SIGUSR2, |_| {}).unwrap();
        assert!(dispatcher.descriptor() != -1);

        dispatcher.stop();
        assert_eq!(dispatcher.descriptor(), -1);
    }
}
