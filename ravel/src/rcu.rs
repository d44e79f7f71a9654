// src/rcu.rs
//
// Two-epoch read-copy-update. Readers register on one of two counters,
// selected by the low bit of the global epoch; a writer publishes a new
// epoch and then waits for the old parity's counter to drain, at which point
// no reader can still reference the previous snapshot.

use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU64, Ordering};
use std::thread;

pub type Epoch = u64;

// Keeps the epoch and each reader counter on their own cache lines.
#[repr(align(64))]
struct CacheAligned<T>(T);

pub struct Rcu {
    global_epoch: CacheAligned<AtomicU64>,
    reader_counters: [CacheAligned<AtomicI32>; 2],
}

impl Rcu {
    pub const fn new() -> Self {
        Self {
            global_epoch: CacheAligned(AtomicU64::new(0)),
            reader_counters: [
                CacheAligned(AtomicI32::new(0)),
                CacheAligned(AtomicI32::new(0)),
            ],
        }
    }

    /// Enter a read-side critical section and return the epoch it is
    /// registered under. Pair every call with exactly one
    /// [`read_unlock`](Self::read_unlock) on the same epoch.
    ///
    /// The retry loop guarantees the registration lands on the counter that
    /// belongs to the epoch returned: if the global epoch moved between the
    /// load and the increment, the increment is undone and the sequence runs
    /// again.
    pub fn read_lock(&self) -> Epoch {
        loop {
            let epoch = self.global_epoch.0.load(Ordering::Acquire);
            let counter = &self.reader_counters[(epoch & 1) as usize].0;

            counter.fetch_add(1, Ordering::Acquire);

            if self.global_epoch.0.load(Ordering::Acquire) == epoch {
                return epoch;
            }

            counter.fetch_sub(1, Ordering::Release);
        }
    }

    /// Leave the read-side critical section entered at `epoch`.
    pub fn read_unlock(&self, epoch: Epoch) {
        self.reader_counters[(epoch & 1) as usize]
            .0
            .fetch_sub(1, Ordering::Release);
    }

    /// Publish a new epoch and wait until every reader that entered before
    /// the bump has drained. When this returns, the snapshot that was
    /// current before the call can be reclaimed.
    ///
    /// Not serialized against other writers; callers replacing a shared
    /// snapshot from several threads must order the replacements themselves.
    pub fn synchronize(&self) {
        let old_epoch = self.global_epoch.0.load(Ordering::Acquire);
        self.global_epoch.0.store(old_epoch + 1, Ordering::Release);

        let counter = &self.reader_counters[(old_epoch & 1) as usize].0;
        while counter.load(Ordering::Acquire) != 0 {
            thread::yield_now();
        }
    }

    pub fn epoch(&self) -> u64 {
        self.global_epoch.0.load(Ordering::Relaxed)
    }
}

impl Default for Rcu {
    fn default() -> Self {
        Self::new()
    }
}

/// An owned value published through RCU.
///
/// `read` hands out a guard that pins the current snapshot for its lifetime;
/// `replace` swaps in a new snapshot and reclaims the old one once all
/// readers holding it have left.
pub struct RcuCell<T> {
    rcu: Rcu,
    current: AtomicPtr<T>,
    // Ties Send/Sync of the cell to ownership of the boxed snapshot.
    _marker: PhantomData<Box<T>>,
}

impl<T> RcuCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            rcu: Rcu::new(),
            current: AtomicPtr::new(Box::into_raw(Box::new(value))),
            _marker: PhantomData,
        }
    }

    /// Pin and borrow the current snapshot.
    pub fn read(&self) -> RcuGuard<'_, T> {
        let epoch = self.rcu.read_lock();
        let ptr = self.current.load(Ordering::Acquire);
        RcuGuard {
            rcu: &self.rcu,
            ptr,
            epoch,
        }
    }

    /// Publish `value` as the new snapshot. Blocks until the previous
    /// snapshot has no remaining readers, then drops it.
    pub fn replace(&self, value: T) {
        let fresh = Box::into_raw(Box::new(value));
        let old = self.current.swap(fresh, Ordering::AcqRel);

        self.rcu.synchronize();

        // No reader registered before the epoch bump can still hold `old`.
        drop(unsafe { Box::from_raw(old) });
    }

    pub fn epoch(&self) -> u64 {
        self.rcu.epoch()
    }
}

impl<T> Drop for RcuCell<T> {
    fn drop(&mut self) {
        let ptr = self.current.load(Ordering::Relaxed);
        drop(unsafe { Box::from_raw(ptr) });
    }
}

/// Read-side guard: dereferences to the pinned snapshot and releases its
/// epoch registration on drop. Moving the guard transfers the registration.
pub struct RcuGuard<'a, T> {
    rcu: &'a Rcu,
    ptr: *const T,
    epoch: Epoch,
}

impl<T> Deref for RcuGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Valid until read_unlock runs in Drop: the writer cannot reclaim
        // this snapshot while our epoch registration is outstanding.
        unsafe { &*self.ptr }
    }
}

impl<T> Drop for RcuGuard<'_, T> {
    fn drop(&mut self) {
        self.rcu.read_unlock(self.epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_epoch_advances_per_synchronize() {
        let rcu = Rcu::new();
        assert_eq!(rcu.epoch(), 0);
        rcu.synchronize();
        rcu.synchronize();
        assert_eq!(rcu.epoch(), 2);
    }

    #[test]
    fn test_lock_unlock_leaves_no_registration() {
        let rcu = Rcu::new();
        let epoch = rcu.read_lock();
        rcu.read_unlock(epoch);
        // A leftover registration would hang this call.
        rcu.synchronize();
    }

    // synchronize must not return while a reader that entered before the
    // epoch bump is still inside its critical section.
    #[test]
    fn test_synchronize_waits_for_pre_bump_reader() {
        let rcu = Arc::new(Rcu::new());
        let writer_done = Arc::new(AtomicBool::new(false));

        let epoch = rcu.read_lock();

        let writer = {
            let rcu = Arc::clone(&rcu);
            let writer_done = Arc::clone(&writer_done);
            thread::spawn(move || {
                rcu.synchronize();
                writer_done.store(true, Ordering::Release);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(
            !writer_done.load(Ordering::Acquire),
            "synchronize returned while a reader held the old epoch"
        );

        rcu.read_unlock(epoch);
        writer.join().unwrap();
        assert!(writer_done.load(Ordering::Acquire));
    }

    // Readers entering after the bump register on the new parity and must
    // not block the writer draining the old one.
    #[test]
    fn test_new_epoch_reader_does_not_block_synchronize() {
        let rcu = Arc::new(Rcu::new());
        let first = rcu.read_lock();

        let writer = {
            let rcu = Arc::clone(&rcu);
            thread::spawn(move || rcu.synchronize())
        };

        // Wait until the writer has published the new epoch.
        while rcu.epoch() == first {
            thread::yield_now();
        }

        let second = rcu.read_lock();
        assert_eq!(second, first + 1);

        // Releasing the old-parity reader is enough; the new-parity one may
        // stay inside its critical section.
        rcu.read_unlock(first);
        writer.join().unwrap();
        rcu.read_unlock(second);
    }

    #[derive(Clone, PartialEq, Debug)]
    struct Snapshot {
        value: usize,
        label: String,
        computed: f64,
    }

    impl Snapshot {
        fn consistent(&self) -> bool {
            self.label == self.value.to_string() && self.computed == self.value as f64
        }
    }

    // Readers must observe internally consistent snapshots while a writer
    // replaces the published value.
    #[test]
    fn test_readers_see_consistent_snapshots() {
        let cell = Arc::new(RcuCell::new(Snapshot {
            value: 0,
            label: "0".to_string(),
            computed: 0.0,
        }));
        let stop = Arc::new(AtomicBool::new(false));
        let inconsistencies = Arc::new(AtomicUsize::new(0));

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let cell = Arc::clone(&cell);
                let stop = Arc::clone(&stop);
                let inconsistencies = Arc::clone(&inconsistencies);
                thread::spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        let guard = cell.read();
                        for _ in 0..100 {
                            if !guard.consistent() {
                                inconsistencies.fetch_add(1, Ordering::Relaxed);
                                break;
                            }
                        }
                    }
                })
            })
            .collect();

        for value in 1..=200usize {
            cell.replace(Snapshot {
                value,
                label: value.to_string(),
                computed: value as f64,
            });
        }
        stop.store(true, Ordering::Release);

        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(inconsistencies.load(Ordering::Acquire), 0);
    }

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_replace_reclaims_previous_snapshots() {
        let drops = Arc::new(AtomicUsize::new(0));
        let cell = RcuCell::new(DropCounter(Arc::clone(&drops)));

        cell.replace(DropCounter(Arc::clone(&drops)));
        cell.replace(DropCounter(Arc::clone(&drops)));
        assert_eq!(drops.load(Ordering::Acquire), 2);

        drop(cell);
        assert_eq!(drops.load(Ordering::Acquire), 3);
    }

    #[test]
    fn test_guard_move_releases_once() {
        let cell = RcuCell::new(5usize);
        let guard = cell.read();
        let moved = guard;
        assert_eq!(*moved, 5);
        drop(moved);
        // A double-release would leave a counter negative and wedge this.
        cell.replace(6);
        assert_eq!(*cell.read(), 6);
    }
}
