// src/pool.rs
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Fixed-capacity lock-free object pool.
///
/// Storage is a contiguous slab of `T` plus a parallel array of atomic
/// occupancy flags. `acquire` claims a slot with a single CAS; `release`
/// hands it back with a release store. The pool never produces `&mut T`:
/// slot types use interior mutability (atomics, mutexes, guarded cells), and
/// a claimed slot belongs exclusively to its acquirer until released.
///
/// `find` and `active_indices` race with releases by design. A returned
/// index may already belong to a new owner, so callers re-validate against
/// the slot's own state (fd, active flag) before acting on it.
pub struct SlotPool<T> {
    slots: Box<[T]>,
    available: Box<[AtomicBool]>,
    // Rotating start point that spreads acquirers across the slab.
    next_index: AtomicUsize,
}

impl<T: Default> SlotPool<T> {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, T::default);
        let available: Vec<AtomicBool> = (0..capacity).map(|_| AtomicBool::new(true)).collect();

        Self {
            slots: slots.into_boxed_slice(),
            available: available.into_boxed_slice(),
            next_index: AtomicUsize::new(0),
        }
    }
}

impl<T> SlotPool<T> {
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim a free slot and run `init` on it while ownership is exclusive.
    /// Scans at most `capacity` candidates; returns `None` when every slot is
    /// taken.
    pub fn acquire(&self, init: impl FnOnce(&T)) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }

        for _ in 0..self.capacity() {
            let index = self.next_index.fetch_add(1, Ordering::Relaxed) % self.capacity();

            if self.available[index]
                .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                init(&self.slots[index]);
                return Some(index);
            }
        }
        None
    }

    /// Return a slot to the pool. The owner must have cleaned the slot up
    /// before this call; afterwards every outstanding reference to it is dead.
    pub fn release(&self, index: usize) {
        if index < self.capacity() {
            self.available[index].store(true, Ordering::Release);
        }
    }

    /// Borrow a slot that is currently claimed.
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.capacity() || self.available[index].load(Ordering::Acquire) {
            return None;
        }
        Some(&self.slots[index])
    }

    /// Run `f` against the slot iff it is currently claimed.
    pub fn with_slot<R>(&self, index: usize, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.get(index).map(f)
    }

    /// Linear scan over claimed slots; first match wins.
    pub fn find(&self, pred: impl Fn(&T) -> bool) -> Option<usize> {
        (0..self.capacity())
            .find(|&i| !self.available[i].load(Ordering::Acquire) && pred(&self.slots[i]))
    }

    /// Best-effort snapshot of the currently claimed indices.
    pub fn active_indices(&self) -> Vec<usize> {
        (0..self.capacity())
            .filter(|&i| !self.available[i].load(Ordering::Acquire))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[derive(Default)]
    struct TestSlot {
        claimed: AtomicBool,
        value: AtomicUsize,
    }

    #[test]
    fn test_acquire_release_cycle() {
        let pool: SlotPool<TestSlot> = SlotPool::new(4);
        assert_eq!(pool.capacity(), 4);

        let first = pool.acquire(|s| s.value.store(7, Ordering::Relaxed)).unwrap();
        assert_eq!(pool.get(first).unwrap().value.load(Ordering::Relaxed), 7);

        pool.release(first);
        assert!(pool.get(first).is_none());
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let pool: SlotPool<TestSlot> = SlotPool::new(2);
        let a = pool.acquire(|_| {}).unwrap();
        let b = pool.acquire(|_| {}).unwrap();
        assert_ne!(a, b);
        assert!(pool.acquire(|_| {}).is_none());

        pool.release(a);
        assert!(pool.acquire(|_| {}).is_some());
    }

    #[test]
    fn test_zero_capacity() {
        let pool: SlotPool<TestSlot> = SlotPool::new(0);
        assert!(pool.acquire(|_| {}).is_none());
        assert!(pool.find(|_| true).is_none());
    }

    #[test]
    fn test_find_only_sees_claimed_slots() {
        let pool: SlotPool<TestSlot> = SlotPool::new(4);
        let held = pool.acquire(|s| s.value.store(42, Ordering::Relaxed)).unwrap();
        pool.release(pool.acquire(|s| s.value.store(42, Ordering::Relaxed)).unwrap());

        let found = pool.find(|s| s.value.load(Ordering::Relaxed) == 42);
        assert_eq!(found, Some(held));
    }

    #[test]
    fn test_active_indices_snapshot() {
        let pool: SlotPool<TestSlot> = SlotPool::new(8);
        let a = pool.acquire(|_| {}).unwrap();
        let b = pool.acquire(|_| {}).unwrap();
        let mut active = pool.active_indices();
        active.sort_unstable();
        let mut expected = vec![a, b];
        expected.sort_unstable();
        assert_eq!(active, expected);
    }

    // With K concurrent acquirers on a pool of capacity N, the number of
    // simultaneously held slots never exceeds N and no slot is handed to two
    // owners at once.
    #[test]
    fn test_concurrent_ownership_is_exclusive() {
        const CAPACITY: usize = 8;
        const THREADS: usize = 4;
        const ROUNDS: usize = 2_000;

        let pool: Arc<SlotPool<TestSlot>> = Arc::new(SlotPool::new(CAPACITY));
        let held = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let held = Arc::clone(&held);
                thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        let Some(index) = pool.acquire(|slot| {
                            // A second owner would observe `claimed` still set.
                            assert!(!slot.claimed.swap(true, Ordering::AcqRel));
                        }) else {
                            thread::yield_now();
                            continue;
                        };

                        let now_held = held.fetch_add(1, Ordering::AcqRel) + 1;
                        assert!(now_held <= CAPACITY);

                        held.fetch_sub(1, Ordering::AcqRel);
                        let slot = pool.get(index).unwrap();
                        assert!(slot.claimed.swap(false, Ordering::AcqRel));
                        pool.release(index);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(held.load(Ordering::Acquire), 0);
        assert!(pool.active_indices().is_empty());
    }
}
