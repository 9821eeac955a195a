//! Read-copy-update cell for infrequently updated shared state.
//!
//! Readers register in an active-reader counter, load the current snapshot
//! pointer and hold it through an [`RcuGuard`]. They never wait.
//!
//! A writer swaps in a new snapshot, then waits out a *grace period* (until the
//! active-reader counter drops to zero) before dropping the previous snapshot.
//! Any reader that registered before the swap may still hold the old pointer
//! and has finished once the counter hits zero; any reader that registers after
//! the swap can only load the new pointer.
//!
//! # Ownership
//! The cell exclusively owns the current snapshot (`Box<T>` held as a raw
//! pointer). On swap, the previous box becomes owned by the writer that
//! swapped it out, and is dropped only after the grace period.
//!
//! # Memory ordering
//! Registering (`fetch_add` on the counter, then load of the pointer) and
//! publishing (`swap` of the pointer, then load of the counter) form a
//! store-buffering pattern, so all four operations are `SeqCst`. With weaker
//! orderings a writer could read a zero count while a reader that has already
//! loaded the old pointer is still invisible to it. Unregistering is a
//! `Release` decrement so the reader's last access to the snapshot happens
//! before the writer's drop.
//!
//! # Writers
//! Writers are serialised internally with a mutex, so [`Rcu::update`] never
//! loses a concurrent update. Readers never touch the mutex.
//!
//! # Deadlock
//! `write`/`update` block until every registered reader has dropped its guard.
//! A thread that calls them while holding a guard from the same cell waits on
//! itself forever.

use crate::backoff::Backoff;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Grace periods longer than this are logged at `debug`.
const SLOW_GRACE_PERIOD: Duration = Duration::from_millis(1);

pub struct Rcu<T> {
    current: AtomicPtr<T>,
    readers: CachePadded<AtomicUsize>,
    writer: Mutex<()>,
    spin_limit: u32,
    _owns: PhantomData<Box<T>>,
}

// SAFETY: snapshots are shared with reader threads (`T: Sync`) and dropped on
// writer threads (`T: Send`).
unsafe impl<T: Send + Sync> Send for Rcu<T> {}
unsafe impl<T: Send + Sync> Sync for Rcu<T> {}

/// A reader's handle on one snapshot.
///
/// The snapshot stays alive, and unchanged, until the guard is dropped.
pub struct RcuGuard<'a, T> {
    snapshot: &'a T,
    readers: &'a AtomicUsize,
}

impl<T> Rcu<T> {
    pub fn new(value: T) -> Self {
        Self::with_spin_limit(value, Backoff::DEFAULT_SPIN_LIMIT)
    }

    /// `spin_limit` tunes how long writers spin before yielding while they
    /// wait for readers (see [`Backoff`]).
    pub fn with_spin_limit(value: T, spin_limit: u32) -> Self {
        Self {
            current: AtomicPtr::new(Box::into_raw(Box::new(value))),
            readers: CachePadded::new(AtomicUsize::new(0)),
            writer: Mutex::new(()),
            spin_limit,
            _owns: PhantomData,
        }
    }

    /// Registers as a reader and returns the current snapshot.
    ///
    /// Wait-free.
    #[inline]
    pub fn read(&self) -> RcuGuard<'_, T> {
        self.readers.fetch_add(1, Ordering::SeqCst);
        let ptr = self.current.load(Ordering::SeqCst);
        // SAFETY: we are registered, so no writer can reclaim `ptr` until the
        // guard decrements the counter.
        let snapshot = unsafe { &*ptr };
        RcuGuard {
            snapshot,
            readers: &self.readers,
        }
    }

    /// Publishes `value` as the new snapshot and reclaims the previous one
    /// once every reader registered before the swap has finished.
    ///
    /// Blocks for the grace period.
    pub fn write(&self, value: T) {
        let _writer = self.writer.lock();
        self.publish(Box::new(value));
    }

    /// Copies the current snapshot, applies `mutate` to the copy and publishes
    /// it as with [`write`](Self::write).
    pub fn update<F>(&self, mutate: F)
    where
        T: Clone,
        F: FnOnce(&mut T),
    {
        let _writer = self.writer.lock();
        // SAFETY: only writers reclaim snapshots and we hold the writer lock,
        // so the current one stays alive while we clone it.
        let mut next = Box::new(unsafe { (*self.current.load(Ordering::Acquire)).clone() });
        mutate(&mut next);
        self.publish(next);
    }

    /// Number of readers currently holding a guard.
    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::Relaxed)
    }

    /// Caller holds the writer lock.
    fn publish(&self, next: Box<T>) {
        let old = self.current.swap(Box::into_raw(next), Ordering::SeqCst);
        self.synchronize();
        // SAFETY: `old` came from `Box::into_raw` and, after the grace period,
        // no reader can still hold it.
        drop(unsafe { Box::from_raw(old) });
    }

    /// Waits until the active-reader count reaches zero.
    fn synchronize(&self) {
        let start = Instant::now();
        let mut backoff = Backoff::with_spin_limit(self.spin_limit);
        let snoozes = backoff.wait_until(|| self.readers.load(Ordering::SeqCst) == 0);
        let waited = start.elapsed();
        if waited > SLOW_GRACE_PERIOD {
            tracing::debug!(?waited, snoozes, "slow rcu grace period");
        }
    }
}

impl<T> Drop for Rcu<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no guards are alive
        drop(unsafe { Box::from_raw(*self.current.get_mut()) });
    }
}

impl<T: fmt::Debug> fmt::Debug for Rcu<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rcu")
            .field("snapshot", &*self.read())
            .field("readers", &self.readers())
            .finish()
    }
}

impl<T> Deref for RcuGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.snapshot
    }
}

impl<T> Drop for RcuGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.readers.fetch_sub(1, Ordering::Release);
    }
}

impl<T: fmt::Debug> fmt::Debug for RcuGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.snapshot, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn read_sees_initial_value() {
        let rcu = Rcu::new(vec![1, 2, 3]);
        assert_eq!(*rcu.read(), vec![1, 2, 3]);
        assert_eq!(rcu.readers(), 0);
    }

    #[test]
    fn write_replaces_snapshot() {
        let rcu = Rcu::new(String::from("old"));
        rcu.write(String::from("new"));
        assert_eq!(rcu.read().as_str(), "new");
    }

    #[test]
    fn update_copies_and_mutates() {
        let rcu = Rcu::new(vec![1u32]);
        rcu.update(|v| v.push(2));
        rcu.update(|v| v.push(3));
        assert_eq!(*rcu.read(), vec![1, 2, 3]);
    }

    #[test]
    fn guard_counts_as_reader() {
        let rcu = Rcu::new(5u64);
        let a = rcu.read();
        let b = rcu.read();
        assert_eq!(rcu.readers(), 2);
        drop(a);
        assert_eq!(*b, 5);
        drop(b);
        assert_eq!(rcu.readers(), 0);
    }

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn every_snapshot_is_dropped_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let rcu = Rcu::new(Tracked(Arc::clone(&drops)));
            rcu.write(Tracked(Arc::clone(&drops)));
            assert_eq!(drops.load(Ordering::SeqCst), 1);
            rcu.write(Tracked(Arc::clone(&drops)));
            assert_eq!(drops.load(Ordering::SeqCst), 2);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn writer_waits_for_guard_holder() {
        let rcu = Arc::new(Rcu::new([7u8; 64]));
        let held = Arc::new(Barrier::new(2));
        let released = Arc::new(AtomicBool::new(false));

        let reader = {
            let rcu = Arc::clone(&rcu);
            let held = Arc::clone(&held);
            let released = Arc::clone(&released);
            thread::spawn(move || {
                let guard = rcu.read();
                held.wait();
                thread::sleep(Duration::from_millis(50));
                // The writer has swapped by now but must not have reclaimed.
                assert_eq!(*guard, [7u8; 64]);
                released.store(true, Ordering::SeqCst);
                drop(guard);
            })
        };

        held.wait();
        rcu.write([9u8; 64]);
        assert!(released.load(Ordering::SeqCst), "write returned before reader left");
        assert_eq!(*rcu.read(), [9u8; 64]);
        reader.join().unwrap();
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let rcu = Arc::new(Rcu::new(0u64));
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let rcu = Arc::clone(&rcu);
                thread::spawn(move || {
                    for _ in 0..250 {
                        rcu.update(|n| *n += 1);
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(*rcu.read(), 1_000);
    }
}
