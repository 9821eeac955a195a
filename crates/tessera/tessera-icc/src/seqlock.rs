//! Seqlock (sequence lock) for a small `Copy` value with one writer and many
//! readers.
//!
//! # Protocol
//!
//! **Writer:**
//! 1. CAS seq from even `s` to odd `s + 1` (signals "write in progress")
//! 2. Write data
//! 3. Store `s + 2` (even) with `Release` (signals "write complete")
//!
//! **Reader:**
//! 1. Load seq; if odd, a write is in progress, retry
//! 2. Copy data
//! 3. `fence(Acquire)`, load seq again; if it changed, the copy may be torn,
//!    retry
//! 4. Return the copy
//!
//! The CAS in step 1 keeps a second writer from entering while one is active,
//! but writer contention is only handled by spinning; the lock is meant for a
//! single writer.
//!
//! # Trade-offs
//!
//! - **Pros**: readers never block the writer, and never take a lock
//! - **Cons**: readers may spin during writes, requires `Copy` data

use crate::backoff::Backoff;
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering, fence};

/// A value protected by a sequence lock.
///
/// # Sequence Number Semantics
///
/// - **Even**: data is stable, safe to read
/// - **Odd**: write in progress, readers must retry
pub struct SeqLock<T: Copy> {
    /// Sequence counter: odd = write in progress, even = stable.
    seq: CachePadded<AtomicU64>,
    data: UnsafeCell<T>,
}

// SAFETY: readers only keep copies that were validated against `seq`; writers
// exclude each other with the CAS on `seq`.
unsafe impl<T: Copy + Send> Send for SeqLock<T> {}
unsafe impl<T: Copy + Send> Sync for SeqLock<T> {}

impl<T: Copy> SeqLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            seq: CachePadded::new(AtomicU64::new(0)),
            data: UnsafeCell::new(value),
        }
    }

    /// Single read attempt. `None` if a write was in progress or completed
    /// while the value was being copied.
    #[inline]
    pub fn try_read(&self) -> Option<T> {
        let s1 = self.seq.load(Ordering::Acquire);
        if s1 & 1 == 1 {
            return None;
        }

        // SAFETY: the copy may be torn; it is discarded unless seq is
        // unchanged below. Volatile so the compiler cannot fold the read into
        // the surrounding seq loads.
        let value = unsafe { ptr::read_volatile(self.data.get()) };

        fence(Ordering::Acquire);
        let s2 = self.seq.load(Ordering::Relaxed);
        (s1 == s2).then_some(value)
    }

    /// Reads a consistent copy of the value, spinning while a write is in
    /// progress.
    #[inline]
    pub fn read(&self) -> T {
        loop {
            if let Some(value) = self.try_read() {
                return value;
            }
            std::hint::spin_loop();
        }
    }

    /// Replaces the value.
    #[inline]
    pub fn write(&self, value: T) {
        let _write = self.begin_write();
        // SAFETY: the odd sequence number gives us exclusive write access
        unsafe { ptr::write_volatile(self.data.get(), value) };
    }

    /// Mutates the value in place.
    ///
    /// Readers retry for as long as `mutate` runs, so keep it short. If it
    /// panics the write is still completed with whatever it left behind.
    pub fn update<F: FnOnce(&mut T)>(&self, mutate: F) {
        let _write = self.begin_write();
        // SAFETY: as in `write`
        mutate(unsafe { &mut *self.data.get() });
    }

    /// Current sequence number. Odd while a write is in progress; advances by
    /// two per completed write.
    pub fn version(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    fn begin_write(&self) -> WriteSection<'_> {
        let mut backoff = Backoff::new();
        let mut s = self.seq.load(Ordering::Relaxed);
        loop {
            if s & 1 == 0 {
                match self.seq.compare_exchange_weak(
                    s,
                    s.wrapping_add(1),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(current) => s = current,
                }
            } else {
                backoff.snooze();
                s = self.seq.load(Ordering::Relaxed);
            }
        }
        // Odd seq must be visible before any data store.
        fence(Ordering::Release);
        WriteSection {
            seq: &self.seq,
            start: s,
        }
    }
}

/// Marks the end of a write when dropped, including on unwind.
struct WriteSection<'a> {
    seq: &'a AtomicU64,
    start: u64,
}

impl Drop for WriteSection<'_> {
    #[inline]
    fn drop(&mut self) {
        self.seq.store(self.start.wrapping_add(2), Ordering::Release);
    }
}

impl<T: Copy + Default> Default for SeqLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for SeqLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_read() {
            Some(value) => f.debug_struct("SeqLock").field("value", &value).finish(),
            None => f
                .debug_struct("SeqLock")
                .field("value", &"<write in progress>")
                .finish(),
        }
    }
}
