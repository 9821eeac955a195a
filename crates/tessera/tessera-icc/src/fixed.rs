//! Single-producer, single-consumer ring of fixed-size elements.
//!
//! The unframed sibling of [`spsc`](crate::spsc): every slot holds exactly one
//! `T`, capacity is counted in elements, and there is no length prefix. Batch
//! operations are all-or-nothing.
//!
//! Same cursor protocol as the byte ring: `write` is stored `Release` by the
//! writer after filling slots, `read` is stored `Release` by the reader after
//! copying them out, and each side `Acquire`-loads the other's cursor.

use crate::ring::{RingConfig, seq_to_index};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

struct Shared<T> {
    write: CachePadded<AtomicU64>,
    read: CachePadded<AtomicU64>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: u64,
}

// SAFETY: a slot is written only while it is outside [read, write) and read
// only while inside it.
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    #[inline(always)]
    fn capacity(&self) -> u64 {
        self.slots.len() as u64
    }

    #[inline(always)]
    fn slot(&self, seq: u64) -> *mut MaybeUninit<T> {
        self.slots[seq_to_index(seq, self.mask)].get()
    }

    fn len(&self) -> usize {
        let read = self.read.load(Ordering::Acquire);
        let write = self.write.load(Ordering::Acquire);
        write.saturating_sub(read) as usize
    }
}

/// Creates a ring of `cfg.capacity` elements and returns its two halves.
///
/// ```
/// use tessera_icc::{RingConfig, fixed};
///
/// let (mut tx, mut rx) = fixed::channel::<u32>(RingConfig::new(4));
/// assert!(tx.push_many(&[1, 2, 3]));
/// assert_eq!(rx.pop_one(), Some(1));
/// assert_eq!(rx.pop_many(2), Some(vec![2, 3]));
/// ```
pub fn channel<T: Copy>(cfg: RingConfig) -> (FixedWriter<T>, FixedReader<T>) {
    let shared = Arc::new(Shared {
        write: CachePadded::new(AtomicU64::new(0)),
        read: CachePadded::new(AtomicU64::new(0)),
        slots: (0..cfg.capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect(),
        mask: cfg.mask(),
    });
    (
        FixedWriter {
            shared: Arc::clone(&shared),
        },
        FixedReader { shared },
    )
}

pub struct FixedWriter<T> {
    shared: Arc<Shared<T>>,
}

pub struct FixedReader<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Copy> FixedWriter<T> {
    /// Returns `false` if the ring is full.
    #[inline]
    pub fn push_one(&mut self, value: T) -> bool {
        let sh = &*self.shared;
        let write = sh.write.load(Ordering::Relaxed);
        let read = sh.read.load(Ordering::Acquire);
        if write - read >= sh.capacity() {
            return false;
        }
        // SAFETY: slot `write` is outside [read, write)
        unsafe { (*sh.slot(write)).write(value) };
        sh.write.store(write + 1, Ordering::Release);
        true
    }

    /// Pushes every element of `values`, or none of them.
    pub fn push_many(&mut self, values: &[T]) -> bool {
        let sh = &*self.shared;
        let write = sh.write.load(Ordering::Relaxed);
        let read = sh.read.load(Ordering::Acquire);
        let n = values.len() as u64;
        if write - read + n > sh.capacity() {
            return false;
        }
        for (i, value) in values.iter().enumerate() {
            // SAFETY: all n slots after `write` are free, checked above
            unsafe { (*sh.slot(write + i as u64)).write(*value) };
        }
        sh.write.store(write + n, Ordering::Release);
        true
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_full(&self) -> bool {
        self.len() as u64 >= self.shared.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }
}

impl<T: Copy> FixedReader<T> {
    #[inline]
    pub fn pop_one(&mut self) -> Option<T> {
        let sh = &*self.shared;
        let read = sh.read.load(Ordering::Relaxed);
        let write = sh.write.load(Ordering::Acquire);
        if read == write {
            return None;
        }
        // SAFETY: slot `read` is published
        let value = unsafe { (*sh.slot(read)).assume_init_read() };
        sh.read.store(read + 1, Ordering::Release);
        Some(value)
    }

    /// Pops exactly `n` elements, or returns `None` and pops nothing if fewer
    /// than `n` are available.
    pub fn pop_many(&mut self, n: usize) -> Option<Vec<T>> {
        let sh = &*self.shared;
        let read = sh.read.load(Ordering::Relaxed);
        let write = sh.write.load(Ordering::Acquire);
        if read + (n as u64) > write {
            return None;
        }
        let out = (0..n as u64)
            // SAFETY: [read, read + n) is published
            .map(|i| unsafe { (*sh.slot(read + i)).assume_init_read() })
            .collect();
        sh.read.store(read + n as u64, Ordering::Release);
        Some(out)
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }
}

impl<T> fmt::Debug for FixedWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedWriter")
            .field("capacity", &self.shared.capacity())
            .field("len", &self.shared.len())
            .finish()
    }
}

impl<T> fmt::Debug for FixedReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedReader")
            .field("capacity", &self.shared.capacity())
            .field("len", &self.shared.len())
            .finish()
    }
}
