//! Single-producer, single-consumer ring of variable-length byte messages.
//!
//! Each message is stored as a length-prefixed frame (see [`HEADER_SIZE`]).
//! Two monotonically increasing cursors describe the ring:
//!
//! ```text
//!            read                     write
//!             │                         │
//!   ──────────┼──────── published ──────┼──────── free ─────────
//!             [ len | payload ][ len | …]
//! ```
//!
//! Invariant: `0 <= write - read <= capacity`.
//!
//! # Memory ordering
//! - The writer stores `write` with `Release` after copying the frame in; the
//!   reader loads it with `Acquire` before copying out. This pair is what makes
//!   the frame bytes visible.
//! - The reader stores `read` with `Release` after copying out; the writer
//!   loads it with `Acquire` before reusing that space.
//! - Each side loads its own cursor `Relaxed`.
//!
//! # Thread safety
//! [`SpscWriter`] and [`SpscReader`] are `Send` and not `Clone`: ownership of
//! the halves is the single-producer/single-consumer guarantee.

use crate::error::PushError;
use crate::ring::{HEADER_SIZE, RingConfig, framed_len, seq_to_index};
use crate::wrap::ByteStorage;
use crossbeam_utils::CachePadded;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

struct Shared {
    /// Advanced by the writer only.
    write: CachePadded<AtomicU64>,
    /// Advanced by the reader only.
    read: CachePadded<AtomicU64>,
    storage: ByteStorage,
    mask: u64,
}

// SAFETY: the storage is only touched inside the ranges the cursor protocol
// hands to each side; the cursors themselves are atomics.
unsafe impl Sync for Shared {}

impl Shared {
    #[inline(always)]
    fn capacity(&self) -> usize {
        self.storage.capacity()
    }

    fn used(&self) -> usize {
        let read = self.read.load(Ordering::Acquire);
        let write = self.write.load(Ordering::Acquire);
        write.saturating_sub(read) as usize
    }
}

/// Creates a byte ring of `cfg.capacity` bytes and returns its two halves.
///
/// ```
/// use tessera_icc::{RingConfig, spsc};
///
/// let (mut tx, mut rx) = spsc::channel(RingConfig::new(64));
/// assert!(tx.push(b"hello"));
/// assert_eq!(rx.pop().as_deref(), Some(&b"hello"[..]));
/// assert_eq!(rx.pop(), None);
/// ```
pub fn channel(cfg: RingConfig) -> (SpscWriter, SpscReader) {
    let shared = Arc::new(Shared {
        write: CachePadded::new(AtomicU64::new(0)),
        read: CachePadded::new(AtomicU64::new(0)),
        storage: ByteStorage::new(cfg.capacity),
        mask: cfg.mask(),
    });
    (
        SpscWriter {
            shared: Arc::clone(&shared),
        },
        SpscReader { shared },
    )
}

/// Producer half of an SPSC byte ring.
pub struct SpscWriter {
    shared: Arc<Shared>,
}

/// Consumer half of an SPSC byte ring.
pub struct SpscReader {
    shared: Arc<Shared>,
}

impl SpscWriter {
    /// Appends one framed message.
    ///
    /// # Errors
    /// - [`PushError::TooLarge`] if `HEADER_SIZE + payload.len()` exceeds the
    ///   ring capacity.
    /// - [`PushError::Full`] if the frame does not fit in the space the reader
    ///   has released so far.
    ///
    /// The ring is left untouched on error.
    #[inline]
    pub fn try_push(&mut self, payload: &[u8]) -> Result<(), PushError> {
        let sh = &*self.shared;
        let capacity = sh.capacity();
        let frame = framed_len(payload.len());
        if frame > capacity {
            return Err(PushError::TooLarge { frame, capacity });
        }

        let write = sh.write.load(Ordering::Relaxed);
        let read = sh.read.load(Ordering::Acquire);
        let used = (write - read) as usize;
        if used + frame > capacity {
            return Err(PushError::Full {
                frame,
                free: capacity - used,
            });
        }

        let offset = seq_to_index(write, sh.mask);
        let header = (payload.len() as u64).to_le_bytes();
        // SAFETY: [write, write + frame) lies in free space, which the reader
        // does not touch until `write` is advanced past it.
        unsafe {
            sh.storage.copy_in(offset, &header);
            sh.storage.copy_in(offset + HEADER_SIZE, payload);
        }

        sh.write.store(write + frame as u64, Ordering::Release);
        Ok(())
    }

    /// Appends one framed message, returning `false` if it was rejected.
    #[inline]
    pub fn push(&mut self, payload: &[u8]) -> bool {
        self.try_push(payload).is_ok()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Bytes currently free for new frames (headers included).
    pub fn free_space(&self) -> usize {
        self.shared.capacity() - self.shared.used()
    }

    /// Current write cursor.
    pub fn position(&self) -> u64 {
        self.shared.write.load(Ordering::Relaxed)
    }
}

impl SpscReader {
    /// Removes the oldest message into `out`, replacing its contents.
    ///
    /// Returns `false` and leaves `out` untouched if nothing is available.
    #[inline]
    pub fn pop_into(&mut self, out: &mut Vec<u8>) -> bool {
        let sh = &*self.shared;
        let read = sh.read.load(Ordering::Relaxed);
        let write = sh.write.load(Ordering::Acquire);
        if read == write {
            return false;
        }

        let offset = seq_to_index(read, sh.mask);
        let mut header = [0u8; HEADER_SIZE];
        // SAFETY: [read, write) is published and the writer won't reuse it
        // until `read` moves.
        unsafe { sh.storage.copy_out(offset, &mut header) };
        let len = u64::from_le_bytes(header) as usize;
        let frame = framed_len(len);

        // Frame not entirely published yet.
        if frame > sh.capacity() || read + frame as u64 > write {
            return false;
        }

        out.clear();
        out.resize(len, 0);
        // SAFETY: as above, the whole frame lies in [read, write)
        unsafe { sh.storage.copy_out(offset + HEADER_SIZE, out) };

        sh.read.store(read + frame as u64, Ordering::Release);
        true
    }

    /// Removes and returns the oldest message, or `None` if the ring is empty.
    #[inline]
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        self.pop_into(&mut out).then_some(out)
    }

    /// Bytes currently published and unread (headers included).
    pub fn len(&self) -> usize {
        self.shared.used()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Current read cursor.
    pub fn position(&self) -> u64 {
        self.shared.read.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for SpscWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpscWriter")
            .field("capacity", &self.capacity())
            .field("free", &self.free_space())
            .finish()
    }
}

impl fmt::Debug for SpscReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpscReader")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}
