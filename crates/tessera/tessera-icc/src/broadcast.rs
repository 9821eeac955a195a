//! Single-producer, multi-consumer (SPMC) broadcast ring of byte messages.
//!
//! One writer publishes length-prefixed frames; any number of readers observe
//! them, each at its own pace through a private cursor.
//!
//! # Design
//! - **Writer**: never waits for readers. When the ring is full it simply
//!   overwrites the oldest frames.
//! - **Readers**: each keeps its own `read` cursor. A reader that falls more
//!   than `capacity` bytes behind has lost data; it is told so with
//!   [`TryRead::Overrun`] and resynchronised to the oldest frame still intact.
//!
//! # Shared cursors
//!
//! ```text
//!   oldest              read            write     claim
//!     │                   │               │         │
//!  ───[ frame ][ frame ]──[ frame ][ ... ]┼[ in    ]┼───
//!                                          flight
//! ```
//!
//! - `write`: end of the last complete frame (`Release` after the bytes).
//! - `claim`: end of the frame being written, stored before its bytes. Bytes
//!   older than `claim - capacity` may be garbage.
//! - `oldest`: first frame boundary at or after `claim - capacity`. The writer
//!   finds it by walking the length headers it is about to overwrite.
//!
//! # Torn reads
//! A reader may copy bytes the writer is overwriting at the same moment. It
//! therefore validates *after* copying: `fence(Acquire)` then re-load
//! `claim`; if `claim - read > capacity` the copy is discarded and reported as
//! an overrun. This is the seqlock validate-after-copy pattern applied to a
//! byte range.
//!
//! # Thread safety
//! - `BroadcastWriter` is `Send`; `push` takes `&mut self` (single-producer).
//! - `BroadcastReader` is `Send` and `Clone`; a clone starts with a copy of
//!   the cursor and then advances independently.

use crate::error::PushError;
use crate::ring::{HEADER_SIZE, RingConfig, apply_overrun_policy, framed_len, seq_to_index};
use crate::wrap::ByteStorage;
use crossbeam_utils::CachePadded;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering, fence};

struct Shared {
    write: CachePadded<AtomicU64>,
    claim: CachePadded<AtomicU64>,
    oldest: CachePadded<AtomicU64>,
    storage: ByteStorage,
    mask: u64,
    capacity: u64,
}

// SAFETY: only the writer mutates storage; readers validate every copy
// against `claim` before using it.
unsafe impl Sync for Shared {}

impl Shared {
    /// Checks that nothing a reader at `read` copied since its last `Acquire`
    /// load of `write` can have been overwritten.
    #[inline(always)]
    fn validate(&self, read: &mut u64, overruns: &mut u64) -> Option<ReadStatus> {
        fence(Ordering::Acquire);
        let claim = self.claim.load(Ordering::Acquire);
        if claim.saturating_sub(*read) > self.capacity {
            Some(self.resync(claim, read, overruns))
        } else {
            None
        }
    }

    #[cold]
    fn resync(&self, horizon: u64, read: &mut u64, overruns: &mut u64) -> ReadStatus {
        let oldest = self.oldest.load(Ordering::Acquire);
        let from = *read;
        let skipped =
            apply_overrun_policy(horizon, read, self.capacity, oldest, overruns).unwrap_or(0);
        tracing::warn!(
            from,
            to = *read,
            skipped,
            total = *overruns,
            "broadcast reader overrun"
        );
        ReadStatus::Overrun { skipped }
    }
}

/// Outcome of [`BroadcastReader::try_read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryRead {
    /// The next message, in publish order.
    Message(Vec<u8>),
    /// The reader is caught up.
    Empty,
    /// The writer lapped this reader; `skipped` bytes of frames were lost and
    /// the reader now sits on the oldest intact frame.
    Overrun { skipped: u64 },
}

impl TryRead {
    pub fn into_message(self) -> Option<Vec<u8>> {
        match self {
            TryRead::Message(m) => Some(m),
            _ => None,
        }
    }
}

/// Outcome of [`BroadcastReader::try_read_into`]; the payload, if any, is in
/// the caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Ok,
    Empty,
    Overrun { skipped: u64 },
}

/// The writer side of a broadcast ring.
pub struct BroadcastWriter {
    shared: Arc<Shared>,
    /// Local copy of the committed write cursor.
    write: u64,
    /// Local copy of the oldest intact frame boundary.
    oldest: u64,
}

/// The reader side of a broadcast ring.
#[derive(Clone)]
pub struct BroadcastReader {
    shared: Arc<Shared>,
    /// Sequence (byte cursor) of the next frame to read.
    read: u64,
    /// Total bytes lost to overruns.
    overruns: u64,
}

impl BroadcastWriter {
    /// Creates a broadcast ring of `cfg.capacity` bytes.
    pub fn new(cfg: RingConfig) -> Self {
        let shared = Arc::new(Shared {
            write: CachePadded::new(AtomicU64::new(0)),
            claim: CachePadded::new(AtomicU64::new(0)),
            oldest: CachePadded::new(AtomicU64::new(0)),
            storage: ByteStorage::new(cfg.capacity),
            mask: cfg.mask(),
            capacity: cfg.capacity as u64,
        });
        Self {
            shared,
            write: 0,
            oldest: 0,
        }
    }

    /// Attaches a reader at the current write position (tail-follow): it will
    /// only see messages published after this call.
    pub fn subscribe(&self) -> BroadcastReader {
        BroadcastReader {
            shared: Arc::clone(&self.shared),
            read: self.write,
            overruns: 0,
        }
    }

    /// Attaches a reader at the oldest message still held by the ring.
    pub fn subscribe_from_oldest(&self) -> BroadcastReader {
        BroadcastReader {
            shared: Arc::clone(&self.shared),
            read: self.oldest,
            overruns: 0,
        }
    }

    /// Publishes one framed message, overwriting the oldest frames if needed.
    ///
    /// # Errors
    /// [`PushError::TooLarge`] if the frame is larger than the ring. Slow
    /// readers never cause a rejection.
    pub fn try_push(&mut self, payload: &[u8]) -> Result<(), PushError> {
        let sh = &*self.shared;
        let frame = framed_len(payload.len());
        if frame as u64 > sh.capacity {
            return Err(PushError::TooLarge {
                frame,
                capacity: sh.capacity as usize,
            });
        }

        let start = self.write;
        let end = start + frame as u64;

        // Retire every frame that [start, end) will clobber. Their headers are
        // still intact because nothing has been written yet.
        while self.oldest + sh.capacity < end {
            let mut header = [0u8; HEADER_SIZE];
            // SAFETY: only the writer mutates storage
            unsafe {
                sh.storage
                    .copy_out(seq_to_index(self.oldest, sh.mask), &mut header)
            };
            self.oldest += framed_len(u64::from_le_bytes(header) as usize) as u64;
        }
        sh.oldest.store(self.oldest, Ordering::Release);

        // Announce the range before touching it. The release fence orders the
        // claim ahead of the byte stores for any reader that observes them.
        sh.claim.store(end, Ordering::Release);
        fence(Ordering::Release);

        let offset = seq_to_index(start, sh.mask);
        // SAFETY: single writer; readers validate against `claim`
        unsafe {
            sh.storage
                .copy_in(offset, &(payload.len() as u64).to_le_bytes());
            sh.storage.copy_in(offset + HEADER_SIZE, payload);
        }

        sh.write.store(end, Ordering::Release);
        self.write = end;
        Ok(())
    }

    /// Publishes one framed message; `false` only if it can never fit.
    #[inline]
    pub fn push(&mut self, payload: &[u8]) -> bool {
        self.try_push(payload).is_ok()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity as usize
    }

    /// Current write cursor.
    pub fn position(&self) -> u64 {
        self.write
    }

    /// Cursor of the oldest frame still held by the ring.
    pub fn oldest(&self) -> u64 {
        self.oldest
    }

    /// Readers (clones included) currently attached.
    pub fn readers(&self) -> usize {
        Arc::strong_count(&self.shared) - 1
    }
}

impl BroadcastReader {
    /// Attempts to read the next message. Never blocks.
    ///
    /// Returns [`TryRead::Empty`] when caught up, [`TryRead::Overrun`] once per
    /// detected loss (the following call resumes at the oldest intact frame),
    /// otherwise the next message.
    pub fn try_read(&mut self) -> TryRead {
        let mut out = Vec::new();
        match self.try_read_into(&mut out) {
            ReadStatus::Ok => TryRead::Message(out),
            ReadStatus::Empty => TryRead::Empty,
            ReadStatus::Overrun { skipped } => TryRead::Overrun { skipped },
        }
    }

    /// Like [`try_read`](Self::try_read) but copies the payload into `out`,
    /// reusing its allocation. `out` holds the message only when the result is
    /// [`ReadStatus::Ok`].
    pub fn try_read_into(&mut self, out: &mut Vec<u8>) -> ReadStatus {
        let sh = &*self.shared;
        let write = sh.write.load(Ordering::Acquire);
        if self.read >= write {
            return ReadStatus::Empty;
        }
        if write - self.read > sh.capacity {
            return sh.resync(write, &mut self.read, &mut self.overruns);
        }

        let offset = seq_to_index(self.read, sh.mask);
        let mut header = [0u8; HEADER_SIZE];
        // SAFETY: may race with the writer; validated below
        unsafe { sh.storage.copy_out(offset, &mut header) };
        if let Some(overrun) = sh.validate(&mut self.read, &mut self.overruns) {
            return overrun;
        }

        let len = u64::from_le_bytes(header);
        let frame = HEADER_SIZE as u64 + len;
        // Frame not entirely published yet.
        if frame > sh.capacity || self.read + frame > write {
            return ReadStatus::Empty;
        }

        out.clear();
        out.resize(len as usize, 0);
        // SAFETY: may race with the writer; validated below
        unsafe { sh.storage.copy_out(offset + HEADER_SIZE, out) };
        if let Some(overrun) = sh.validate(&mut self.read, &mut self.overruns) {
            out.clear();
            return overrun;
        }

        self.read += frame;
        ReadStatus::Ok
    }

    /// Total bytes lost to overruns since this reader was created.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Bytes published but not yet read by this reader.
    pub fn lag(&self) -> u64 {
        self.shared
            .write
            .load(Ordering::Acquire)
            .saturating_sub(self.read)
    }

    /// Cursor of the next frame this reader will read.
    pub fn position(&self) -> u64 {
        self.read
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity as usize
    }
}

impl fmt::Debug for BroadcastWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastWriter")
            .field("capacity", &self.shared.capacity)
            .field("write", &self.write)
            .field("oldest", &self.oldest)
            .finish()
    }
}

impl fmt::Debug for BroadcastReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastReader")
            .field("read", &self.read)
            .field("overruns", &self.overruns)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(r: TryRead) -> Vec<u8> {
        match r {
            TryRead::Message(m) => m,
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn fresh_reader_is_empty() {
        let writer = BroadcastWriter::new(RingConfig::new(64));
        let mut reader = writer.subscribe();
        assert_eq!(reader.try_read(), TryRead::Empty);
    }

    #[test]
    fn every_reader_sees_every_message() {
        let mut writer = BroadcastWriter::new(RingConfig::new(128));
        let mut a = writer.subscribe();
        let mut b = writer.subscribe();
        assert!(writer.push(b"one"));
        assert!(writer.push(b"two"));

        for reader in [&mut a, &mut b] {
            assert_eq!(msg(reader.try_read()), b"one");
            assert_eq!(msg(reader.try_read()), b"two");
            assert_eq!(reader.try_read(), TryRead::Empty);
        }
    }

    #[test]
    fn subscribe_is_tail_follow() {
        let mut writer = BroadcastWriter::new(RingConfig::new(128));
        assert!(writer.push(b"before"));
        let mut late = writer.subscribe();
        let mut early = writer.subscribe_from_oldest();
        assert!(writer.push(b"after"));

        assert_eq!(msg(late.try_read()), b"after");
        assert_eq!(msg(early.try_read()), b"before");
        assert_eq!(msg(early.try_read()), b"after");
    }

    #[test]
    fn clone_keeps_independent_cursor() {
        let mut writer = BroadcastWriter::new(RingConfig::new(64));
        let mut a = writer.subscribe();
        assert!(writer.push(b"x"));
        assert!(writer.push(b"y"));
        assert_eq!(msg(a.try_read()), b"x");

        let mut b = a.clone();
        assert_eq!(msg(a.try_read()), b"y");
        assert_eq!(msg(b.try_read()), b"y");
        assert_eq!(writer.readers(), 2);
    }

    #[test]
    fn never_blocks_on_slow_reader() {
        let mut writer = BroadcastWriter::new(RingConfig::new(32));
        let _idle = writer.subscribe();
        for i in 0..1_000u32 {
            assert!(writer.push(&i.to_le_bytes()));
        }
        assert!(writer.try_push(&[0; 25]).is_err());
    }

    #[test]
    fn idle_reader_is_overrun() {
        // Three 8-byte frames: 24 bytes through a 16-byte ring.
        let mut writer = BroadcastWriter::new(RingConfig::new(16));
        let mut reader = writer.subscribe();
        for _ in 0..3 {
            assert!(writer.push(&[]));
        }

        assert_eq!(reader.try_read(), TryRead::Overrun { skipped: 8 });
        assert_eq!(reader.overruns(), 8);
        assert_eq!(reader.position(), writer.oldest());
        assert_eq!(msg(reader.try_read()), b"");
        assert_eq!(msg(reader.try_read()), b"");
        assert_eq!(reader.try_read(), TryRead::Empty);
    }

    #[test]
    fn resync_lands_on_frame_boundary() {
        let mut writer = BroadcastWriter::new(RingConfig::new(32));
        let mut reader = writer.subscribe();
        // Frames of 11, 13, 10, 12 bytes.
        for payload in [&b"abc"[..], b"defgh", b"ij", b"klmn"] {
            assert!(writer.push(payload));
        }
        // end = 46, so anything before 14 is gone; "abc" and "defgh" frames
        // both start before that.
        let overrun = reader.try_read();
        assert_eq!(overrun, TryRead::Overrun { skipped: 24 });
        assert_eq!(msg(reader.try_read()), b"ij");
        assert_eq!(msg(reader.try_read()), b"klmn");
    }

    #[test]
    fn frame_filling_whole_ring() {
        let mut writer = BroadcastWriter::new(RingConfig::new(16));
        let mut reader = writer.subscribe();
        assert!(writer.push(&[7; 8]));
        assert_eq!(msg(reader.try_read()), vec![7; 8]);
        assert!(writer.push(&[9; 8]));
        assert_eq!(msg(reader.try_read()), vec![9; 8]);
    }

    #[test]
    fn try_read_into_reuses_buffer() {
        let mut writer = BroadcastWriter::new(RingConfig::new(64));
        let mut reader = writer.subscribe();
        let mut buf = Vec::with_capacity(32);
        assert_eq!(reader.try_read_into(&mut buf), ReadStatus::Empty);
        assert!(writer.push(b"payload"));
        assert!(writer.push(b"next"));
        assert_eq!(reader.try_read_into(&mut buf), ReadStatus::Ok);
        assert_eq!(buf, b"payload");
        assert_eq!(reader.try_read().into_message().as_deref(), Some(&b"next"[..]));
        assert_eq!(reader.try_read().into_message(), None);
        assert_eq!(reader.lag(), 0);
    }

    #[test]
    fn validate_catches_lap_after_copy() {
        let mut writer = BroadcastWriter::new(RingConfig::new(32));
        let mut reader = writer.subscribe();
        assert!(writer.push(b"abcd"));
        let status = reader.shared.validate(&mut reader.read, &mut reader.overruns);
        assert_eq!(status, None);

        // Writer laps the reader between its copy and its check.
        for _ in 0..4 {
            assert!(writer.push(b"abcd"));
        }
        let status = reader.shared.validate(&mut reader.read, &mut reader.overruns);
        assert_eq!(status, Some(ReadStatus::Overrun { skipped: 36 }));
        assert_eq!(reader.position(), writer.oldest());
        assert_eq!(msg(reader.try_read()), b"abcd");
        assert_eq!(msg(reader.try_read()), b"abcd");
        assert_eq!(reader.try_read(), TryRead::Empty);
    }

    #[test]
    fn try_read_into_never_returns_torn_message() {
        const PUSHES: u64 = 200_000;
        let mut writer = BroadcastWriter::new(RingConfig::new(64));
        let readers: Vec<_> = (0..2).map(|_| writer.subscribe()).collect();

        std::thread::scope(|s| {
            for mut reader in readers {
                s.spawn(move || {
                    let mut buf = Vec::new();
                    let mut last = None;
                    loop {
                        match reader.try_read_into(&mut buf) {
                            ReadStatus::Ok => {
                                let seq = u64::from_le_bytes(buf[..8].try_into().unwrap());
                                assert!(buf[8..].iter().all(|&b| b == seq as u8));
                                assert!(last.is_none_or(|l| seq > l));
                                last = Some(seq);
                                if seq == PUSHES - 1 {
                                    break;
                                }
                            }
                            ReadStatus::Overrun { .. } => {}
                            ReadStatus::Empty => std::hint::spin_loop(),
                        }
                    }
                });
            }

            let mut payload = [0u8; 24];
            for seq in 0..PUSHES {
                payload[..8].copy_from_slice(&seq.to_le_bytes());
                payload[8..].fill(seq as u8);
                assert!(writer.push(&payload));
            }
        });
    }
}
