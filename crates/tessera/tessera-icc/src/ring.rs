//! Ring buffer configuration and cursor arithmetic.
//!
//! Every ring in this crate addresses its storage through monotonically
//! increasing `u64` cursors. The storage offset of a cursor is
//! `cursor mod capacity`, computed with a bitmask because capacities are
//! always powers of two.
//!
//! This module also owns the frame layout shared by the two byte rings:
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────────┐
//! │ len: u64 (LE, 8 B)   │ payload: len bytes           │
//! └──────────────────────┴──────────────────────────────┘
//! ```

use crate::error::IccError;
use std::mem::size_of;

/// Size of the length prefix in front of every byte-ring frame.
pub const HEADER_SIZE: usize = size_of::<u64>();

/// Configuration for a ring buffer.
///
/// For the byte rings ([`spsc`](crate::spsc), [`BroadcastWriter`](crate::BroadcastWriter))
/// the capacity is counted in bytes; for the [`fixed`](crate::fixed) ring it is
/// counted in elements.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RingConfig {
    /// Storage size. Must be a power of 2.
    pub capacity: usize,
}

impl RingConfig {
    /// Creates a new ring configuration with the specified capacity.
    ///
    /// # Panics
    /// Panics if `capacity` is not a power of 2.
    ///
    /// # Example
    /// ```
    /// use tessera_icc::RingConfig;
    /// let cfg = RingConfig::new(1024); // OK: 1024 = 2^10
    /// // RingConfig::new(1000);        // Would panic: not a power of 2
    /// ```
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "Capacity must be power of 2");
        Self { capacity }
    }

    /// Non-panicking form of [`RingConfig::new`].
    ///
    /// ```
    /// use tessera_icc::{IccError, RingConfig};
    /// assert!(RingConfig::try_new(64).is_ok());
    /// assert_eq!(RingConfig::try_new(48), Err(IccError::InvalidCapacity(48)));
    /// ```
    pub fn try_new(capacity: usize) -> Result<Self, IccError> {
        if capacity.is_power_of_two() {
            Ok(Self { capacity })
        } else {
            Err(IccError::InvalidCapacity(capacity))
        }
    }

    /// Returns the bitmask for index calculation (`capacity - 1`).
    ///
    /// ```
    /// use tessera_icc::RingConfig;
    /// let cfg = RingConfig::new(8);
    /// assert_eq!(cfg.mask(), 7);
    /// ```
    #[inline(always)]
    pub fn mask(&self) -> u64 {
        (self.capacity as u64) - 1
    }

    /// Largest payload a byte ring of this capacity can ever accept.
    ///
    /// ```
    /// use tessera_icc::RingConfig;
    /// assert_eq!(RingConfig::new(16).max_payload(), 8);
    /// assert_eq!(RingConfig::new(4).max_payload(), 0);
    /// ```
    pub fn max_payload(&self) -> usize {
        self.capacity.saturating_sub(HEADER_SIZE)
    }
}

/// Converts a cursor to a storage offset.
///
/// With `capacity = 8` (mask = 7 = `0b111`):
/// ```text
/// seq =  5 → 5 & 7 = 5
/// seq =  8 → 8 & 7 = 0  (wraps around)
/// seq = 15 → 15 & 7 = 7
/// ```
#[inline(always)]
pub fn seq_to_index(seq: u64, mask: u64) -> usize {
    (seq & mask) as usize
}

/// Bytes occupied in the ring by a frame carrying `payload_len` bytes.
#[inline(always)]
pub fn framed_len(payload_len: usize) -> usize {
    HEADER_SIZE + payload_len
}

/// Detects and recovers from a broadcast reader overrun.
///
/// `horizon` is the furthest cursor the writer may have touched: the committed
/// write cursor, or the end of the frame currently being written. Bytes older
/// than `horizon - capacity` may already be overwritten, so a reader whose
/// cursor sits further back than that has lost data.
///
/// On overrun the reader is moved to `oldest`, the first frame boundary the
/// writer still guarantees to be intact, and the number of skipped bytes is
/// both added to `overruns` and returned.
///
/// ```text
/// capacity = 16, horizon = 40, read_seq = 8, oldest = 26
///
/// behind = 40 - 8 = 32 > 16  → overrun
/// skipped = 26 - 8 = 18 bytes lost
/// read_seq = 26
/// ```
#[inline(always)]
pub fn apply_overrun_policy(
    horizon: u64,
    read_seq: &mut u64,
    capacity: u64,
    oldest: u64,
    overruns: &mut u64,
) -> Option<u64> {
    // saturating_sub: a reader resynchronised to `oldest` can briefly sit
    // ahead of a stale horizon
    let behind = horizon.saturating_sub(*read_seq);
    if behind <= capacity {
        return None;
    }
    let target = oldest.max(*read_seq);
    let skipped = target - *read_seq;
    *overruns += skipped;
    *read_seq = target;
    Some(skipped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "power of 2")]
    fn rejects_non_power_of_two() {
        RingConfig::new(24);
    }

    #[test]
    fn zero_capacity_is_invalid() {
        assert_eq!(RingConfig::try_new(0), Err(IccError::InvalidCapacity(0)));
    }

    #[test]
    fn index_wraps_with_mask() {
        let cfg = RingConfig::new(16);
        assert_eq!(seq_to_index(3, cfg.mask()), 3);
        assert_eq!(seq_to_index(16, cfg.mask()), 0);
        assert_eq!(seq_to_index(37, cfg.mask()), 5);
    }

    #[test]
    fn overrun_policy_leaves_reader_in_window_alone() {
        let mut read = 10;
        let mut overruns = 0;
        assert_eq!(apply_overrun_policy(26, &mut read, 16, 12, &mut overruns), None);
        assert_eq!(read, 10);
        assert_eq!(overruns, 0);
    }

    #[test]
    fn overrun_policy_jumps_to_oldest_frame() {
        let mut read = 8;
        let mut overruns = 3;
        let skipped = apply_overrun_policy(40, &mut read, 16, 26, &mut overruns);
        assert_eq!(skipped, Some(18));
        assert_eq!(read, 26);
        assert_eq!(overruns, 21);
    }
}
