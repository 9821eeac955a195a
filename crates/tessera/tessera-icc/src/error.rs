use thiserror::Error;

/// Why a push into a byte ring was rejected.
///
/// Neither variant mutates the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PushError {
    /// The framed message is larger than the whole ring. Retrying with the
    /// same payload can never succeed.
    #[error("frame of {frame} bytes can never fit in a ring of {capacity} bytes")]
    TooLarge { frame: usize, capacity: usize },

    /// The ring could hold the frame but not right now; retry once the reader
    /// has made progress.
    #[error("ring is full: frame needs {frame} bytes, {free} free")]
    Full { frame: usize, free: usize },
}

impl PushError {
    /// `true` for [`PushError::Full`], the only condition a retry can clear.
    pub fn is_transient(&self) -> bool {
        matches!(self, PushError::Full { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IccError {
    #[error("capacity {0} is not a power of two")]
    InvalidCapacity(usize),
}
