//! In-process, single-writer communication primitives.
//!
//! - [`spsc`]: bounded SPSC ring of variable-length byte messages
//! - [`fixed`]: bounded SPSC ring of fixed-size `Copy` elements
//! - [`BroadcastWriter`] / [`BroadcastReader`]: lossy SPMC byte ring
//! - [`Rcu`]: snapshot cell with wait-free readers
//! - [`SeqLock`]: small `Copy` value with retrying readers
//!
//! All cross-thread visibility goes through acquire/release pairs on the
//! cursors and counters documented in each module.

mod backoff;
mod broadcast;
mod error;
pub mod fixed;
mod rcu;
mod ring;
mod seqlock;
pub mod spsc;
mod wrap;

pub use backoff::Backoff;
pub use broadcast::{BroadcastReader, BroadcastWriter, ReadStatus, TryRead};
pub use error::{IccError, PushError};
pub use fixed::{FixedReader, FixedWriter};
pub use rcu::{Rcu, RcuGuard};
pub use ring::{HEADER_SIZE, RingConfig, framed_len};
pub use seqlock::SeqLock;
pub use spsc::{SpscReader, SpscWriter};
pub use wrap::{copy_in, copy_out};
