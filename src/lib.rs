//! # Mirrorbuf
//!
//! Mirrorbuf provides a lock-free, single producer, single consumer byte ring buffer
//! whose wraparound is invisible to readers and writers.
//!
//! ## Mirroring
//!
//! A ring buffer of capacity `C` reserves `2 * C` bytes of address space and maps the
//! same memory into both halves. Byte at `base + C + i` is byte at `base + i`. So any
//! read or write of up to `C` bytes, starting anywhere, is a single linear copy, and
//! zero-copy slices never have to be split at the end of the buffer.
//!
//! Hosts that cannot alias memory like this use a [`SplitRegion`] instead, which
//! behaves identically but splits transfers that cross the end of the buffer.
//!
//! ## Flow control
//!
//! Producer and consumer each own a monotonic cursor and keep a cached snapshot of
//! the other side's cursor. Transfers never block, they are truncated to whatever
//! fits and return the number of bytes actually moved.
//!
//! ```
//! use mirrorbuf::RingBuffer;
//!
//! let mut ring = RingBuffer::create(16)?;
//! let (mut producer, mut consumer) = ring.split();
//!
//! assert_eq!(producer.write(b"hello"), 5);
//! producer.signal_close();
//!
//! let mut data = [0; 16];
//! assert_eq!(consumer.read(&mut data), 5);
//! assert!(consumer.is_closed() && consumer.at_end_of_stream());
//! # Ok::<(), mirrorbuf::ConstructionError>(())
//! ```
//!
//! ### Features
//!
//! There is a blanket implementation for [`Record`] for supported types from popular crates,
//! allowing whole records to be moved through a ring buffer. This can be activated with one
//! of the feature flags below. Note only one of the features can be enabled, not all.
//!
//! * `zerocopy` - For types that implement supported traits from [`zerocopy`](https://docs.rs/zerocopy/latest/zerocopy/)
//! * `bytemuck` - For types that implement supported traits from [`bytemuck`](https://docs.rs/bytemuck/latest/bytemuck/)

pub(crate) mod cursor;
#[cfg(unix)]
pub(crate) mod mirror;
#[cfg(test)]
pub(crate) mod oracle;
pub(crate) mod record;
pub(crate) mod region;
pub(crate) mod ring;

// Types used across modules.
pub(crate) use cursor::Cursors;
pub(crate) use region::{capacity_for, check_capacity};

// Externally exposed types.
#[cfg(unix)]
pub use mirror::MirroredRegion;
pub use record::Record;
pub use region::{ConstructionError, DefaultRegion, Region, SplitRegion, TeardownError};
#[cfg(unix)]
pub use ring::MirroredRing;
pub use ring::{Consumer, Producer, RingBuffer, RingOptions, SplitRing};
