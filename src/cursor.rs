//! Definition of cursors that track the flow of bytes through a ring buffer.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Logical positions of producer and consumer in a byte stream.
///
/// Cursors are never wrapped, they only ever grow (until a reset). Physical
/// position of a cursor is `cursor & (capacity - 1)`.
///
/// * Write cursor is only ever stored by the producer.
/// * Read cursor is only ever stored by the consumer.
/// * Stores are `Release` and loads of the other side's cursor are `Acquire`.
///   Bytes copied before a cursor is published are visible to whoever observes
///   the published cursor.
#[derive(Debug, Default)]
pub(crate) struct Cursors {
    write: CachePadded<AtomicU64>,
    read: CachePadded<AtomicU64>,
    end: CachePadded<EndMarker>,
}

/// Position of the write cursor when the producer closed the stream.
#[derive(Debug, Default)]
struct EndMarker {
    closed: AtomicBool,
    offset: AtomicU64,
}

impl Cursors {
    /// Latest write cursor, as published by the producer.
    #[inline]
    pub(crate) fn write(&self) -> u64 {
        self.write.load(Ordering::Acquire)
    }

    /// Latest read cursor, as published by the consumer.
    #[inline]
    pub(crate) fn read(&self) -> u64 {
        self.read.load(Ordering::Acquire)
    }

    /// Write cursor as seen by the producer, which is the only one that stores it.
    #[inline]
    pub(crate) fn own_write(&self) -> u64 {
        self.write.load(Ordering::Relaxed)
    }

    /// Read cursor as seen by the consumer, which is the only one that stores it.
    #[inline]
    pub(crate) fn own_read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    /// Make bytes up to the new write cursor visible to the consumer.
    #[inline]
    pub(crate) fn publish_write(&self, write: u64) {
        debug_assert!(write >= self.own_write(), "Write cursor moved backwards");
        self.write.store(write, Ordering::Release);
    }

    /// Give bytes up to the new read cursor back to the producer.
    #[inline]
    pub(crate) fn publish_read(&self, read: u64) {
        debug_assert!(read >= self.own_read(), "Read cursor moved backwards");
        self.read.store(read, Ordering::Release);
    }

    /// Record current write cursor as the end of stream.
    pub(crate) fn close(&self) {
        self.end.offset.store(self.own_write(), Ordering::Relaxed);
        self.end.closed.store(true, Ordering::Release);
    }

    /// Write cursor at the time the stream was closed, if it was.
    pub(crate) fn end_offset(&self) -> Option<u64> {
        self.end
            .closed
            .load(Ordering::Acquire)
            .then(|| self.end.offset.load(Ordering::Relaxed))
    }

    /// Rewind both cursors to zero and forget the end of stream.
    ///
    /// Exclusive reference guarantees neither side is mid operation.
    pub(crate) fn reset(&mut self) {
        *self.write.get_mut() = 0;
        *self.read.get_mut() = 0;
        *self.end.closed.get_mut() = false;
        *self.end.offset.get_mut() = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursors_are_on_separate_cache_lines() {
        // Producer and consumer never store to the same line.
        let line = align_of::<CachePadded<AtomicU64>>();
        assert!(line >= 64);
        assert!(size_of::<Cursors>() >= 3 * line);
    }

    #[test]
    fn state_machine() {
        let mut cursors = Cursors::default();

        // Assert starting state.
        assert_eq!(cursors.write(), 0);
        assert_eq!(cursors.read(), 0);
        assert_eq!(cursors.end_offset(), None);

        // Publish some progress from both sides.
        cursors.publish_write(100);
        cursors.publish_read(40);
        assert_eq!(cursors.write(), 100);
        assert_eq!(cursors.own_write(), 100);
        assert_eq!(cursors.read(), 40);
        assert_eq!(cursors.own_read(), 40);

        // Close marks the current write cursor.
        cursors.close();
        assert_eq!(cursors.end_offset(), Some(100));

        // Closing again moves the marker along with the producer.
        cursors.publish_write(150);
        cursors.close();
        assert_eq!(cursors.end_offset(), Some(150));

        // Reset clears everything.
        cursors.reset();
        assert_eq!(cursors.write(), 0);
        assert_eq!(cursors.read(), 0);
        assert_eq!(cursors.end_offset(), None);
    }
}
