//! Definition of a single producer, single consumer byte ring buffer.

use crate::{ConstructionError, Cursors, DefaultRegion, Record, Region, SplitRegion, TeardownError};
use std::{cmp::min, slice};

/// Type alias for a [`RingBuffer`] backed by [`crate::MirroredRegion`].
#[cfg(unix)]
pub type MirroredRing = RingBuffer<crate::MirroredRegion>;

/// Type alias for a [`RingBuffer`] backed by [`SplitRegion`].
pub type SplitRing = RingBuffer<SplitRegion>;

/// Options to build a [`RingBuffer`] with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingOptions {
    order: u32,
    populate: bool,
}

impl RingOptions {
    /// Create options for a ring buffer that holds at least `2^order` bytes.
    ///
    /// Capacity is rounded up to a multiple of the host page size.
    ///
    /// # Arguments
    ///
    /// * `order` - Log2 of requested capacity in bytes.
    pub fn new(order: u32) -> Self {
        Self {
            order,
            populate: false,
        }
    }

    /// Fault all pages during construction so that they are eagerly initialized.
    ///
    /// # Arguments
    ///
    /// * `populate` - True to pre-fault pages.
    pub fn populate(&mut self, populate: bool) -> &mut Self {
        self.populate = populate;
        self
    }

    /// Build a ring buffer backed by the given type of region.
    ///
    /// Either returns a fully usable ring buffer, or an error describing
    /// which step of mapping memory failed.
    pub fn build<M: Region>(&self) -> Result<RingBuffer<M>, ConstructionError> {
        let capacity = crate::capacity_for(self.order)?;
        let region = M::reserve(capacity, self.populate).inspect_err(|error| {
            tracing::error!(order = self.order, capacity, %error, "Cannot map ring buffer memory");
        })?;

        tracing::debug!(capacity, mirrored = M::MIRRORED, "Mapped ring buffer memory");
        Ok(RingBuffer::from_region(region))
    }
}

/// A fixed size byte stream with exactly one producer and one consumer.
///
/// Bytes are copied in at the write cursor and copied out at the read cursor.
/// Neither side ever blocks: a transfer that does not fit is truncated and the
/// number of bytes actually moved is returned. Waiting for space or data, be it
/// spinning, yielding or sleeping, is up to the caller.
///
/// With a mirrored region (the default on unix) every transfer is a single
/// linear copy, even across the end of the buffer.
///
/// Use [`RingBuffer::split`] to get a [`Producer`] and a [`Consumer`] that can
/// be moved to different threads. For single threaded use, every operation is
/// also available directly on the ring buffer.
#[derive(Debug)]
pub struct RingBuffer<M = DefaultRegion> {
    mask: u64,
    region: M,
    cursors: Cursors,
    producer: ProducerState,
    consumer: ConsumerState,
}

// Snapshot of the read cursor, private to the producer.
#[derive(Debug, Default)]
struct ProducerState {
    cached_read: u64,
}

// Snapshot of the write cursor, private to the consumer.
#[derive(Debug, Default)]
struct ConsumerState {
    cached_write: u64,
}

impl RingBuffer {
    /// Create a ring buffer that holds at least `2^order` bytes.
    ///
    /// Uses the [`DefaultRegion`] of this platform. Use [`RingOptions`]
    /// for other regions or to tune construction.
    ///
    /// # Arguments
    ///
    /// * `order` - Log2 of requested capacity in bytes.
    pub fn create(order: u32) -> Result<Self, ConstructionError> {
        RingOptions::new(order).build()
    }
}

impl<M: Region> RingBuffer<M> {
    /// Create a ring buffer from the given options.
    ///
    /// # Arguments
    ///
    /// * `options` - Options to build ring buffer with.
    pub fn with_options(options: &RingOptions) -> Result<Self, ConstructionError> {
        options.build()
    }

    /// Create an empty ring buffer over an already reserved region.
    ///
    /// # Panic
    ///
    /// * Panics if capacity of region is not a power of 2.
    ///
    /// # Arguments
    ///
    /// * `region` - Memory to hold bytes in.
    pub fn from_region(region: M) -> Self {
        let capacity = region.capacity();
        assert!(capacity.is_power_of_two(), "Capacity should be power of 2");

        Self {
            region,
            mask: capacity as u64 - 1,
            cursors: Cursors::default(),
            producer: ProducerState::default(),
            consumer: ConsumerState::default(),
        }
    }

    /// Release memory held by this ring buffer.
    ///
    /// Memory is also released when a ring buffer is dropped, but failures
    /// are only logged in that case.
    pub fn destroy(self) -> Result<(), TeardownError> {
        let capacity = self.capacity();
        self.region.release()?;

        tracing::debug!(capacity, "Released ring buffer memory");
        Ok(())
    }

    /// Split ring buffer into its producer and consumer halves.
    ///
    /// Both halves can be moved to different threads, for instance with
    /// [`std::thread::scope`]. Since there is exactly one of each, concurrent
    /// producers or concurrent consumers can never happen.
    pub fn split(&mut self) -> (Producer<'_, M>, Consumer<'_, M>) {
        let producer = Producer {
            mask: self.mask,
            region: &self.region,
            cursors: &self.cursors,
            state: &mut self.producer,
        };

        let consumer = Consumer {
            mask: self.mask,
            region: &self.region,
            cursors: &self.cursors,
            state: &mut self.consumer,
        };

        (producer, consumer)
    }

    /// Maximum number of bytes this ring buffer can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    /// True if every transfer is a single linear copy.
    #[inline]
    pub fn is_mirrored(&self) -> bool {
        M::MIRRORED
    }

    /// Total number of bytes ever written, since creation or last reset.
    #[inline]
    pub fn write_offset(&self) -> u64 {
        self.cursors.write()
    }

    /// Total number of bytes ever consumed, since creation or last reset.
    #[inline]
    pub fn read_offset(&self) -> u64 {
        self.cursors.read()
    }

    /// Number of bytes available to read.
    ///
    /// Refreshes cached snapshots of both sides.
    pub fn available_for_read(&mut self) -> usize {
        let write = self.cursors.write();
        let read = self.cursors.read();
        self.consumer.cached_write = write;
        self.producer.cached_read = read;
        (write - read) as usize
    }

    /// Number of bytes that can be written without overwriting unread bytes.
    pub fn available_for_write(&mut self) -> usize {
        self.capacity() - self.available_for_read()
    }

    /// Discard all bytes and rewind both cursors to zero.
    ///
    /// Also forgets that stream was closed, so that ring buffer can be
    /// reused for a new stream.
    pub fn reset(&mut self) {
        self.cursors.reset();
        self.producer = ProducerState::default();
        self.consumer = ConsumerState::default();
    }

    /// See [`Producer::write_slice`].
    pub fn write_slice(&mut self) -> &mut [u8] {
        let (offset, len) = self.split().0.free_span();

        // Safety: Nobody else can read or write while we hold exclusive reference.
        unsafe { slice::from_raw_parts_mut(self.region.as_ptr().add(offset), len) }
    }

    /// See [`Consumer::read_slice`].
    pub fn read_slice(&mut self) -> &[u8] {
        let (offset, len) = self.split().1.filled_span();

        // Safety: Nobody else can read or write while we hold exclusive reference.
        unsafe { slice::from_raw_parts(self.region.as_ptr().add(offset), len) }
    }

    /// See [`Producer::advance_write`].
    pub fn advance_write(&mut self, count: usize) {
        self.split().0.advance_write(count);
    }

    /// See [`Consumer::advance_read`].
    pub fn advance_read(&mut self, count: usize) {
        self.split().1.advance_read(count);
    }

    /// See [`Producer::write`].
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.split().0.write(data)
    }

    /// See [`Consumer::read`].
    pub fn read(&mut self, data: &mut [u8]) -> usize {
        self.split().1.read(data)
    }

    /// See [`Consumer::peek`].
    pub fn peek(&mut self, data: &mut [u8]) -> usize {
        self.split().1.peek(data)
    }

    /// See [`Producer::write_records`].
    pub fn write_records<T: Record>(&mut self, records: &[T]) -> usize {
        self.split().0.write_records(records)
    }

    /// See [`Consumer::read_records`].
    pub fn read_records<T: Record>(&mut self, records: &mut [T]) -> usize {
        self.split().1.read_records(records)
    }

    /// See [`Producer::signal_close`].
    pub fn signal_close(&mut self) {
        self.cursors.close();
    }

    /// See [`Consumer::at_end_of_stream`].
    pub fn at_end_of_stream(&self) -> bool {
        self.cursors.read() == self.cursors.write()
    }

    /// See [`Consumer::end_offset`].
    pub fn end_offset(&self) -> Option<u64> {
        self.cursors.end_offset()
    }
}

/// Writing half of a [`RingBuffer`].
#[derive(Debug)]
pub struct Producer<'a, M> {
    mask: u64,
    region: &'a M,
    cursors: &'a Cursors,
    state: &'a mut ProducerState,
}

impl<M: Region> Producer<'_, M> {
    /// Maximum number of bytes the ring buffer can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    /// Number of bytes that can be written without overwriting unread bytes.
    ///
    /// Refreshes the cached read cursor. Free space can only grow until
    /// the next write, since only the consumer changes the read cursor.
    pub fn available_for_write(&mut self) -> usize {
        self.state.cached_read = self.cursors.read();
        let used = self.cursors.own_write() - self.state.cached_read;
        self.capacity() - used as usize
    }

    /// Physical offset of the write cursor, and how many free bytes follow it linearly.
    fn free_span(&mut self) -> (usize, usize) {
        let free = self.available_for_write();
        let offset = (self.cursors.own_write() & self.mask) as usize;
        (offset, min(free, self.region.contiguous(offset)))
    }

    /// Free memory at the write cursor, for writing bytes in place.
    ///
    /// Once bytes are written, make them visible to the consumer with
    /// [`Producer::advance_write`]. With a mirrored region the slice covers all
    /// free space. Otherwise it stops at the end of the buffer, and the rest of the
    /// free space is returned by the next call after advancing.
    pub fn write_slice(&mut self) -> &mut [u8] {
        let (offset, len) = self.free_span();

        // Safety: Bytes between write cursor and read cursor + capacity belong
        // to the producer until write cursor is advanced past them.
        unsafe { slice::from_raw_parts_mut(self.region.as_ptr().add(offset), len) }
    }

    /// Publish bytes written in place via [`Producer::write_slice`].
    ///
    /// Count is truncated so that unread bytes are never overwritten.
    ///
    /// # Arguments
    ///
    /// * `count` - Number of bytes to publish.
    pub fn advance_write(&mut self, count: usize) {
        let write = self.cursors.own_write();
        self.state.cached_read = self.cursors.read();

        let limit = self.state.cached_read + self.capacity() as u64;
        self.cursors
            .publish_write(min(write.saturating_add(count as u64), limit));
    }

    /// Copy bytes into the ring buffer.
    ///
    /// If there is not enough free space, only as many bytes as fit are written.
    /// Returns number of bytes written, which can be anything between 0 and
    /// `data.len()`.
    ///
    /// # Arguments
    ///
    /// * `data` - Bytes to write.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let write = self.cursors.own_write();
        let capacity = self.capacity() as u64;

        // Only look at the consumer's cursor when snapshot says we don't fit.
        let mut len = data.len() as u64;
        if write + len > self.state.cached_read + capacity {
            self.state.cached_read = self.cursors.read();
            len = min(len, self.state.cached_read + capacity - write);
        }

        if len == 0 {
            return 0;
        }

        // Safety: Free bytes belong to the producer, and len <= free <= capacity.
        let (data, _) = data.split_at(len as usize);
        unsafe { self.region.copy_in((write & self.mask) as usize, data) };

        self.cursors.publish_write(write + len);
        data.len()
    }

    /// Copy as many whole records as fit into the ring buffer.
    ///
    /// A record is never partially written. Returns number of records written.
    /// Zero sized records occupy no bytes, nothing is written and 0 is returned.
    ///
    /// # Arguments
    ///
    /// * `records` - Records to write.
    pub fn write_records<T: Record>(&mut self, records: &[T]) -> usize {
        if T::size() == 0 {
            return 0;
        }

        let fits = self.available_for_write() / T::size();
        let (records, _) = records.split_at(min(records.len(), fits));

        // Free space can only have grown since we checked.
        let written = self.write(T::to_bytes_slice(records));
        debug_assert_eq!(written, records.len() * T::size());
        records.len()
    }

    /// Mark current write cursor as the end of stream.
    ///
    /// This is only a marker, writes after closing are still accepted.
    pub fn signal_close(&self) {
        self.cursors.close();
    }
}

/// Reading half of a [`RingBuffer`].
#[derive(Debug)]
pub struct Consumer<'a, M> {
    mask: u64,
    region: &'a M,
    cursors: &'a Cursors,
    state: &'a mut ConsumerState,
}

impl<M: Region> Consumer<'_, M> {
    /// Maximum number of bytes the ring buffer can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    /// Number of bytes available to read.
    ///
    /// Refreshes the cached write cursor. Available bytes can only grow until
    /// the next read, since only the producer changes the write cursor.
    pub fn available_for_read(&mut self) -> usize {
        self.state.cached_write = self.cursors.write();
        (self.state.cached_write - self.cursors.own_read()) as usize
    }

    /// Physical offset of the read cursor, and how many readable bytes follow it linearly.
    fn filled_span(&mut self) -> (usize, usize) {
        let available = self.available_for_read();
        let offset = (self.cursors.own_read() & self.mask) as usize;
        (offset, min(available, self.region.contiguous(offset)))
    }

    /// Number of bytes a read of `requested` bytes can return right now.
    fn clamp(&mut self, read: u64, requested: usize) -> usize {
        // Only look at the producer's cursor when snapshot says we don't have enough.
        let mut len = requested as u64;
        if read + len > self.state.cached_write {
            self.state.cached_write = self.cursors.write();
            len = min(len, self.state.cached_write - read);
        }

        len as usize
    }

    /// Unread bytes at the read cursor, for reading in place.
    ///
    /// Once bytes are processed, give them back to the producer with
    /// [`Consumer::advance_read`]. With a mirrored region the slice covers all
    /// available bytes. Otherwise it stops at the end of the buffer, and the rest
    /// is returned by the next call after advancing.
    pub fn read_slice(&mut self) -> &[u8] {
        let (offset, len) = self.filled_span();

        // Safety: Bytes between read cursor and write cursor are never written
        // by the producer until read cursor is advanced past them.
        unsafe { slice::from_raw_parts(self.region.as_ptr().add(offset), len) }
    }

    /// Consume bytes without copying them.
    ///
    /// Count is truncated so that read cursor never passes the write cursor.
    ///
    /// # Arguments
    ///
    /// * `count` - Number of bytes to consume.
    pub fn advance_read(&mut self, count: usize) {
        let read = self.cursors.own_read();
        self.state.cached_write = self.cursors.write();

        self.cursors.publish_read(min(
            read.saturating_add(count as u64),
            self.state.cached_write,
        ));
    }

    /// Copy bytes out of the ring buffer and consume them.
    ///
    /// If there are not enough bytes available, only as many bytes as are
    /// available are read. Returns number of bytes read, which can be anything
    /// between 0 and `data.len()`.
    ///
    /// # Arguments
    ///
    /// * `data` - Buffer to copy bytes into.
    pub fn read(&mut self, data: &mut [u8]) -> usize {
        let len = self.peek(data);
        if len > 0 {
            let read = self.cursors.own_read();
            self.cursors.publish_read(read + len as u64);
        }

        len
    }

    /// Copy bytes out of the ring buffer without consuming them.
    ///
    /// Same as [`Consumer::read`], except that read cursor does not move.
    ///
    /// # Arguments
    ///
    /// * `data` - Buffer to copy bytes into.
    pub fn peek(&mut self, data: &mut [u8]) -> usize {
        let read = self.cursors.own_read();
        let len = self.clamp(read, data.len());

        // Safety: Published bytes are not touched by the producer until consumed.
        let (data, _) = data.split_at_mut(len);
        unsafe { self.region.copy_out((read & self.mask) as usize, data) };
        len
    }

    /// Copy as many whole records as are available out of the ring buffer.
    ///
    /// A record is never partially consumed. Returns number of records read.
    /// Zero sized records occupy no bytes, nothing is read and 0 is returned.
    ///
    /// # Arguments
    ///
    /// * `records` - Buffer to copy records into.
    pub fn read_records<T: Record>(&mut self, records: &mut [T]) -> usize {
        if T::size() == 0 {
            return 0;
        }

        let available = self.available_for_read() / T::size();
        let count = min(records.len(), available);
        let (records, _) = records.split_at_mut(count);

        // Available bytes can only have grown since we checked.
        let read = self.read(T::to_bytes_slice_mut(records));
        debug_assert_eq!(read, count * T::size());
        count
    }

    /// True when every byte written so far has been consumed.
    ///
    /// Does not look at whether the stream was closed, see [`Consumer::is_closed`].
    pub fn at_end_of_stream(&self) -> bool {
        self.cursors.own_read() == self.cursors.write()
    }

    /// True if the producer closed the stream.
    pub fn is_closed(&self) -> bool {
        self.cursors.end_offset().is_some()
    }

    /// Write cursor at the time the producer closed the stream.
    pub fn end_offset(&self) -> Option<u64> {
        self.cursors.end_offset()
    }
}
