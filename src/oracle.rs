//! Reference implementation of a byte ring buffer using standard library primitives.

use std::{cmp::min, collections::VecDeque};

/// A fixed size byte stream backed by [`VecDeque`].
///
/// Mirrors the truncating transfer semantics of [`crate::RingBuffer`].
#[derive(Debug)]
pub(crate) struct Oracle {
    capacity: usize,
    deque: VecDeque<u8>,
}

impl Oracle {
    /// Create a new instance of this ring buffer.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of bytes this ring buffer can hold.
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            deque: VecDeque::with_capacity(capacity),
        }
    }

    pub(crate) fn available_for_read(&self) -> usize {
        self.deque.len()
    }

    pub(crate) fn available_for_write(&self) -> usize {
        self.capacity - self.deque.len()
    }

    /// Append as many bytes as fit, returning how many did.
    pub(crate) fn write(&mut self, data: &[u8]) -> usize {
        let len = min(data.len(), self.available_for_write());
        self.deque.extend(&data[..len]);
        len
    }

    /// Copy out as many bytes as are held without consuming them.
    pub(crate) fn peek(&self, data: &mut [u8]) -> usize {
        let len = min(data.len(), self.deque.len());
        for (dst, src) in data.iter_mut().zip(self.deque.range(..len)) {
            *dst = *src;
        }
        len
    }

    /// Copy out and consume as many bytes as are held.
    pub(crate) fn read(&mut self, data: &mut [u8]) -> usize {
        let len = self.peek(data);
        self.deque.drain(..len);
        len
    }

    /// Consume up to count bytes without copying them.
    pub(crate) fn advance_read(&mut self, count: usize) {
        self.deque.drain(..min(count, self.deque.len()));
    }

    pub(crate) fn clear(&mut self) {
        self.deque.clear();
    }
}
