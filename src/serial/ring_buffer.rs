//! ring_buffer.rs
//! Fixed-capacity circular byte queue backing each virtual UART's receive side.
//!
//! One slot is always kept free so `head == tail` means empty; a buffer built
//! with capacity `N` holds at most `N - 1` bytes. Pushing into a full buffer
//! is refused and the caller decides what to do with the byte (the receive
//! worker drops it and counts the drop).

/// Bounded circular queue over an owned byte array.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl RingBuffer {
    /// Create a buffer with `capacity` slots (usable space is `capacity - 1`).
    ///
    /// Capacities below 2 are rounded up to 2 so at least one byte fits.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity.max(2)].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes waiting to be read: `(head - tail) mod capacity`.
    #[inline]
    pub fn pending(&self) -> usize {
        let cap = self.buf.len();
        (self.head + cap - self.tail) % cap
    }

    /// Free slots left before the producer starts dropping.
    #[inline]
    pub fn free(&self) -> usize {
        self.buf.len() - 1 - self.pending()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        (self.head + 1) % self.buf.len() == self.tail
    }

    /// Append one byte. Returns `false` (and leaves the buffer untouched) when full.
    pub fn push(&mut self, byte: u8) -> bool {
        if self.is_full() {
            return false;
        }
        self.buf[self.head] = byte;
        self.head = (self.head + 1) % self.buf.len();
        true
    }

    /// Append as many bytes from `data` as fit; returns how many were stored.
    pub fn push_slice(&mut self, data: &[u8]) -> usize {
        let mut stored = 0;
        for &b in data {
            if !self.push(b) {
                break;
            }
            stored += 1;
        }
        stored
    }

    pub fn pop(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let byte = self.buf[self.tail];
        self.tail = (self.tail + 1) % self.buf.len();
        Some(byte)
    }

    pub fn peek(&self) -> Option<u8> {
        if self.is_empty() {
            None
        } else {
            Some(self.buf[self.tail])
        }
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(super::RX_BUFFER_SIZE)
    }
}
