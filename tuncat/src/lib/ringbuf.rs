//! Fixed-capacity byte buffer with append/drain semantics, shared by all four
//! buffers the forwarding engine owns (SPEC_FULL.md §4.3). Compaction on drain
//! is a memmove, mirroring the C original's `memmove`-based `forward_packets`.

/// A contiguous byte buffer of fixed capacity holding a valid region `[0, len)`.
pub struct RingBuffer {
    buf: Vec<u8>,
    len: usize,
}

impl RingBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        RingBuffer { buf: vec![0u8; capacity], len: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Free space available after the valid region.
    pub fn free(&self) -> usize {
        self.buf.len() - self.len
    }

    /// The valid region.
    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The free slot a producer may read or copy into.
    pub fn writable(&mut self) -> &mut [u8] {
        &mut self.buf[self.len..]
    }

    /// Marks `n` bytes, just written into the slot returned by [`Self::writable`], as valid.
    pub fn append(&mut self, n: usize) {
        assert!(self.len + n <= self.buf.len(), "append overruns capacity");
        self.len += n;
    }

    /// Removes the first `n` bytes of the valid region, sliding the remainder to the front.
    pub fn drain(&mut self, n: usize) {
        assert!(n <= self.len, "drain past valid region");
        self.buf.copy_within(n..self.len, 0);
        self.len -= n;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn append_and_drain_compacts() {
        let mut rb = RingBuffer::with_capacity(16);
        rb.writable()[..5].copy_from_slice(b"hello");
        rb.append(5);
        assert_eq!(rb.filled(), b"hello");
        rb.drain(2);
        assert_eq!(rb.filled(), b"llo");
        assert_eq!(rb.free(), 13);
    }

    #[test]
    fn drain_to_empty_resets_to_front() {
        let mut rb = RingBuffer::with_capacity(8);
        rb.writable()[..4].copy_from_slice(b"abcd");
        rb.append(4);
        rb.drain(4);
        assert!(rb.is_empty());
        assert_eq!(rb.free(), 8);
        rb.writable()[..3].copy_from_slice(b"xyz");
        rb.append(3);
        assert_eq!(rb.filled(), b"xyz");
    }

    #[test]
    #[should_panic]
    fn append_past_capacity_panics() {
        let mut rb = RingBuffer::with_capacity(4);
        rb.append(5);
    }
}
