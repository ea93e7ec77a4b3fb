//! Ring buffer used by the codec streams.
//!
//! Each [`CodecStream`](crate::codec::CodecStream) owns two of these: one for
//! the raw data side and one for the compressed side. The buffer owns its
//! backing storage and exposes contiguous read/write slices; when the write
//! region becomes fragmented the readable bytes are compacted to the front.

/// A fixed-capacity byte buffer with contiguous read and write regions.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl RingBuffer {
    /// Creates a buffer with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            start: 0,
            end: 0,
        }
    }

    /// Number of readable bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Returns `true` when no bytes are readable.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Total free space (including space recovered by compaction).
    pub fn free(&self) -> usize {
        self.buf.len() - self.len()
    }

    /// The buffer capacity.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// The readable region.
    pub fn readable(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// The writable region, compacting first so it is as large as possible.
    pub fn writable(&mut self) -> &mut [u8] {
        self.compact();
        &mut self.buf[self.end..]
    }

    /// Marks `n` bytes of the writable region as filled.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the writable region returned by the last
    /// [`writable`](Self::writable) call.
    pub fn advance_write(&mut self, n: usize) {
        assert!(self.end + n <= self.buf.len(), "ring buffer overfilled");
        self.end += n;
    }

    /// Marks `n` readable bytes as consumed.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds [`len`](Self::len).
    pub fn advance_read(&mut self, n: usize) {
        assert!(n <= self.len(), "ring buffer overdrained");
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Copies as much of `data` as fits and returns the number of bytes taken.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let dst = self.writable();
        let n = dst.len().min(data.len());
        dst[..n].copy_from_slice(&data[..n]);
        self.advance_write(n);
        n
    }

    /// Copies readable bytes into `out` and returns the number copied.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let src = self.readable();
        let n = src.len().min(out.len());
        out[..n].copy_from_slice(&src[..n]);
        self.advance_read(n);
        n
    }

    /// Discards all content.
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        let len = self.len();
        self.buf.copy_within(self.start..self.end, 0);
        self.start = 0;
        self.end = len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trip() {
        let mut rb = RingBuffer::with_capacity(8);
        assert_eq!(rb.write(b"abcde"), 5);
        assert_eq!(rb.len(), 5);

        let mut out = [0u8; 3];
        assert_eq!(rb.read(&mut out), 3);
        assert_eq!(&out, b"abc");
        assert_eq!(rb.len(), 2);

        let mut rest = [0u8; 8];
        assert_eq!(rb.read(&mut rest), 2);
        assert_eq!(&rest[..2], b"de");
        assert!(rb.is_empty());
    }

    #[test]
    fn compaction_recovers_space() {
        let mut rb = RingBuffer::with_capacity(8);
        rb.write(b"abcdefgh");
        let mut out = [0u8; 6];
        rb.read(&mut out);
        // 6 bytes free but fragmented; writable() must compact.
        assert_eq!(rb.free(), 6);
        assert_eq!(rb.writable().len(), 6);
        assert_eq!(rb.write(b"123456"), 6);
        let mut all = [0u8; 8];
        assert_eq!(rb.read(&mut all), 8);
        assert_eq!(&all, b"gh123456");
    }

    #[test]
    fn write_truncates_at_capacity() {
        let mut rb = RingBuffer::with_capacity(4);
        assert_eq!(rb.write(b"abcdef"), 4);
        assert_eq!(rb.write(b"x"), 0);
    }

    #[test]
    fn clear_resets_offsets() {
        let mut rb = RingBuffer::with_capacity(4);
        rb.write(b"ab");
        rb.clear();
        assert!(rb.is_empty());
        assert_eq!(rb.writable().len(), 4);
    }

    #[test]
    #[should_panic(expected = "overdrained")]
    fn overdrain_panics() {
        let mut rb = RingBuffer::with_capacity(4);
        rb.write(b"ab");
        rb.advance_read(3);
    }
}
