//! Bounded replay buffer for late-joining connections.
//!
//! Keeps the most recent output of the session's process. Its contents are
//! always a contiguous suffix of everything written, oldest bytes dropped
//! first once capacity is reached.

/// Default replay capacity (256 KiB).
pub const DEFAULT_REPLAY_CAPACITY: usize = 256 * 1024;

/// A fixed-capacity circular byte buffer.
#[derive(Debug)]
pub struct ReplayBuffer {
    buf: Box<[u8]>,
    /// Next write position (wraps around).
    head: usize,
    len: usize,
    total_written: u64,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
            total_written: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Append output, evicting the oldest bytes when full.
    pub fn write(&mut self, data: &[u8]) {
        self.total_written += data.len() as u64;
        let cap = self.capacity();
        if cap == 0 {
            return;
        }

        // Only the tail of an oversized chunk can survive.
        let data = if data.len() > cap {
            &data[data.len() - cap..]
        } else {
            data
        };

        let first = data.len().min(cap - self.head);
        self.buf[self.head..self.head + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        self.buf[..rest].copy_from_slice(&data[first..]);

        self.head = (self.head + data.len()) % cap;
        self.len = (self.len + data.len()).min(cap);
    }

    /// Buffered bytes in chronological order.
    pub fn snapshot(&self) -> Vec<u8> {
        let cap = self.capacity();
        let mut out = Vec::with_capacity(self.len);
        if self.len == 0 {
            return out;
        }
        let start = (self.head + cap - self.len) % cap;
        if start + self.len <= cap {
            out.extend_from_slice(&self.buf[start..start + self.len]);
        } else {
            out.extend_from_slice(&self.buf[start..]);
            out.extend_from_slice(&self.buf[..self.head]);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total bytes ever written, including evicted ones.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_write_read() {
        let mut rb = ReplayBuffer::new(10);
        rb.write(b"hello");
        assert_eq!(rb.snapshot(), b"hello");
        assert_eq!(rb.len(), 5);
    }

    #[test]
    fn wrap_keeps_newest_suffix() {
        let mut rb = ReplayBuffer::new(5);
        rb.write(b"abcde");
        rb.write(b"fg");
        assert_eq!(rb.snapshot(), b"cdefg");
        rb.write(b"hij");
        assert_eq!(rb.snapshot(), b"fghij");
        assert_eq!(rb.total_written(), 10);
    }

    #[test]
    fn oversized_chunk_keeps_tail() {
        let mut rb = ReplayBuffer::new(4);
        rb.write(b"x");
        rb.write(b"0123456789");
        assert_eq!(rb.snapshot(), b"6789");
        assert_eq!(rb.len(), 4);
    }

    #[test]
    fn snapshot_matches_suffix_of_stream() {
        let mut rb = ReplayBuffer::new(7);
        let mut stream = Vec::new();
        for i in 0u8..50 {
            let chunk: Vec<u8> = (0..(i % 4)).map(|j| i.wrapping_mul(3).wrapping_add(j)).collect();
            rb.write(&chunk);
            stream.extend_from_slice(&chunk);
            let keep = stream.len().min(7);
            assert_eq!(rb.snapshot(), &stream[stream.len() - keep..]);
        }
    }

    #[test]
    fn zero_capacity() {
        let mut rb = ReplayBuffer::new(0);
        rb.write(b"test");
        assert!(rb.is_empty());
        assert!(rb.snapshot().is_empty());
    }
}
