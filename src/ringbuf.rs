use std::io::{self, Read};

/// Fixed size byte ring used to frame newline terminated records out of a
/// nonblocking pipe.
#[derive(Debug)]
pub struct ByteRing {
    buffer: Box<[u8]>,
    start: usize,
    len: usize,
}

impl ByteRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non zero");
        ByteRing {
            buffer: vec![0; capacity].into_boxed_slice(),
            start: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.len = 0;
    }

    /// Largest contiguous free region after the buffered bytes.
    fn free_region(&mut self) -> &mut [u8] {
        let cap = self.buffer.len();
        let end = (self.start + self.len) % cap;
        let stop = if end >= self.start && self.len < cap {
            cap
        } else {
            self.start
        };
        &mut self.buffer[end..stop]
    }

    /// One read into the free space. Returns the number of bytes read, with
    /// zero meaning end of file (or a full ring).
    pub fn fill_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        if self.is_full() {
            return Ok(0);
        }
        let n = reader.read(self.free_region())?;
        self.len += n;
        Ok(n)
    }

    /// Append bytes, returning how many fit.
    pub fn push(&mut self, mut bytes: &[u8]) -> usize {
        let mut written = 0;
        while !bytes.is_empty() && !self.is_full() {
            let region = self.free_region();
            let n = region.len().min(bytes.len());
            region[..n].copy_from_slice(&bytes[..n]);
            self.len += n;
            written += n;
            bytes = &bytes[n..];
        }
        written
    }

    fn byte_at(&self, offset: usize) -> u8 {
        self.buffer[(self.start + offset) % self.buffer.len()]
    }

    /// Move the next complete line, without its newline, into `line`.
    /// Returns false and leaves the ring untouched when no newline is
    /// buffered yet.
    pub fn next_line(&mut self, line: &mut Vec<u8>) -> bool {
        let Some(nl) = (0..self.len).find(|&i| self.byte_at(i) == b'\n') else {
            return false;
        };
        line.clear();
        let cap = self.buffer.len();
        let first = nl.min(cap - self.start);
        line.extend_from_slice(&self.buffer[self.start..self.start + first]);
        line.extend_from_slice(&self.buffer[..nl - first]);

        self.start = (self.start + nl + 1) % cap;
        self.len -= nl + 1;
        if self.len == 0 {
            self.start = 0;
        }
        true
    }
}
