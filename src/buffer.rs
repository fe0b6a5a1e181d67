//! Fixed-capacity byte ring buffer for one audio direction
//!
//! Each session owns two instances: one for the ingest direction (media
//! engine toward the socket) and one for the emit direction (socket toward
//! the media engine). Capacity is fixed at construction from the batch
//! size in bytes; a full buffer makes the writer wait or drop, never
//! overwrite unread data.
//!
//! # Thread-safety
//!
//! This struct is NOT internally synchronized. Each direction is wrapped in
//! its own `Mutex` by the session record and never shared between
//! directions.

/// Error returned when a ring buffer cannot be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferInitError {
    /// Capacity of zero bytes was requested
    ZeroCapacity,
}

impl std::fmt::Display for BufferInitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferInitError::ZeroCapacity => {
                write!(f, "ring buffer capacity must be greater than zero")
            }
        }
    }
}

impl std::error::Error for BufferInitError {}

/// Bounded FIFO of raw PCM bytes.
#[derive(Debug)]
pub struct RingBuffer {
    data: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    in_use: usize,
}

impl RingBuffer {
    /// Create a buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self, BufferInitError> {
        if capacity == 0 {
            return Err(BufferInitError::ZeroCapacity);
        }
        Ok(Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
            in_use: 0,
        })
    }

    /// Append as many of `bytes` as fit, returning the count written.
    ///
    /// Never exceeds `free_space()`; callers that must not lose data split
    /// the write and retry after space has been freed by a reader.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.free_space());
        for &b in &bytes[..n] {
            self.data[self.write_pos] = b;
            self.write_pos = (self.write_pos + 1) % self.data.len();
        }
        self.in_use += n;
        n
    }

    /// Remove and return up to `max` bytes in FIFO order.
    pub fn read(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.in_use);
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.data[self.read_pos]);
            self.read_pos = (self.read_pos + 1) % self.data.len();
        }
        self.in_use -= n;
        out
    }

    /// Drain the entire buffer contents in FIFO order.
    pub fn drain(&mut self) -> Vec<u8> {
        self.read(self.in_use)
    }

    /// Bytes that can still be written without overwriting unread data.
    pub fn free_space(&self) -> usize {
        self.data.len() - self.in_use
    }

    /// Bytes currently buffered and not yet read.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Total capacity in bytes, fixed at construction.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_use == 0
    }

    pub fn is_full(&self) -> bool {
        self.in_use == self.data.len()
    }

    /// Discard all buffered bytes and rewind both cursors.
    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.in_use = 0;
    }
}
