use crate::error::{DmxError, Result};
use crate::utils::{ring_distance, wrap_add};
use log::debug;

/// Error latched on a ring buffer until the consumer acknowledges it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchedError {
    /// Producer data did not fit and was dropped
    Overflow,
    /// A section deadline expired before any section arrived
    Timeout,
    /// The event queue was full and events describing buffered data were lost
    EventOverflow,
}

impl From<LatchedError> for DmxError {
    fn from(err: LatchedError) -> Self {
        match err {
            LatchedError::Overflow => DmxError::BufferOverflow,
            LatchedError::Timeout => DmxError::Timeout,
            LatchedError::EventOverflow => DmxError::EventOverflow,
        }
    }
}

impl LatchedError {
    /// The latched form of `err`, if it is one a ring can hold.
    pub fn from_error(err: &DmxError) -> Option<Self> {
        match err {
            DmxError::BufferOverflow => Some(LatchedError::Overflow),
            DmxError::Timeout => Some(LatchedError::Timeout),
            DmxError::EventOverflow => Some(LatchedError::EventOverflow),
            _ => None,
        }
    }
}

/// Fixed-capacity byte ring with separate read and write cursors.
///
/// One slot is always kept free so that a full ring can be told apart from an
/// empty one: `available() + free() == capacity() - 1`. Storage is optional;
/// a ring without storage accepts no data and reads as empty, which is how a
/// torn-down or not-yet-started output looks to its waiters.
#[derive(Debug)]
pub struct RingBuffer {
    data: Option<Vec<u8>>,
    size: usize,
    pread: usize,
    pwrite: usize,
    error: Option<LatchedError>,
}

impl RingBuffer {
    /// Creates a ring with freshly allocated storage.
    pub fn new(size: usize) -> Self {
        Self::with_storage(vec![0; size])
    }

    /// Creates a ring that uses caller-provided storage.
    pub fn with_storage(storage: Vec<u8>) -> Self {
        Self {
            size: storage.len(),
            data: Some(storage),
            pread: 0,
            pwrite: 0,
            error: None,
        }
    }

    /// Creates a ring of the given nominal size without storage.
    pub fn detached(size: usize) -> Self {
        Self {
            data: None,
            size,
            pread: 0,
            pwrite: 0,
            error: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn has_storage(&self) -> bool {
        self.data.is_some()
    }

    pub fn read_offset(&self) -> usize {
        self.pread
    }

    pub fn write_offset(&self) -> usize {
        self.pwrite
    }

    /// Bytes written and not yet consumed.
    pub fn available(&self) -> usize {
        ring_distance(self.pread, self.pwrite, self.size)
    }

    /// Bytes that can be written without overflowing.
    pub fn free(&self) -> usize {
        self.size.saturating_sub(self.available() + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.pread == self.pwrite
    }

    /// Appends `bytes` in full or not at all.
    ///
    /// # Errors
    ///
    /// Returns the latched error if one is pending, or
    /// [`DmxError::BufferOverflow`] if `bytes` exceeds [`free`](Self::free).
    /// In both cases the cursors are left untouched. A ring without storage
    /// silently accepts nothing and returns `Ok(0)`.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        if bytes.is_empty() {
            return Ok(0);
        }
        if let Some(err) = self.error {
            return Err(err.into());
        }

        let free = self.free();
        let Some(data) = self.data.as_mut() else {
            return Ok(0);
        };
        if bytes.len() > free {
            debug!("ring overflow: {} bytes offered, {} free", bytes.len(), free);
            return Err(DmxError::BufferOverflow);
        }

        let len = bytes.len();
        let first = len.min(self.size - self.pwrite);
        data[self.pwrite..self.pwrite + first].copy_from_slice(&bytes[..first]);
        data[..len - first].copy_from_slice(&bytes[first..]);
        self.pwrite = wrap_add(self.pwrite, len, self.size);
        Ok(len)
    }

    /// Copies up to `dest.len()` bytes out and consumes them.
    pub fn read(&mut self, dest: &mut [u8]) -> usize {
        let n = self.copy_out(dest);
        self.pread = wrap_add(self.pread, n, self.size);
        n
    }

    /// Copies up to `len` pending bytes without consuming them.
    pub fn peek(&self, len: usize) -> Vec<u8> {
        let mut out = vec![0; len.min(self.available())];
        let n = self.copy_out(&mut out);
        out.truncate(n);
        out
    }

    fn copy_out(&self, dest: &mut [u8]) -> usize {
        let Some(data) = self.data.as_ref() else {
            return 0;
        };
        let n = dest.len().min(self.available());
        if n == 0 {
            return 0;
        }

        let first = n.min(self.size - self.pread);
        dest[..first].copy_from_slice(&data[self.pread..self.pread + first]);
        dest[first..n].copy_from_slice(&data[..n - first]);
        n
    }

    /// Drops up to `n` pending bytes.
    pub fn skip(&mut self, n: usize) {
        let n = n.min(self.available());
        self.pread = wrap_add(self.pread, n, self.size);
    }

    /// Drops every pending byte and clears the latched error.
    pub fn flush(&mut self) {
        self.pread = self.pwrite;
        self.error = None;
    }

    /// Rewinds both cursors to zero and clears the latched error.
    pub fn reset(&mut self) {
        self.pread = 0;
        self.pwrite = 0;
        self.error = None;
    }

    /// Latches `err` unless another error is already pending.
    pub fn latch(&mut self, err: LatchedError) {
        self.error.get_or_insert(err);
    }

    pub fn error(&self) -> Option<LatchedError> {
        self.error
    }

    /// Returns and clears the latched error.
    pub fn take_error(&mut self) -> Option<LatchedError> {
        self.error.take()
    }

    /// Swaps in new storage of `size` bytes and resets the cursors.
    ///
    /// Resetting rather than flushing keeps the cursors valid when the ring
    /// shrinks. Returns the previous storage.
    pub fn replace_storage(&mut self, storage: Option<Vec<u8>>, size: usize) -> Option<Vec<u8>> {
        let old = std::mem::replace(&mut self.data, storage);
        self.size = size;
        self.reset();
        old
    }

    /// Removes the storage, leaving cursors and size as they were.
    pub fn detach(&mut self) -> Option<Vec<u8>> {
        self.data.take()
    }
}
