//! Process-local staging buffer.
//!
//! Commands accumulate here between flushes; the buffer is unshared, so
//! no synchronization or barriers apply until the batch is handed to the
//! escape gateway. Sized to hold thousands of typical records so a frame
//! rarely forces more than a handful of submissions.

/// Default capacity. Large enough that a frame's worth of state churn
/// rarely forces a mid-frame submission.
pub const STAGING_CAPACITY: usize = 256 * 1024;

pub struct StagingBuffer {
    buf: Vec<u8>,
    capacity: usize,
}

impl StagingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn fits(&self, record_len: usize) -> bool {
        self.buf.len() + record_len <= self.capacity
    }

    /// Append a record. The caller has already established that it fits
    /// and that the record carries its own 16-byte tail padding.
    pub fn push(&mut self, record: &[u8]) {
        debug_assert!(record.len() % 16 == 0);
        debug_assert!(self.fits(record.len()));
        self.buf.extend_from_slice(record);
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
