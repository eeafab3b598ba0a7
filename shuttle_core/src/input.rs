use std::io::{self, Read};

/// A reusable byte buffer with a hard capacity.
///
/// One byte of the capacity is always kept free for the terminator that
/// C-string based engines expect, so at most `capacity - 1` bytes of payload
/// are ever stored. The buffer is owned by a single front end and lent out by
/// `&mut` for the duration of one execution.
#[derive(Debug, Clone)]
pub struct FixedBuffer {
    bytes: Vec<u8>,
    capacity: usize,
}

impl FixedBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest payload the buffer accepts.
    pub fn payload_limit(&self) -> usize {
        self.capacity.saturating_sub(1)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Clamps a declared length to what the buffer can hold.
    pub fn clamp(&self, declared: u64) -> usize {
        usize::try_from(declared)
            .unwrap_or(usize::MAX)
            .min(self.payload_limit())
    }

    /// Returns whether `extra` more bytes fit without touching the terminator slot.
    pub fn fits(&self, extra: usize) -> bool {
        self.bytes
            .len()
            .checked_add(extra)
            .is_some_and(|total| total < self.capacity)
    }

    /// Appends `data` if it fits, otherwise leaves the buffer untouched.
    pub fn try_extend(&mut self, data: &[u8]) -> bool {
        if !self.fits(data.len()) {
            return false;
        }
        self.bytes.extend_from_slice(data);
        true
    }

    /// Clears the buffer and exposes `len` zeroed bytes to be filled in place.
    /// `len` is clamped to the payload limit.
    pub fn prepare(&mut self, len: usize) -> &mut [u8] {
        let len = len.min(self.payload_limit());
        self.bytes.clear();
        self.bytes.resize(len, 0);
        &mut self.bytes
    }

    /// Replaces the contents with everything `reader` yields until end of
    /// stream, silently bounded to the payload limit.
    pub fn fill_from_reader<R: Read>(&mut self, reader: R) -> io::Result<usize> {
        self.bytes.clear();
        let limit = self.payload_limit() as u64;
        reader.take(limit).read_to_end(&mut self.bytes)
    }
}
