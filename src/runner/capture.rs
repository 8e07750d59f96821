//! Bounded output capture.

/// Collects a stream up to a fixed number of bytes.
///
/// Bytes past the limit are discarded, but the stream keeps being consumed so
/// the child never blocks on a full pipe.
#[derive(Debug)]
pub struct CaptureBuffer {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CaptureBuffer {
    /// Creates an empty buffer holding at most `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::with_capacity(limit.min(64 * 1024)),
            limit,
            truncated: false,
        }
    }

    /// Appends a chunk, dropping whatever does not fit.
    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.data.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    /// Returns the bytes kept so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Consumes the buffer, returning the kept bytes and the truncation flag.
    pub fn into_parts(self) -> (Vec<u8>, bool) {
        (self.data, self.truncated)
    }
}
