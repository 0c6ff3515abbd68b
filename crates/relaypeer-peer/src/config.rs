use std::time::Duration;

/// Default bound on every request/response round-trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default stream chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Session tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Bound on blocking requests. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Bytes read from a stream source per chunk. Zero is treated as one.
    pub chunk_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl SessionConfig {
    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the stream chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Chunk size actually used by stream pumps.
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.max(1)
    }
}
