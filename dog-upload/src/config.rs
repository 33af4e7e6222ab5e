use std::time::Duration;

use crate::{UploadError, UploadResult};

/// Configuration for chunked upload sessions
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Chunk size clients are told to slice files into
    pub chunk_size: u64,

    /// Absolute max declared file size (safety guard)
    pub max_file_bytes: u64,

    /// Upper bound on chunks per session, protects session record size
    pub max_chunks: u32,

    /// Lease of an open session, renewed on every admitted chunk
    pub session_ttl: Duration,

    /// How long completed and failed sessions stay retrievable
    pub terminal_retention: Duration,

    /// Reaper tick
    pub sweep_interval: Duration,

    /// If true: the transport finalizes as soon as the last chunk lands
    pub auto_finalize: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10 * 1024 * 1024,            // 10MB
            max_file_bytes: 50 * 1024 * 1024 * 1024, // 50GB
            max_chunks: 10_000,
            session_ttl: Duration::from_secs(24 * 60 * 60),
            terminal_retention: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(300),
            auto_finalize: false,
        }
    }
}

impl UploadConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the negotiated chunk size
    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Set max file size
    pub fn with_max_file_bytes(mut self, bytes: u64) -> Self {
        self.max_file_bytes = bytes;
        self
    }

    /// Set max chunks per session
    pub fn with_max_chunks(mut self, max: u32) -> Self {
        self.max_chunks = max;
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_terminal_retention(mut self, retention: Duration) -> Self {
        self.terminal_retention = retention;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Finalize automatically once every chunk has arrived
    pub fn auto_finalize(mut self) -> Self {
        self.auto_finalize = true;
        self
    }

    /// Number of chunks a file of `file_size` bytes splits into
    pub fn chunks_for(&self, file_size: u64) -> UploadResult<u32> {
        if self.chunk_size == 0 {
            return Ok(0);
        }
        u32::try_from(file_size.div_ceil(self.chunk_size)).map_err(|_| {
            UploadError::invalid(format!(
                "File size {} needs more than {} chunks of {} bytes",
                file_size,
                u32::MAX,
                self.chunk_size
            ))
        })
    }

    pub(crate) fn session_ttl_secs(&self) -> i64 {
        self.session_ttl.as_secs() as i64
    }

    pub(crate) fn terminal_retention_secs(&self) -> i64 {
        self.terminal_retention.as_secs() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_rounds_up() {
        let config = UploadConfig::new().with_chunk_size(10);
        assert_eq!(config.chunks_for(25).unwrap(), 3);
        assert_eq!(config.chunks_for(30).unwrap(), 3);
        assert_eq!(config.chunks_for(1).unwrap(), 1);
    }

    #[test]
    fn chunk_count_overflow_is_rejected() {
        let config = UploadConfig::new().with_chunk_size(1);
        assert_eq!(config.chunks_for(u32::MAX as u64).unwrap(), u32::MAX);
        let err = config.chunks_for(u32::MAX as u64 + 1).unwrap_err();
        assert!(matches!(err, UploadError::InvalidRequest { .. }));
    }
}
