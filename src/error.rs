//! Error types for trace scanning, bank caching and playback

/// Error type for player operations
#[derive(thiserror::Error, Debug)]
pub enum PlayerError {
    /// Malformed or undecodable trace data
    #[error("Trace error: {0}")]
    TraceError(String),

    /// Sample store request outside the addressable region
    #[error("Sample range error: block {block} + {len} bytes exceeds the sample region")]
    OutOfRange {
        /// First block of the request
        block: u16,
        /// Requested length in bytes
        len: usize,
    },

    /// Sample payload rejected by the sample store
    #[error("Invalid sample payload at ${address:04X} ({len} bytes)")]
    InvalidPayload {
        /// CPU address of the payload
        address: u16,
        /// Payload length in bytes
        len: usize,
    },

    /// No contiguous slot range could be freed for a block group
    #[error("No evictable slot range for {blocks} blocks")]
    CacheExhausted {
        /// Number of slots requested
        blocks: u16,
    },

    /// Failure reported by the hardware sink
    #[error("Hardware error: {0}")]
    HardwareError(String),

    /// Internal bookkeeping no longer matches the reference trace
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// IO error from filesystem
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for PlayerError {
    fn from(s: String) -> Self {
        PlayerError::Other(s)
    }
}

impl From<&str> for PlayerError {
    fn from(s: &str) -> Self {
        PlayerError::Other(s.to_string())
    }
}

/// Result type for player operations
pub type Result<T> = std::result::Result<T, PlayerError>;
