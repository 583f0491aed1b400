//! Error types for the shipindex pipeline.

use thiserror::Error;

/// Errors that can occur anywhere between the state-history socket and the index store.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Malformed frame or unexpected message. Fatal to the connection.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No ABI for '{account}' at block {block_num}")]
    AbiNotFound { account: String, block_num: u32 },

    #[error("Failed to load ABI for '{account}': {reason}")]
    AbiLoad { account: String, reason: String },

    /// The version predates every retained version of a full account.
    #[error("ABI for '{account}' at block {block_num} is older than the {retention} retained versions")]
    AbiNotRetained { account: String, block_num: u32, retention: usize },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Header decode failed at block {block_num}: {reason}")]
    HeaderDecode { block_num: u32, reason: String },

    #[error("Transform '{module}' failed: {reason}")]
    Transform { module: String, reason: String },

    #[error("Fork detected at block {block_num}, common ancestor {common_ancestor}")]
    ForkDetected { block_num: u32, common_ancestor: u32 },

    #[error("Queue '{queue}' is full")]
    QueueFull { queue: String },

    #[error("Index write failed for '{id}': {reason}")]
    IndexWrite { id: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Indexer aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if the error is a fork signal rather than a failure.
    pub fn is_fork(&self) -> bool {
        matches!(self, Self::ForkDetected { .. })
    }

    /// Returns `true` if retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_)
                | Self::Transport(_)
                | Self::QueueFull { .. }
                | Self::IndexWrite { .. }
                | Self::Storage(_)
                | Self::HeaderDecode { .. }
        )
    }

    /// Returns `true` if the error only affects a single record.
    pub fn is_record_scoped(&self) -> bool {
        matches!(
            self,
            Self::AbiNotFound { .. } | Self::AbiLoad { .. } | Self::Codec(_) | Self::Transform { .. }
        )
    }
}
