//! Temporary block store error types.

use thiserror::Error;

/// Errors that can occur in the temporary block store
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O failure while writing or reading blocks
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The spill file could not be created
    #[error("cannot create spill file in {0}: {1}")]
    Spill(String, #[source] std::io::Error),

    /// A read was attempted before the store was finalized
    #[error("store is not finalized; finalize() must be called before reads")]
    NotFinalized,

    /// A write was attempted after the store was finalized
    #[error("store is finalized; no further writes are allowed")]
    Finalized,

    /// The address points outside the written region
    #[error("invalid block address: offset={offset} size={size} store_len={len}")]
    BadAddr { offset: u64, size: usize, len: u64 },
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;
