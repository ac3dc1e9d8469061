//! Wire protocol error types.

use thiserror::Error;

/// Errors that can occur while framing or parsing protocol data
#[derive(Error, Debug)]
pub enum WireError {
    /// I/O failure on the underlying connection
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A length prefix exceeded the ceiling for its field
    #[error("too big data size: {size}; it must not exceed {max} bytes")]
    TooLarge { size: u64, max: usize },

    /// A fixed-size or framed value ended before its declared length
    #[error("truncated data: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    /// The peer sent an unknown handshake magic
    #[error("invalid handshake magic: {0:?}")]
    BadHandshake(Vec<u8>),

    /// A compressed frame failed to decompress
    #[error("cannot decompress block frame: {0}")]
    Decompress(String),
}

/// Result type alias for wire operations
pub type WireResult<T> = Result<T, WireError>;
