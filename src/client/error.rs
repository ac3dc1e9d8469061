//! RPC client error types.
//!
//! The error taxonomy drives connection reuse and retries: remote errors
//! leave the connection healthy (the server framed the failure inside the
//! protocol), everything else poisons the current connection. A single
//! automatic retry absorbs transient local errors; remote, deadline and
//! abort errors are never retried.

use thiserror::Error;

use crate::model::marshal::MarshalError;
use crate::tmpstore::StoreError;
use crate::wire::WireError;

/// Errors that can occur while executing an rpc against one storage node
#[derive(Error, Debug)]
pub enum ClientError {
    /// The storage node reported an application-level failure; the
    /// connection stays usable
    #[error("remote error: {0}")]
    Remote(String),

    /// Transport-level I/O failure; the connection is discarded
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol framing violation; the connection is discarded
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    /// A payload decoded from the wire is malformed
    #[error("cannot unmarshal payload: {0}")]
    Marshal(#[from] MarshalError),

    /// The request deadline expired before or during the call
    #[error("request deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The per-node concurrency cap is exhausted; fails fast, never queues
    #[error("too many concurrent requests to {addr}: limit of {limit} reached")]
    TooManyConcurrentRequests { addr: String, limit: usize },

    /// The connection pool has been shut down
    #[error("connection pool to {0} is stopped")]
    PoolStopped(String),

    /// The block consumer aborted the call (complexity limit or staging
    /// failure); never retried since blocks were already consumed
    #[error("search aborted: {0}")]
    Aborted(String),

    /// Staging a received block in the temporary block store failed
    #[error("cannot stage block: {0}")]
    Store(#[from] StoreError),
}

impl ClientError {
    /// True when the server reported the failure inside the protocol, which
    /// means the connection is still in a known-good state.
    pub fn is_remote(&self) -> bool {
        matches!(self, ClientError::Remote(_))
    }

    /// True for errors worth one automatic retry on a fresh connection.
    pub fn should_retry(&self) -> bool {
        match self {
            ClientError::Io(_) | ClientError::Wire(_) => true,
            ClientError::Remote(_)
            | ClientError::Marshal(_)
            | ClientError::DeadlineExceeded(_)
            | ClientError::TooManyConcurrentRequests { .. }
            | ClientError::PoolStopped(_)
            | ClientError::Aborted(_)
            | ClientError::Store(_) => false,
        }
    }
}

/// Result type alias for client operations
pub type ClientResult<T> = Result<T, ClientError>;
