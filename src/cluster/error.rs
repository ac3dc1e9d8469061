//! Coordinator error types.

use thiserror::Error;

use crate::client::ClientError;
use crate::model::marshal::MarshalError;
use crate::tmpstore::StoreError;

/// Errors that can occur while coordinating a multi-node operation
#[derive(Error, Debug)]
pub enum ClusterError {
    /// A single storage node failed; carries the node address for context
    #[error("cannot query storage node {addr}: {source}")]
    Node {
        addr: String,
        #[source]
        source: ClientError,
    },

    /// The deadline expired before or during coordination
    #[error("timeout exceeded: {0}")]
    DeadlineExceeded(String),

    /// A query complexity limit was exceeded; never degraded to a partial
    /// result
    #[error("{0}")]
    LimitExceeded(String),

    /// The temporary block store failed
    #[error("temporary block store error: {0}")]
    Store(#[from] StoreError),

    /// A staged block could not be decoded during unpacking
    #[error("cannot unpack staged block: {0}")]
    Unpack(#[from] MarshalError),

    /// The cluster was constructed without storage nodes
    #[error("no storage nodes configured")]
    NoNodes,
}

impl ClusterError {
    /// Errors that must fail the whole operation even when other nodes
    /// succeeded: complexity limits are already blown, so a partial result
    /// would be misleading.
    pub fn is_fatal(&self) -> bool {
        match self {
            ClusterError::LimitExceeded(_) => true,
            ClusterError::Node { source, .. } => matches!(source, ClientError::Aborted(_)),
            _ => false,
        }
    }
}

/// Result type alias for coordinator operations
pub type ClusterResult<T> = Result<T, ClusterError>;
