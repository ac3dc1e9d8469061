//! RPC client for storage nodes.
//!
//! One [`StorageNode`] per configured shard address: a connection pool, a
//! bounded concurrency budget and per-operation counters. The scatter/gather
//! coordinator ([`crate::cluster`]) drives these; nothing here knows about
//! multi-node aggregation.

mod error;
mod pool;
mod node;

pub use error::{ClientError, ClientResult};
pub use node::{NodeMetrics, OpStats, StorageNode};
pub use pool::{ConnPool, Connection};
