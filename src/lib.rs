//! # Meridian query tier
//!
//! Distributed query execution core for the Meridian clustered time-series
//! database: stateless query nodes fan a search out to every storage shard,
//! merge the partial results into globally correct series while tolerating
//! individual shard failures, and bound memory by spilling intermediate
//! blocks to disk.
//!
//! ## Modules
//!
//! - [`wire`]: length-prefixed framing primitives shared by both protocol
//!   sides
//! - [`tmpstore`]: temporary block store with transparent spill to disk
//! - [`client`]: per-node connection pool and rpc client
//! - [`cluster`]: scatter/gather coordinator and the streaming merge driver
//! - [`merge`]: k-way heap merge and sample deduplication
//! - [`server`]: storage-node rpc server delegating to an abstract
//!   [`server::SearchApi`]
//!
//! ## Overview
//!
//! ```rust,no_run
//! use meridian::{Config, Deadline, SearchQuery, StorageCluster, TagFilter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cfg = Config::from_file("meridian.toml")?;
//!     let cluster = StorageCluster::connect(&cfg)?;
//!
//!     let sq = SearchQuery {
//!         min_timestamp: 0,
//!         max_timestamp: 60_000,
//!         tag_filter_sets: vec![vec![TagFilter {
//!             key: "__name__".into(),
//!             value: "http_requests_total".into(),
//!             ..Default::default()
//!         }]],
//!         ..Default::default()
//!     };
//!     let deadline = Deadline::from_secs(30, "search.max_query_duration");
//!
//!     let (results, is_partial) = cluster.search(&sq, deadline).await?;
//!     println!("found {} series (partial: {})", results.len(), is_partial);
//!     results.run_parallel(|rs, _worker_id| {
//!         println!("{}: {} samples", rs.metric_name, rs.timestamps.len());
//!         Ok::<_, meridian::ClusterError>(())
//!     })?;
//!
//!     cluster.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod cluster;
pub mod config;
pub mod deadline;
pub mod merge;
pub mod model;
pub mod server;
pub mod tmpstore;
pub mod tracer;
pub mod wire;

// Re-export top-level types for convenience
pub use client::{ClientError, StorageNode};
pub use cluster::{ClusterError, QueryResult, Results, StorageCluster};
pub use config::{Config, ConfigError};
pub use deadline::Deadline;
pub use merge::{deduplicate_samples, SortBlock};
pub use model::{
    Block, LabelEntry, MetricBlock, MetricRow, SearchQuery, TagFilter, TimeRange, TopEntry,
    TsdbStatus,
};
pub use server::{ApiError, BlockIterator, SearchApi, Server, ServerLimits};
pub use tmpstore::{TmpBlockAddr, TmpBlockStore};
pub use tracer::Tracer;
