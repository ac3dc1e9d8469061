//! Abstract storage API the RPC server delegates to.
//!
//! The on-disk storage engine lives outside this crate; the server only
//! needs the operations below. Implementations must respect the passed
//! [`Deadline`] and may record annotations on the [`Tracer`].

use async_trait::async_trait;
use thiserror::Error;

use crate::deadline::Deadline;
use crate::model::{MetricBlock, MetricRow, SearchQuery, TimeRange, TsdbStatus};
use crate::tracer::Tracer;

/// Errors reported by the storage engine
#[derive(Error, Debug)]
pub enum ApiError {
    /// The request deadline expired inside the storage engine
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Any other storage failure; the message is framed back to the client
    #[error("{0}")]
    Internal(String),
}

/// Result type alias for storage API calls
pub type ApiResult<T> = Result<T, ApiError>;

/// Iterates over the metric blocks matching a search.
///
/// Blocks must keep their timestamps sorted and must marshal within the
/// metric block size ceiling ([`crate::wire::MAX_METRIC_BLOCK_SIZE`]).
/// Dropping the iterator releases any underlying search resources.
pub trait BlockIterator: Send {
    /// Returns the next block, or `None` when the search is exhausted.
    fn next_block(&mut self) -> ApiResult<Option<MetricBlock>>;
}

/// Storage engine operations needed by the RPC server.
#[async_trait]
pub trait SearchApi: Send + Sync + 'static {
    /// Starts a search and returns an iterator over matching blocks.
    async fn init_search(
        &self,
        tracer: &mut Tracer,
        sq: &SearchQuery,
        deadline: Deadline,
    ) -> ApiResult<Box<dyn BlockIterator>>;

    /// Returns metric names matching `sq`.
    async fn search_metric_names(
        &self,
        tracer: &mut Tracer,
        sq: &SearchQuery,
        deadline: Deadline,
    ) -> ApiResult<Vec<String>>;

    /// Returns label names for series matching `sq`, up to `max_names`.
    async fn label_names(
        &self,
        tracer: &mut Tracer,
        sq: &SearchQuery,
        max_names: usize,
        deadline: Deadline,
    ) -> ApiResult<Vec<String>>;

    /// Returns values of `label_name` for series matching `sq`, up to
    /// `max_values`.
    async fn label_values(
        &self,
        tracer: &mut Tracer,
        sq: &SearchQuery,
        label_name: &str,
        max_values: usize,
        deadline: Deadline,
    ) -> ApiResult<Vec<String>>;

    /// Returns suffixes of tag values starting with `tag_value_prefix` up to
    /// the next `delimiter` byte.
    #[allow(clippy::too_many_arguments)]
    async fn tag_value_suffixes(
        &self,
        tracer: &mut Tracer,
        account_id: u32,
        project_id: u32,
        tr: TimeRange,
        tag_key: &str,
        tag_value_prefix: &str,
        delimiter: u8,
        max_suffixes: usize,
        deadline: Deadline,
    ) -> ApiResult<Vec<String>>;

    /// Returns the number of unique series for the tenant.
    async fn series_count(
        &self,
        tracer: &mut Tracer,
        account_id: u32,
        project_id: u32,
        deadline: Deadline,
    ) -> ApiResult<u64>;

    /// Returns cardinality statistics for series matching `sq`.
    async fn tsdb_status(
        &self,
        tracer: &mut Tracer,
        sq: &SearchQuery,
        focus_label: &str,
        top_n: usize,
        deadline: Deadline,
    ) -> ApiResult<TsdbStatus>;

    /// Deletes series matching `sq`; returns the number of deleted series.
    async fn delete_metrics(
        &self,
        tracer: &mut Tracer,
        sq: &SearchQuery,
        deadline: Deadline,
    ) -> ApiResult<u64>;

    /// Registers metric names ahead of ingestion.
    async fn register_metric_names(
        &self,
        tracer: &mut Tracer,
        rows: Vec<MetricRow>,
        deadline: Deadline,
    ) -> ApiResult<()>;
}
