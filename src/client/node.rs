//! Per-storage-node RPC execution.
//!
//! A [`StorageNode`] owns the connection pool and the concurrency budget for
//! one storage shard and exposes one method per rpc. Every call writes the
//! common header (rpc name, trace bit, relative timeout), runs the
//! call-specific exchange, then reads the trailing trace frame. Error
//! classification decides the fate of the connection: remote errors return
//! it to the pool, everything else closes it.
//!
//! All call sites get one automatic retry for transient local errors, except
//! bulk search, which is retried only when zero blocks were consumed by the
//! first attempt.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::timeout_at;

use crate::client::error::{ClientError, ClientResult};
use crate::client::pool::{ConnPool, Connection};
use crate::deadline::Deadline;
use crate::model::{MetricBlock, MetricRow, TimeRange, TopEntry, TsdbStatus};
use crate::wire::{
    self, MAX_ERROR_MESSAGE_SIZE, MAX_LABEL_VALUE_SIZE, MAX_METRIC_BLOCK_FRAME_SIZE,
    MAX_METRIC_BLOCK_SIZE, MAX_METRIC_NAME_SIZE, MAX_TRACE_SIZE,
};

/// Extra slack on top of the request deadline so the node can frame its own
/// timeout error instead of the connection being cut mid-response.
const CONN_DEADLINE_GRACE: Duration = Duration::from_secs(2);

type Stream = tokio::io::BufStream<TcpStream>;

type OpFuture<'c, T> = Pin<Box<dyn Future<Output = ClientResult<T>> + Send + 'c>>;

/// Request/error counters for one rpc.
#[derive(Debug, Default)]
pub struct OpStats {
    pub requests: AtomicU64,
    pub errors: AtomicU64,
}

impl OpStats {
    fn request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counters kept per storage node.
#[derive(Debug, Default)]
pub struct NodeMetrics {
    pub register_metric_names: OpStats,
    pub delete_series: OpStats,
    pub label_names: OpStats,
    pub label_values: OpStats,
    pub tag_value_suffixes: OpStats,
    pub tsdb_status: OpStats,
    pub series_count: OpStats,
    pub search_metric_names: OpStats,
    pub search: OpStats,
    pub metric_blocks_read: AtomicU64,
    pub metric_rows_read: AtomicU64,
}

/// Client-side state for one storage node; lives for the process lifetime.
pub struct StorageNode {
    pool: ConnPool,
    concurrency: Arc<Semaphore>,
    concurrency_limit: usize,
    trace_rpc: bool,
    pub metrics: NodeMetrics,
}

impl StorageNode {
    pub fn new(
        addr: String,
        dial_timeout: Duration,
        max_concurrent_requests: usize,
        want_compression: bool,
        trace_rpc: bool,
    ) -> Self {
        Self {
            pool: ConnPool::new(addr, dial_timeout, want_compression),
            concurrency: Arc::new(Semaphore::new(max_concurrent_requests)),
            concurrency_limit: max_concurrent_requests,
            trace_rpc,
            metrics: NodeMetrics::default(),
        }
    }

    pub fn addr(&self) -> &str {
        self.pool.addr()
    }

    /// Closes the idle connections; in-flight requests finish on their own.
    pub async fn stop(&self) {
        self.pool.stop().await;
    }

    pub async fn register_metric_names(
        &self,
        rows: Arc<Vec<MetricRow>>,
        deadline: Deadline,
    ) -> ClientResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.exec_with_retry(
            &self.metrics.register_metric_names,
            "registerMetricNames_v1",
            deadline,
            move |conn: &mut Connection| -> OpFuture<'_, ()> {
                let rows = Arc::clone(&rows);
                Box::pin(async move {
                    let s = &mut conn.stream;
                    wire::write_u64(s, rows.len() as u64).await?;
                    for row in rows.iter() {
                        wire::write_bytes(s, &row.metric_name_raw).await?;
                        wire::write_u64(s, row.timestamp as u64).await?;
                    }
                    s.flush().await?;
                    read_error_sentinel(s).await
                })
            },
        )
        .await
    }

    pub async fn delete_series(
        &self,
        request_data: Arc<Vec<u8>>,
        deadline: Deadline,
    ) -> ClientResult<u64> {
        self.exec_with_retry(
            &self.metrics.delete_series,
            "deleteSeries_v1",
            deadline,
            move |conn: &mut Connection| -> OpFuture<'_, u64> {
                let request_data = Arc::clone(&request_data);
                Box::pin(async move {
                    let s = &mut conn.stream;
                    wire::write_bytes(s, &request_data).await?;
                    s.flush().await?;
                    read_error_sentinel(s).await?;
                    wire::read_u64(s).await.map_err(Into::into)
                })
            },
        )
        .await
    }

    pub async fn get_label_names(
        &self,
        request_data: Arc<Vec<u8>>,
        max_label_names: u32,
        deadline: Deadline,
    ) -> ClientResult<Vec<String>> {
        self.exec_with_retry(
            &self.metrics.label_names,
            "labelNames_v1",
            deadline,
            move |conn: &mut Connection| -> OpFuture<'_, Vec<String>> {
                let request_data = Arc::clone(&request_data);
                Box::pin(async move {
                    let s = &mut conn.stream;
                    wire::write_bytes(s, &request_data).await?;
                    wire::write_u32(s, max_label_names).await?;
                    s.flush().await?;
                    read_error_sentinel(s).await?;
                    read_string_stream(s, MAX_LABEL_VALUE_SIZE).await
                })
            },
        )
        .await
    }

    pub async fn get_label_values(
        &self,
        label_name: String,
        request_data: Arc<Vec<u8>>,
        max_label_values: u32,
        deadline: Deadline,
    ) -> ClientResult<Vec<String>> {
        self.exec_with_retry(
            &self.metrics.label_values,
            "labelValues_v1",
            deadline,
            move |conn: &mut Connection| -> OpFuture<'_, Vec<String>> {
                let label_name = label_name.clone();
                let request_data = Arc::clone(&request_data);
                Box::pin(async move {
                    let s = &mut conn.stream;
                    wire::write_string(s, &label_name).await?;
                    wire::write_bytes(s, &request_data).await?;
                    wire::write_u32(s, max_label_values).await?;
                    s.flush().await?;
                    read_error_sentinel(s).await?;
                    read_string_stream(s, MAX_LABEL_VALUE_SIZE).await
                })
            },
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn get_tag_value_suffixes(
        &self,
        account_id: u32,
        project_id: u32,
        tr: TimeRange,
        tag_key: String,
        tag_value_prefix: String,
        delimiter: u8,
        max_suffixes: u32,
        deadline: Deadline,
    ) -> ClientResult<Vec<String>> {
        self.exec_with_retry(
            &self.metrics.tag_value_suffixes,
            "tagValueSuffixes_v1",
            deadline,
            move |conn: &mut Connection| -> OpFuture<'_, Vec<String>> {
                let tag_key = tag_key.clone();
                let tag_value_prefix = tag_value_prefix.clone();
                Box::pin(async move {
                    let s = &mut conn.stream;
                    wire::write_u32(s, account_id).await?;
                    wire::write_u32(s, project_id).await?;
                    wire::write_u64(s, tr.min_timestamp as u64).await?;
                    wire::write_u64(s, tr.max_timestamp as u64).await?;
                    wire::write_string(s, &tag_key).await?;
                    wire::write_string(s, &tag_value_prefix).await?;
                    wire::write_byte(s, delimiter).await?;
                    wire::write_u32(s, max_suffixes).await?;
                    s.flush().await?;
                    read_error_sentinel(s).await?;
                    // Suffixes may legitimately be empty, so the stream is
                    // count-prefixed instead of sentinel-terminated.
                    let count = wire::read_u64(s).await?;
                    let mut suffixes = Vec::with_capacity(count.min(1024) as usize);
                    for _ in 0..count {
                        suffixes.push(wire::read_string(s, MAX_LABEL_VALUE_SIZE).await?);
                    }
                    Ok(suffixes)
                })
            },
        )
        .await
    }

    pub async fn get_tsdb_status(
        &self,
        request_data: Arc<Vec<u8>>,
        focus_label: String,
        top_n: u32,
        deadline: Deadline,
    ) -> ClientResult<TsdbStatus> {
        self.exec_with_retry(
            &self.metrics.tsdb_status,
            "tsdbStatus_v1",
            deadline,
            move |conn: &mut Connection| -> OpFuture<'_, TsdbStatus> {
                let request_data = Arc::clone(&request_data);
                let focus_label = focus_label.clone();
                Box::pin(async move {
                    let s = &mut conn.stream;
                    wire::write_bytes(s, &request_data).await?;
                    wire::write_string(s, &focus_label).await?;
                    wire::write_u32(s, top_n).await?;
                    s.flush().await?;
                    read_error_sentinel(s).await?;
                    read_tsdb_status(s).await
                })
            },
        )
        .await
    }

    pub async fn get_series_count(
        &self,
        account_id: u32,
        project_id: u32,
        deadline: Deadline,
    ) -> ClientResult<u64> {
        self.exec_with_retry(
            &self.metrics.series_count,
            "seriesCount_v1",
            deadline,
            move |conn: &mut Connection| -> OpFuture<'_, u64> {
                Box::pin(async move {
                    let s = &mut conn.stream;
                    wire::write_u32(s, account_id).await?;
                    wire::write_u32(s, project_id).await?;
                    s.flush().await?;
                    read_error_sentinel(s).await?;
                    wire::read_u64(s).await.map_err(Into::into)
                })
            },
        )
        .await
    }

    pub async fn search_metric_names(
        &self,
        request_data: Arc<Vec<u8>>,
        deadline: Deadline,
    ) -> ClientResult<Vec<String>> {
        self.exec_with_retry(
            &self.metrics.search_metric_names,
            "searchMetricNames_v1",
            deadline,
            move |conn: &mut Connection| -> OpFuture<'_, Vec<String>> {
                let request_data = Arc::clone(&request_data);
                Box::pin(async move {
                    let s = &mut conn.stream;
                    wire::write_bytes(s, &request_data).await?;
                    s.flush().await?;
                    read_error_sentinel(s).await?;
                    read_string_stream(s, MAX_METRIC_NAME_SIZE).await
                })
            },
        )
        .await
    }

    /// Streams all matching metric blocks from this node into `on_block`.
    ///
    /// The retry policy differs from the other rpcs: a failed attempt is
    /// repeated only when zero blocks were consumed, since blocks already
    /// handed to `on_block` cannot be taken back.
    pub async fn process_search(
        &self,
        request_data: &[u8],
        deadline: Deadline,
        on_block: &mut (dyn FnMut(MetricBlock) -> ClientResult<()> + Send),
    ) -> ClientResult<()> {
        self.metrics.search.request();
        let mut blocks_read = 0usize;
        let first = self
            .search_attempt(request_data, deadline, &mut blocks_read, on_block)
            .await;
        let err = match first {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if blocks_read > 0 || !err.should_retry() || deadline.exceeded() {
            self.metrics.search.error();
            return Err(err);
        }
        tracing::debug!(
            addr = %self.addr(),
            error = %err,
            "retrying search rpc after transient error"
        );
        let res = self
            .search_attempt(request_data, deadline, &mut blocks_read, on_block)
            .await;
        if res.is_err() {
            self.metrics.search.error();
        }
        res
    }

    async fn search_attempt(
        &self,
        request_data: &[u8],
        deadline: Deadline,
        blocks_read: &mut usize,
        on_block: &mut (dyn FnMut(MetricBlock) -> ClientResult<()> + Send),
    ) -> ClientResult<()> {
        let _permit = self.acquire_slot()?;
        let mut conn = self.get_conn(deadline).await?;

        let res = timeout_at(
            (deadline.instant() + CONN_DEADLINE_GRACE).into(),
            async {
                self.write_header(&mut conn, "search_v1", deadline).await?;
                let compression = conn.compression;
                let s = &mut conn.stream;
                wire::write_bytes(s, request_data).await?;
                s.flush().await?;
                read_error_sentinel(s).await?;

                let mut frame_buf;
                loop {
                    frame_buf = wire::read_bytes(s, MAX_METRIC_BLOCK_FRAME_SIZE).await?;
                    if frame_buf.is_empty() {
                        break;
                    }
                    let payload = if compression {
                        decompress_block_frame(&frame_buf)?
                    } else {
                        frame_buf
                    };
                    let mb = MetricBlock::unmarshal(&payload)?;
                    *blocks_read += 1;
                    self.metrics.metric_blocks_read.fetch_add(1, Ordering::Relaxed);
                    self.metrics
                        .metric_rows_read
                        .fetch_add(mb.block.row_count() as u64, Ordering::Relaxed);
                    on_block(mb)?;
                }
                self.read_trace(&mut conn).await?;
                Ok::<(), ClientError>(())
            },
        )
        .await;

        match res {
            Ok(Ok(())) => {
                self.pool.put(conn).await;
                Ok(())
            }
            Ok(Err(e)) => {
                if e.is_remote() {
                    // The server framed the failure; drain the trace so the
                    // connection can be reused.
                    if self.read_trace(&mut conn).await.is_ok() {
                        self.pool.put(conn).await;
                    }
                }
                Err(e)
            }
            Err(_) => Err(self.deadline_error("search_v1", deadline)),
        }
    }

    /// Runs `op` on a pooled connection with the common header/trace
    /// protocol, retrying once on transient local errors.
    async fn exec_with_retry<T, F>(
        &self,
        stats: &OpStats,
        rpc_name: &str,
        deadline: Deadline,
        mut op: F,
    ) -> ClientResult<T>
    where
        F: for<'c> FnMut(&'c mut Connection) -> OpFuture<'c, T> + Send,
    {
        stats.request();
        match self.exec_on_conn(rpc_name, deadline, &mut op).await {
            Ok(v) => Ok(v),
            Err(err) => {
                if !err.should_retry() || deadline.exceeded() {
                    stats.error();
                    return Err(err);
                }
                tracing::debug!(
                    addr = %self.addr(),
                    rpc = rpc_name,
                    error = %err,
                    "retrying rpc after transient error"
                );
                let res = self.exec_on_conn(rpc_name, deadline, &mut op).await;
                if res.is_err() {
                    stats.error();
                }
                res
            }
        }
    }

    async fn exec_on_conn<T, F>(
        &self,
        rpc_name: &str,
        deadline: Deadline,
        op: &mut F,
    ) -> ClientResult<T>
    where
        F: for<'c> FnMut(&'c mut Connection) -> OpFuture<'c, T> + Send,
    {
        let _permit = self.acquire_slot()?;
        let mut conn = self.get_conn(deadline).await?;

        let res = timeout_at(
            (deadline.instant() + CONN_DEADLINE_GRACE).into(),
            async {
                self.write_header(&mut conn, rpc_name, deadline).await?;
                let out = op(&mut conn).await?;
                self.read_trace(&mut conn).await?;
                Ok::<T, ClientError>(out)
            },
        )
        .await;

        match res {
            Ok(Ok(v)) => {
                self.pool.put(conn).await;
                Ok(v)
            }
            Ok(Err(e)) => {
                if e.is_remote() && self.read_trace(&mut conn).await.is_ok() {
                    self.pool.put(conn).await;
                }
                Err(e)
            }
            Err(_) => Err(self.deadline_error(rpc_name, deadline)),
        }
    }

    /// Takes a concurrency slot, failing immediately when the cap is
    /// exhausted. Queuing here would let one slow node absorb the whole
    /// query tier.
    fn acquire_slot(&self) -> ClientResult<tokio::sync::OwnedSemaphorePermit> {
        Arc::clone(&self.concurrency).try_acquire_owned().map_err(|_| {
            ClientError::TooManyConcurrentRequests {
                addr: self.addr().to_string(),
                limit: self.concurrency_limit,
            }
        })
    }

    async fn get_conn(&self, deadline: Deadline) -> ClientResult<Connection> {
        if deadline.exceeded() {
            return Err(ClientError::DeadlineExceeded(deadline.to_string()));
        }
        self.pool.get().await
    }

    async fn write_header(
        &self,
        conn: &mut Connection,
        rpc_name: &str,
        deadline: Deadline,
    ) -> ClientResult<()> {
        let s = &mut conn.stream;
        wire::write_string(s, rpc_name).await?;
        wire::write_bool(s, self.trace_rpc).await?;
        wire::write_u32(s, deadline.remaining_secs()).await?;
        Ok(())
    }

    async fn read_trace(&self, conn: &mut Connection) -> ClientResult<()> {
        let trace = wire::read_bytes(&mut conn.stream, MAX_TRACE_SIZE).await?;
        if !trace.is_empty() {
            tracing::debug!(
                addr = %self.addr(),
                trace = %String::from_utf8_lossy(&trace),
                "storage node query trace"
            );
        }
        Ok(())
    }

    fn deadline_error(&self, rpc_name: &str, deadline: Deadline) -> ClientError {
        ClientError::DeadlineExceeded(format!(
            "cannot execute rpc {} on storage node {} within {}",
            rpc_name,
            self.addr(),
            deadline
        ))
    }
}

impl std::fmt::Debug for StorageNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageNode")
            .field("addr", &self.addr())
            .field("concurrency_limit", &self.concurrency_limit)
            .finish()
    }
}

/// Reads the leading error sentinel of a response: an empty string means
/// success, anything else is the remote failure message.
async fn read_error_sentinel(s: &mut Stream) -> ClientResult<()> {
    let msg = wire::read_bytes(s, MAX_ERROR_MESSAGE_SIZE).await?;
    if msg.is_empty() {
        return Ok(());
    }
    Err(ClientError::Remote(
        String::from_utf8_lossy(&msg).into_owned(),
    ))
}

/// Reads a sentinel-terminated stream of strings.
async fn read_string_stream(s: &mut Stream, max_item_size: usize) -> ClientResult<Vec<String>> {
    let mut items = Vec::new();
    loop {
        let item = wire::read_string(s, max_item_size).await?;
        if item.is_empty() {
            return Ok(items);
        }
        items.push(item);
    }
}

async fn read_top_entries(s: &mut Stream) -> ClientResult<Vec<TopEntry>> {
    let count = wire::read_u64(s).await?;
    let mut entries = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let name = wire::read_string(s, MAX_LABEL_VALUE_SIZE).await?;
        let count = wire::read_u64(s).await?;
        entries.push(TopEntry { name, count });
    }
    Ok(entries)
}

async fn read_tsdb_status(s: &mut Stream) -> ClientResult<TsdbStatus> {
    let total_series = wire::read_u64(s).await?;
    let total_label_value_pairs = wire::read_u64(s).await?;
    Ok(TsdbStatus {
        total_series,
        total_label_value_pairs,
        series_count_by_metric_name: read_top_entries(s).await?,
        series_count_by_label_name: read_top_entries(s).await?,
        series_count_by_focus_label_value: read_top_entries(s).await?,
        series_count_by_label_value_pair: read_top_entries(s).await?,
        label_value_count_by_label_name: read_top_entries(s).await?,
    })
}

/// Decompresses one lz4 block frame, enforcing the block size ceiling on the
/// decompressed payload.
fn decompress_block_frame(frame: &[u8]) -> ClientResult<Vec<u8>> {
    let payload = lz4_flex::block::decompress_size_prepended(frame)
        .map_err(|e| crate::wire::WireError::Decompress(e.to_string()))?;
    if payload.len() > MAX_METRIC_BLOCK_SIZE {
        return Err(ClientError::Wire(crate::wire::WireError::TooLarge {
            size: payload.len() as u64,
            max: MAX_METRIC_BLOCK_SIZE,
        }));
    }
    Ok(payload)
}
