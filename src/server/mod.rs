//! Storage-node RPC server.
//!
//! Accepts connections from query-tier nodes and serves the rpc protocol:
//! one task per connection, requests on a connection processed sequentially,
//! many connections in parallel. Each request is demultiplexed by rpc name,
//! its arguments are read under a short deadline to bound slow clients,
//! execution is delegated to the abstract [`SearchApi`], and the response is
//! framed back with the error-sentinel convention.
//!
//! Application failures are always framed inside the protocol (error
//! sentinel); closing the connection is reserved for transport and protocol
//! violations.

mod api;

pub use api::{ApiError, ApiResult, BlockIterator, SearchApi};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::ServerConfig;
use crate::deadline::Deadline;
use crate::model::marshal::MarshalError;
use crate::model::{MetricRow, SearchQuery, TimeRange, TopEntry, TsdbStatus};
use crate::tracer::Tracer;
use crate::wire::{
    self, server_handshake, WireError, MAX_ERROR_MESSAGE_SIZE, MAX_LABEL_VALUE_SIZE,
    MAX_METRIC_BLOCK_SIZE, MAX_METRIC_NAMES_PER_REQUEST, MAX_METRIC_NAME_RAW_SIZE,
    MAX_RPC_NAME_SIZE, MAX_SEARCH_QUERY_SIZE,
};

/// Substituted for an empty metric name before transmission so a genuine
/// empty name can never collide with the end-of-stream sentinel.
pub const EMPTY_METRIC_NAME_PLACEHOLDER: &str = "__unnamed__";

/// Deadline for reading the arguments of one request. Bounds slow or
/// malicious clients without punishing large valid responses: it never
/// applies while streaming results.
const ARG_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that terminate the current connection
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    #[error("cannot unmarshal request: {0}")]
    Marshal(#[from] MarshalError),

    /// The client took too long to send request arguments
    #[error("cannot read request args within {ARG_READ_TIMEOUT:?}")]
    ArgReadTimeout,

    #[error("unsupported rpc name: {0:?}")]
    UnknownRpc(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The storage engine failed after the success sentinel was already
    /// sent; the failure cannot be framed, so the connection is dropped
    #[error("search failed mid-stream: {0}")]
    MidStream(String),
}

/// Request counters kept by the server.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    pub connections: AtomicU64,
    pub connection_errors: AtomicU64,
    pub register_metric_names_requests: AtomicU64,
    pub delete_series_requests: AtomicU64,
    pub label_names_requests: AtomicU64,
    pub label_values_requests: AtomicU64,
    pub tag_value_suffixes_requests: AtomicU64,
    pub series_count_requests: AtomicU64,
    pub tsdb_status_requests: AtomicU64,
    pub search_metric_names_requests: AtomicU64,
    pub search_requests: AtomicU64,
    pub metric_blocks_sent: AtomicU64,
    pub metric_rows_sent: AtomicU64,
}

fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Caps applied to metadata responses, taken from [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct ServerLimits {
    pub max_label_names: usize,
    pub max_label_values: usize,
    pub max_tag_value_suffixes: usize,
}

impl From<&ServerConfig> for ServerLimits {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            max_label_names: cfg.max_label_names,
            max_label_values: cfg.max_label_values,
            max_tag_value_suffixes: cfg.max_tag_value_suffixes,
        }
    }
}

/// The storage-node side of the rpc protocol.
pub struct Server {
    local_addr: std::net::SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: tokio::task::JoinHandle<()>,
    metrics: Arc<ServerMetrics>,
}

impl Server {
    /// Binds `listen_addr` and starts serving `api`.
    pub async fn bind(
        listen_addr: &str,
        api: Arc<dyn SearchApi>,
        limits: ServerLimits,
        disable_response_compression: bool,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(ServerMetrics::default());
        let accept_metrics = Arc::clone(&metrics);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            api,
            limits,
            disable_response_compression,
            shutdown_rx,
            accept_metrics,
        ));
        tracing::info!(addr = %local_addr, "accepting query tier connections");
        Ok(Self {
            local_addr,
            shutdown_tx,
            accept_task,
            metrics,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Stops accepting connections, interrupts the per-connection tasks and
    /// waits for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.accept_task.await;
        tracing::info!(addr = %self.local_addr, "server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    api: Arc<dyn SearchApi>,
    limits: ServerLimits,
    disable_response_compression: bool,
    mut shutdown_rx: watch::Receiver<bool>,
    metrics: Arc<ServerMetrics>,
) {
    let mut conn_tasks = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "cannot accept connection");
                        continue;
                    }
                };
                inc(&metrics.connections);
                let api = Arc::clone(&api);
                let limits = limits.clone();
                let metrics = Arc::clone(&metrics);
                let shutdown_rx = shutdown_rx.clone();
                conn_tasks.spawn(handle_conn(
                    stream,
                    peer,
                    api,
                    limits,
                    disable_response_compression,
                    shutdown_rx,
                    metrics,
                ));
                // Reap finished connection tasks so the set stays small.
                while conn_tasks.try_join_next().is_some() {}
            }
        }
    }
    conn_tasks.shutdown().await;
}

struct RequestCtx {
    stream: tokio::io::BufStream<TcpStream>,
    /// Negotiated per-connection compression for block frames.
    compression: bool,
    /// Scratch buffer for marshaling blocks.
    buf: Vec<u8>,
}

#[allow(clippy::too_many_arguments)]
async fn handle_conn(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    api: Arc<dyn SearchApi>,
    limits: ServerLimits,
    disable_response_compression: bool,
    mut shutdown_rx: watch::Receiver<bool>,
    metrics: Arc<ServerMetrics>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!(peer = %peer, error = %e, "cannot set TCP_NODELAY");
    }
    let mut stream = tokio::io::BufStream::new(stream);
    let outcome = match server_handshake(&mut stream, !disable_response_compression).await {
        Ok(outcome) => outcome,
        Err(e) => {
            inc(&metrics.connection_errors);
            tracing::error!(peer = %peer, error = %e, "cannot perform handshake");
            return;
        }
    };
    tracing::info!(peer = %peer, compression = outcome.compression, "processing query tier connection");

    let mut ctx = RequestCtx {
        stream,
        compression: outcome.compression,
        buf: Vec::new(),
    };
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            res = process_request(&mut ctx, api.as_ref(), &limits, &metrics) => {
                match res {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        inc(&metrics.connection_errors);
                        tracing::error!(peer = %peer, error = %e, "cannot process request");
                        break;
                    }
                }
            }
        }
    }
    tracing::info!(peer = %peer, "closing query tier connection");
}

/// Serves one request. Returns `Ok(false)` when the client closed the
/// connection cleanly.
async fn process_request(
    ctx: &mut RequestCtx,
    api: &dyn SearchApi,
    limits: &ServerLimits,
    metrics: &ServerMetrics,
) -> Result<bool, ServerError> {
    // No deadline on the rpc name read: idle connections may sit here for a
    // long time between requests.
    let rpc_name = match wire::read_bytes(&mut ctx.stream, MAX_RPC_NAME_SIZE).await {
        Ok(name) => String::from_utf8_lossy(&name).into_owned(),
        Err(WireError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    };
    let trace_enabled = wire::read_bool(&mut ctx.stream).await?;
    let mut tracer = Tracer::new(trace_enabled, &format!("{rpc_name}() at storage node"));

    let timeout_secs =
        with_arg_deadline(async { Ok(wire::read_u32(&mut ctx.stream).await?) }).await?;
    let deadline = Deadline::from_secs(timeout_secs as u64, "search.max_query_duration");

    dispatch(ctx, api, limits, metrics, &rpc_name, &mut tracer, deadline).await?;

    wire::write_string(&mut ctx.stream, &tracer.finish()).await?;
    ctx.stream.flush().await?;
    Ok(true)
}

async fn dispatch(
    ctx: &mut RequestCtx,
    api: &dyn SearchApi,
    limits: &ServerLimits,
    metrics: &ServerMetrics,
    rpc_name: &str,
    tracer: &mut Tracer,
    deadline: Deadline,
) -> Result<(), ServerError> {
    match rpc_name {
        "search_v1" => {
            inc(&metrics.search_requests);
            process_search(ctx, api, metrics, tracer, deadline).await
        }
        "searchMetricNames_v1" => {
            inc(&metrics.search_metric_names_requests);
            process_search_metric_names(ctx, api, tracer, deadline).await
        }
        "labelValues_v1" => {
            inc(&metrics.label_values_requests);
            process_label_values(ctx, api, limits, tracer, deadline).await
        }
        "tagValueSuffixes_v1" => {
            inc(&metrics.tag_value_suffixes_requests);
            process_tag_value_suffixes(ctx, api, limits, tracer, deadline).await
        }
        "labelNames_v1" => {
            inc(&metrics.label_names_requests);
            process_label_names(ctx, api, limits, tracer, deadline).await
        }
        "seriesCount_v1" => {
            inc(&metrics.series_count_requests);
            process_series_count(ctx, api, tracer, deadline).await
        }
        "tsdbStatus_v1" => {
            inc(&metrics.tsdb_status_requests);
            process_tsdb_status(ctx, api, tracer, deadline).await
        }
        "deleteSeries_v1" => {
            inc(&metrics.delete_series_requests);
            process_delete_series(ctx, api, tracer, deadline).await
        }
        "registerMetricNames_v1" => {
            inc(&metrics.register_metric_names_requests);
            process_register_metric_names(ctx, api, tracer, deadline).await
        }
        _ => Err(ServerError::UnknownRpc(rpc_name.to_string())),
    }
}

/// Applies the argument read deadline to `fut`.
async fn with_arg_deadline<T, F>(fut: F) -> Result<T, ServerError>
where
    F: std::future::Future<Output = Result<T, ServerError>>,
{
    match tokio::time::timeout(ARG_READ_TIMEOUT, fut).await {
        Ok(res) => res,
        Err(_) => Err(ServerError::ArgReadTimeout),
    }
}

async fn read_search_query(ctx: &mut RequestCtx) -> Result<SearchQuery, ServerError> {
    let data = wire::read_bytes(&mut ctx.stream, MAX_SEARCH_QUERY_SIZE).await?;
    Ok(SearchQuery::unmarshal(&data)?)
}

async fn read_time_range(ctx: &mut RequestCtx) -> Result<TimeRange, ServerError> {
    let min = wire::read_u64(&mut ctx.stream).await? as i64;
    let max = wire::read_u64(&mut ctx.stream).await? as i64;
    Ok(TimeRange::new(min, max))
}

/// Clamps a client-supplied limit into the server's configured cap.
fn clamp_limit(requested: u32, max: usize) -> usize {
    if requested == 0 || requested as usize > max {
        max
    } else {
        requested as usize
    }
}

/// Frames an application failure inside the protocol; the connection stays
/// healthy.
async fn write_error_message(ctx: &mut RequestCtx, err: ApiError) -> Result<(), ServerError> {
    let mut msg = err.to_string();
    if msg.len() > MAX_ERROR_MESSAGE_SIZE {
        let mut end = MAX_ERROR_MESSAGE_SIZE;
        while !msg.is_char_boundary(end) {
            end -= 1;
        }
        msg.truncate(end);
    }
    wire::write_string(&mut ctx.stream, &msg).await?;
    Ok(())
}

async fn write_ok_sentinel(ctx: &mut RequestCtx) -> Result<(), ServerError> {
    wire::write_string(&mut ctx.stream, "").await?;
    Ok(())
}

async fn process_register_metric_names(
    ctx: &mut RequestCtx,
    api: &dyn SearchApi,
    tracer: &mut Tracer,
    deadline: Deadline,
) -> Result<(), ServerError> {
    let rows = with_arg_deadline(async {
        let count = wire::read_u64(&mut ctx.stream).await?;
        if count > MAX_METRIC_NAMES_PER_REQUEST {
            return Err(ServerError::Protocol(format!(
                "too many metric names in one request: {count}; max {MAX_METRIC_NAMES_PER_REQUEST}"
            )));
        }
        let mut rows = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            let metric_name_raw =
                wire::read_bytes(&mut ctx.stream, MAX_METRIC_NAME_RAW_SIZE).await?;
            let timestamp = wire::read_u64(&mut ctx.stream).await? as i64;
            rows.push(MetricRow {
                metric_name_raw,
                timestamp,
            });
        }
        Ok(rows)
    })
    .await?;

    match api.register_metric_names(tracer, rows, deadline).await {
        Ok(()) => write_ok_sentinel(ctx).await,
        Err(e) => write_error_message(ctx, e).await,
    }
}

async fn process_delete_series(
    ctx: &mut RequestCtx,
    api: &dyn SearchApi,
    tracer: &mut Tracer,
    deadline: Deadline,
) -> Result<(), ServerError> {
    let sq = with_arg_deadline(read_search_query(ctx)).await?;
    match api.delete_metrics(tracer, &sq, deadline).await {
        Ok(deleted) => {
            write_ok_sentinel(ctx).await?;
            wire::write_u64(&mut ctx.stream, deleted).await?;
            Ok(())
        }
        Err(e) => write_error_message(ctx, e).await,
    }
}

async fn process_label_names(
    ctx: &mut RequestCtx,
    api: &dyn SearchApi,
    limits: &ServerLimits,
    tracer: &mut Tracer,
    deadline: Deadline,
) -> Result<(), ServerError> {
    let (sq, max_names) = with_arg_deadline(async {
        let sq = read_search_query(ctx).await?;
        let max_names = wire::read_u32(&mut ctx.stream).await?;
        Ok((sq, max_names))
    })
    .await?;
    let max_names = clamp_limit(max_names, limits.max_label_names);

    match api.label_names(tracer, &sq, max_names, deadline).await {
        Ok(names) => {
            tracer.record(format!("found {} label names", names.len()));
            write_ok_sentinel(ctx).await?;
            for name in names {
                wire::write_string(&mut ctx.stream, &name).await?;
            }
            // End-of-stream sentinel.
            wire::write_string(&mut ctx.stream, "").await?;
            Ok(())
        }
        Err(e) => write_error_message(ctx, e).await,
    }
}

async fn process_label_values(
    ctx: &mut RequestCtx,
    api: &dyn SearchApi,
    limits: &ServerLimits,
    tracer: &mut Tracer,
    deadline: Deadline,
) -> Result<(), ServerError> {
    let (label_name, sq, max_values) = with_arg_deadline(async {
        let label_name = wire::read_string(&mut ctx.stream, MAX_LABEL_VALUE_SIZE).await?;
        let sq = read_search_query(ctx).await?;
        let max_values = wire::read_u32(&mut ctx.stream).await?;
        Ok((label_name, sq, max_values))
    })
    .await?;
    let max_values = clamp_limit(max_values, limits.max_label_values);

    match api
        .label_values(tracer, &sq, &label_name, max_values, deadline)
        .await
    {
        Ok(values) => {
            tracer.record(format!("found {} label values", values.len()));
            write_ok_sentinel(ctx).await?;
            for value in values {
                // An empty value would collide with the end-of-stream
                // sentinel; it also carries no information, so skip it.
                if value.is_empty() {
                    continue;
                }
                wire::write_string(&mut ctx.stream, &value).await?;
            }
            wire::write_string(&mut ctx.stream, "").await?;
            Ok(())
        }
        Err(e) => write_error_message(ctx, e).await,
    }
}

async fn process_tag_value_suffixes(
    ctx: &mut RequestCtx,
    api: &dyn SearchApi,
    limits: &ServerLimits,
    tracer: &mut Tracer,
    deadline: Deadline,
) -> Result<(), ServerError> {
    let (account_id, project_id, tr, tag_key, tag_value_prefix, delimiter, max_suffixes) =
        with_arg_deadline(async {
            let account_id = wire::read_u32(&mut ctx.stream).await?;
            let project_id = wire::read_u32(&mut ctx.stream).await?;
            let tr = read_time_range(ctx).await?;
            let tag_key = wire::read_string(&mut ctx.stream, MAX_LABEL_VALUE_SIZE).await?;
            let tag_value_prefix =
                wire::read_string(&mut ctx.stream, MAX_LABEL_VALUE_SIZE).await?;
            let delimiter = wire::read_byte(&mut ctx.stream).await?;
            let max_suffixes = wire::read_u32(&mut ctx.stream).await?;
            Ok((
                account_id,
                project_id,
                tr,
                tag_key,
                tag_value_prefix,
                delimiter,
                max_suffixes,
            ))
        })
        .await?;
    let max_suffixes = clamp_limit(max_suffixes, limits.max_tag_value_suffixes);

    let suffixes = match api
        .tag_value_suffixes(
            tracer,
            account_id,
            project_id,
            tr,
            &tag_key,
            &tag_value_prefix,
            delimiter,
            max_suffixes,
            deadline,
        )
        .await
    {
        Ok(suffixes) => suffixes,
        Err(e) => return write_error_message(ctx, e).await,
    };
    if suffixes.len() >= limits.max_tag_value_suffixes {
        return write_error_message(
            ctx,
            ApiError::Internal(format!(
                "more than {} tag value suffixes found for tagKey={:?} tagValuePrefix={:?} \
                 on time range {}; either narrow down the query or increase the \
                 `server.max_tag_value_suffixes` limit",
                limits.max_tag_value_suffixes, tag_key, tag_value_prefix, tr
            )),
        )
        .await;
    }

    write_ok_sentinel(ctx).await?;
    // Suffixes may contain empty strings, so the stream is count-prefixed.
    wire::write_u64(&mut ctx.stream, suffixes.len() as u64).await?;
    for suffix in suffixes {
        wire::write_string(&mut ctx.stream, &suffix).await?;
    }
    Ok(())
}

async fn process_series_count(
    ctx: &mut RequestCtx,
    api: &dyn SearchApi,
    tracer: &mut Tracer,
    deadline: Deadline,
) -> Result<(), ServerError> {
    let (account_id, project_id) = with_arg_deadline(async {
        let account_id = wire::read_u32(&mut ctx.stream).await?;
        let project_id = wire::read_u32(&mut ctx.stream).await?;
        Ok((account_id, project_id))
    })
    .await?;

    match api
        .series_count(tracer, account_id, project_id, deadline)
        .await
    {
        Ok(count) => {
            write_ok_sentinel(ctx).await?;
            wire::write_u64(&mut ctx.stream, count).await?;
            Ok(())
        }
        Err(e) => write_error_message(ctx, e).await,
    }
}

async fn process_tsdb_status(
    ctx: &mut RequestCtx,
    api: &dyn SearchApi,
    tracer: &mut Tracer,
    deadline: Deadline,
) -> Result<(), ServerError> {
    let (sq, focus_label, top_n) = with_arg_deadline(async {
        let sq = read_search_query(ctx).await?;
        let focus_label = wire::read_string(&mut ctx.stream, MAX_LABEL_VALUE_SIZE).await?;
        let top_n = wire::read_u32(&mut ctx.stream).await?;
        Ok((sq, focus_label, top_n))
    })
    .await?;

    match api
        .tsdb_status(tracer, &sq, &focus_label, top_n as usize, deadline)
        .await
    {
        Ok(status) => {
            write_ok_sentinel(ctx).await?;
            write_tsdb_status(ctx, &status).await
        }
        Err(e) => write_error_message(ctx, e).await,
    }
}

async fn write_tsdb_status(ctx: &mut RequestCtx, status: &TsdbStatus) -> Result<(), ServerError> {
    wire::write_u64(&mut ctx.stream, status.total_series).await?;
    wire::write_u64(&mut ctx.stream, status.total_label_value_pairs).await?;
    write_top_entries(ctx, &status.series_count_by_metric_name).await?;
    write_top_entries(ctx, &status.series_count_by_label_name).await?;
    write_top_entries(ctx, &status.series_count_by_focus_label_value).await?;
    write_top_entries(ctx, &status.series_count_by_label_value_pair).await?;
    write_top_entries(ctx, &status.label_value_count_by_label_name).await?;
    Ok(())
}

async fn write_top_entries(ctx: &mut RequestCtx, entries: &[TopEntry]) -> Result<(), ServerError> {
    wire::write_u64(&mut ctx.stream, entries.len() as u64).await?;
    for entry in entries {
        wire::write_string(&mut ctx.stream, &entry.name).await?;
        wire::write_u64(&mut ctx.stream, entry.count).await?;
    }
    Ok(())
}

async fn process_search_metric_names(
    ctx: &mut RequestCtx,
    api: &dyn SearchApi,
    tracer: &mut Tracer,
    deadline: Deadline,
) -> Result<(), ServerError> {
    let sq = with_arg_deadline(read_search_query(ctx)).await?;

    match api.search_metric_names(tracer, &sq, deadline).await {
        Ok(names) => {
            tracer.record(format!("found {} metric names", names.len()));
            write_ok_sentinel(ctx).await?;
            for name in names {
                let name = if name.is_empty() {
                    EMPTY_METRIC_NAME_PLACEHOLDER
                } else {
                    name.as_str()
                };
                wire::write_string(&mut ctx.stream, name).await?;
            }
            wire::write_string(&mut ctx.stream, "").await?;
            Ok(())
        }
        Err(e) => write_error_message(ctx, e).await,
    }
}

async fn process_search(
    ctx: &mut RequestCtx,
    api: &dyn SearchApi,
    metrics: &ServerMetrics,
    tracer: &mut Tracer,
    deadline: Deadline,
) -> Result<(), ServerError> {
    let sq = with_arg_deadline(read_search_query(ctx)).await?;

    let mut iter = match api.init_search(tracer, &sq, deadline).await {
        Ok(iter) => iter,
        Err(e) => return write_error_message(ctx, e).await,
    };
    write_ok_sentinel(ctx).await?;

    let mut blocks_sent = 0u64;
    loop {
        let mut mb = match iter.next_block() {
            Ok(Some(mb)) => mb,
            Ok(None) => break,
            // The success sentinel is already on the wire, so this failure
            // cannot be framed; drop the connection instead.
            Err(e) => return Err(ServerError::MidStream(e.to_string())),
        };
        if mb.metric_name.is_empty() {
            mb.metric_name = EMPTY_METRIC_NAME_PLACEHOLDER.to_string();
        }
        ctx.buf.clear();
        mb.marshal(&mut ctx.buf);
        if ctx.buf.len() > MAX_METRIC_BLOCK_SIZE {
            return Err(ServerError::Protocol(format!(
                "metric block of {} bytes exceeds the {} byte ceiling",
                ctx.buf.len(),
                MAX_METRIC_BLOCK_SIZE
            )));
        }
        if ctx.compression {
            let compressed = lz4_flex::block::compress_prepend_size(&ctx.buf);
            wire::write_bytes(&mut ctx.stream, &compressed).await?;
        } else {
            wire::write_bytes(&mut ctx.stream, &ctx.buf).await?;
        }
        blocks_sent += 1;
        inc(&metrics.metric_blocks_sent);
        metrics
            .metric_rows_sent
            .fetch_add(mb.block.row_count() as u64, Ordering::Relaxed);
    }
    tracer.record(format!("sent {blocks_sent} blocks"));

    // End-of-stream marker; never compressed, so it stays distinguishable.
    wire::write_string(&mut ctx.stream, "").await?;
    Ok(())
}
