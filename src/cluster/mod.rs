//! Scatter/gather coordinator.
//!
//! A [`StorageCluster`] holds one [`StorageNode`] client per configured
//! shard, built once at startup and immutable afterwards. Every logical
//! operation serializes its request once, issues one rpc per node in
//! parallel and folds the per-node replies into a single answer.
//!
//! Partial failures are the core contract here: when some but not all nodes
//! fail a read-style operation, the union of the successful replies is
//! returned with the partial flag set and the first error is logged exactly
//! once. Only when every node fails (or a complexity limit trips) does the
//! operation surface an error. Delete and register are stricter: they
//! require every node to succeed.

mod error;
mod results;

pub use error::{ClusterError, ClusterResult};
pub use results::{QueryResult, Results};

use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::client::{ClientError, ClientResult, StorageNode};
use crate::config::{Config, DEFAULT_NODE_PORT};
use crate::deadline::Deadline;
use crate::model::{
    LabelEntry, MetricBlock, MetricRow, SearchQuery, TimeRange, TopEntry, TsdbStatus,
};
use crate::tmpstore::inmemory_threshold;

use results::{assemble_results, BlockCollector};

/// Immutable registry of storage nodes plus the query-tier limits.
pub struct StorageCluster {
    nodes: Vec<Arc<StorageNode>>,
    dedup_interval_ms: i64,
    max_samples_per_query: u64,
    max_samples_per_series: u64,
    tmp_inmemory_threshold: usize,
    spill_dir: PathBuf,
}

impl StorageCluster {
    /// Builds the node registry from the configuration. Connections are
    /// dialed lazily on first use.
    pub fn connect(cfg: &Config) -> ClusterResult<Arc<Self>> {
        if cfg.cluster.storage_nodes.is_empty() {
            return Err(ClusterError::NoNodes);
        }
        let dial_timeout = Duration::from_secs(cfg.cluster.dial_timeout_secs);
        let nodes = cfg
            .cluster
            .storage_nodes
            .iter()
            .map(|addr| {
                Arc::new(StorageNode::new(
                    normalize_node_addr(addr),
                    dial_timeout,
                    cfg.cluster.max_concurrent_requests_per_node,
                    cfg.cluster.compress_responses,
                    cfg.cluster.trace_rpc,
                ))
            })
            .collect::<Vec<_>>();
        tracing::info!(nodes = nodes.len(), "storage cluster initialized");
        Ok(Arc::new(Self {
            nodes,
            dedup_interval_ms: cfg.search.dedup_interval_ms,
            max_samples_per_query: cfg.search.max_samples_per_query,
            max_samples_per_series: cfg.search.max_samples_per_series,
            tmp_inmemory_threshold: inmemory_threshold(cfg.search.memory_limit_bytes),
            spill_dir: cfg
                .search
                .spill_dir
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
        }))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[Arc<StorageNode>] {
        &self.nodes
    }

    /// Closes all connection pools; subsequent operations fail fast.
    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.stop().await;
        }
        tracing::info!("storage cluster stopped");
    }

    /// Returns label names matching `sq`, deduplicated and sorted.
    pub async fn label_names(
        &self,
        sq: &SearchQuery,
        max_label_names: u32,
        deadline: Deadline,
    ) -> ClusterResult<(Vec<String>, bool)> {
        self.check_deadline(deadline)?;
        let request_data = Arc::new(sq.to_bytes());
        let replies = self
            .scatter(move |node, _| {
                let rd = Arc::clone(&request_data);
                async move { node.get_label_names(rd, max_label_names, deadline).await }
            })
            .await;
        let (per_node, is_partial) = collect_partial("labelNames", replies)?;
        let names = dedup_sort_truncate(per_node.into_iter().flatten(), max_label_names as usize);
        Ok((names, is_partial))
    }

    /// Returns values of `label_name` matching `sq`, deduplicated and
    /// sorted.
    pub async fn label_values(
        &self,
        label_name: &str,
        sq: &SearchQuery,
        max_label_values: u32,
        deadline: Deadline,
    ) -> ClusterResult<(Vec<String>, bool)> {
        self.check_deadline(deadline)?;
        let request_data = Arc::new(sq.to_bytes());
        let label_name = label_name.to_string();
        let replies = self
            .scatter(move |node, _| {
                let rd = Arc::clone(&request_data);
                let label_name = label_name.clone();
                async move {
                    node.get_label_values(label_name, rd, max_label_values, deadline)
                        .await
                }
            })
            .await;
        let (per_node, is_partial) = collect_partial("labelValues", replies)?;
        let values = dedup_sort_truncate(per_node.into_iter().flatten(), max_label_values as usize);
        Ok((values, is_partial))
    }

    /// Returns every label name with all of its values, for tag-explorer
    /// style listings. Composed from [`Self::label_names`] plus one
    /// [`Self::label_values`] call per name.
    pub async fn label_entries(
        &self,
        sq: &SearchQuery,
        max_label_names: u32,
        max_label_values: u32,
        deadline: Deadline,
    ) -> ClusterResult<(Vec<LabelEntry>, bool)> {
        let (names, mut is_partial) = self.label_names(sq, max_label_names, deadline).await?;
        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let (values, partial) = self
                .label_values(&name, sq, max_label_values, deadline)
                .await?;
            is_partial |= partial;
            entries.push(LabelEntry { name, values });
        }
        Ok((merge_label_entries(entries), is_partial))
    }

    /// Returns suffixes of tag values starting with `tag_value_prefix` up to
    /// the next `delimiter`, unioned across nodes.
    #[allow(clippy::too_many_arguments)]
    pub async fn tag_value_suffixes(
        &self,
        account_id: u32,
        project_id: u32,
        tr: TimeRange,
        tag_key: &str,
        tag_value_prefix: &str,
        delimiter: u8,
        max_suffixes: u32,
        deadline: Deadline,
    ) -> ClusterResult<(Vec<String>, bool)> {
        self.check_deadline(deadline)?;
        let tag_key = tag_key.to_string();
        let tag_value_prefix = tag_value_prefix.to_string();
        let replies = self
            .scatter(move |node, _| {
                let tag_key = tag_key.clone();
                let tag_value_prefix = tag_value_prefix.clone();
                async move {
                    node.get_tag_value_suffixes(
                        account_id,
                        project_id,
                        tr,
                        tag_key,
                        tag_value_prefix,
                        delimiter,
                        max_suffixes,
                        deadline,
                    )
                    .await
                }
            })
            .await;
        let (per_node, is_partial) = collect_partial("tagValueSuffixes", replies)?;
        let suffixes = dedup_sort_truncate(per_node.into_iter().flatten(), 0);
        Ok((suffixes, is_partial))
    }

    /// Returns the number of unique series, summed across nodes.
    pub async fn series_count(
        &self,
        account_id: u32,
        project_id: u32,
        deadline: Deadline,
    ) -> ClusterResult<(u64, bool)> {
        self.check_deadline(deadline)?;
        let replies = self
            .scatter(move |node, _| async move {
                node.get_series_count(account_id, project_id, deadline).await
            })
            .await;
        let (counts, is_partial) = collect_partial("seriesCount", replies)?;
        Ok((counts.into_iter().sum(), is_partial))
    }

    /// Returns merged cardinality statistics, re-truncated to `top_n`.
    pub async fn tsdb_status(
        &self,
        sq: &SearchQuery,
        focus_label: &str,
        top_n: u32,
        deadline: Deadline,
    ) -> ClusterResult<(TsdbStatus, bool)> {
        self.check_deadline(deadline)?;
        let request_data = Arc::new(sq.to_bytes());
        let focus_label = focus_label.to_string();
        let replies = self
            .scatter(move |node, _| {
                let rd = Arc::clone(&request_data);
                let focus_label = focus_label.clone();
                async move { node.get_tsdb_status(rd, focus_label, top_n, deadline).await }
            })
            .await;
        let (statuses, is_partial) = collect_partial("tsdbStatus", replies)?;
        Ok((merge_tsdb_statuses(statuses, top_n as usize), is_partial))
    }

    /// Returns metric names matching `sq`, unioned across nodes and sorted.
    pub async fn search_metric_names(
        &self,
        sq: &SearchQuery,
        deadline: Deadline,
    ) -> ClusterResult<(Vec<String>, bool)> {
        self.check_deadline(deadline)?;
        let request_data = Arc::new(sq.to_bytes());
        let replies = self
            .scatter(move |node, _| {
                let rd = Arc::clone(&request_data);
                async move { node.search_metric_names(rd, deadline).await }
            })
            .await;
        let (per_node, is_partial) = collect_partial("searchMetricNames", replies)?;
        let names = dedup_sort_truncate(per_node.into_iter().flatten(), 0);
        Ok((names, is_partial))
    }

    /// Deletes series matching `sq` on every node; all nodes must succeed.
    /// Returns the total number of deleted series.
    pub async fn delete_series(&self, sq: &SearchQuery, deadline: Deadline) -> ClusterResult<u64> {
        self.check_deadline(deadline)?;
        let request_data = Arc::new(sq.to_bytes());
        let replies = self
            .scatter(move |node, _| {
                let rd = Arc::clone(&request_data);
                async move { node.delete_series(rd, deadline).await }
            })
            .await;
        let counts = collect_all(replies)?;
        Ok(counts.into_iter().sum())
    }

    /// Registers metric names ahead of ingestion, splitting the rows across
    /// nodes by name hash; all nodes must succeed.
    pub async fn register_metric_names(
        &self,
        rows: Vec<MetricRow>,
        deadline: Deadline,
    ) -> ClusterResult<()> {
        self.check_deadline(deadline)?;
        let n = self.nodes.len();
        let mut per_node: Vec<Vec<MetricRow>> = (0..n).map(|_| Vec::new()).collect();
        for row in rows {
            let idx = if n > 1 {
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                row.metric_name_raw.hash(&mut hasher);
                (hasher.finish() % n as u64) as usize
            } else {
                0
            };
            per_node[idx].push(row);
        }
        let shards: Vec<Arc<Vec<MetricRow>>> = per_node.into_iter().map(Arc::new).collect();
        let replies = self
            .scatter(move |node, idx| {
                let rows = Arc::clone(&shards[idx]);
                async move { node.register_metric_names(rows, deadline).await }
            })
            .await;
        collect_all(replies)?;
        Ok(())
    }

    /// Executes a search: streams matching blocks from every node into
    /// per-node temporary block stores and returns the staged [`Results`].
    ///
    /// Blocks already received from a node that later failed are kept; the
    /// merge handles the overlap and the partial flag reports the
    /// degradation.
    pub async fn search(
        &self,
        sq: &SearchQuery,
        deadline: Deadline,
    ) -> ClusterResult<(Results, bool)> {
        self.check_deadline(deadline)?;
        let tr = sq.time_range();
        let request_data = Arc::new(sq.to_bytes());
        let samples_total = Arc::new(AtomicU64::new(0));
        let max_samples = self.max_samples_per_query;

        let mut set = JoinSet::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            let node = Arc::clone(node);
            let rd = Arc::clone(&request_data);
            let samples_total = Arc::clone(&samples_total);
            let mut collector =
                BlockCollector::new(idx, self.tmp_inmemory_threshold, self.spill_dir.clone());
            set.spawn(async move {
                let mut on_block = |mb: MetricBlock| -> ClientResult<()> {
                    let rows = mb.block.row_count() as u64;
                    // Count every sample of the block, not just the ones
                    // inside the time range: the unpack stage pays for all
                    // of them.
                    let total = samples_total.fetch_add(rows, Ordering::Relaxed) + rows;
                    if max_samples > 0 && total > max_samples {
                        return Err(ClientError::Aborted(format!(
                            "cannot select more than {max_samples} samples per query; \
                             increase `search.max_samples_per_query`, reduce the time range \
                             or use more specific tag filters"
                        )));
                    }
                    collector.register(&mb).map_err(ClientError::from)
                };
                let result = node.process_search(&rd, deadline, &mut on_block).await;
                (idx, node.addr().to_string(), collector, result)
            });
        }

        let mut joined = Vec::with_capacity(self.nodes.len());
        while let Some(res) = set.join_next().await {
            match res {
                Ok(item) => joined.push(item),
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => panic!("BUG: search task cancelled unexpectedly"),
            }
        }
        joined.sort_by_key(|(idx, _, _, _)| *idx);

        let mut collectors = Vec::with_capacity(joined.len());
        let mut replies = Vec::with_capacity(joined.len());
        for (idx, addr, collector, result) in joined {
            collectors.push(collector);
            replies.push(NodeReply {
                node_idx: idx,
                addr,
                result,
            });
        }
        let (_, is_partial) = collect_partial("search", replies)?;

        let results = assemble_results(
            collectors,
            tr,
            deadline,
            self.dedup_interval_ms,
            self.max_samples_per_series,
        )?;
        Ok((results, is_partial))
    }

    fn check_deadline(&self, deadline: Deadline) -> ClusterResult<()> {
        if deadline.exceeded() {
            return Err(ClusterError::DeadlineExceeded(format!(
                "timeout exceeded before starting the operation: {deadline}"
            )));
        }
        Ok(())
    }

    /// Runs one future per storage node and collects the replies in node
    /// order. The reply channel is implicit in the join set, which buffers
    /// every result, so no node can block another.
    async fn scatter<T, F, Fut>(&self, make: F) -> Vec<NodeReply<T>>
    where
        F: Fn(Arc<StorageNode>, usize) -> Fut,
        Fut: Future<Output = ClientResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let mut set = JoinSet::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            let addr = node.addr().to_string();
            let fut = make(Arc::clone(node), idx);
            set.spawn(async move {
                NodeReply {
                    node_idx: idx,
                    addr,
                    result: fut.await,
                }
            });
        }
        let mut replies = Vec::with_capacity(self.nodes.len());
        while let Some(res) = set.join_next().await {
            match res {
                Ok(reply) => replies.push(reply),
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => panic!("BUG: scatter task cancelled unexpectedly"),
            }
        }
        replies.sort_by_key(|r| r.node_idx);
        replies
    }
}

impl std::fmt::Debug for StorageCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageCluster")
            .field("nodes", &self.nodes.len())
            .field("dedup_interval_ms", &self.dedup_interval_ms)
            .finish()
    }
}

struct NodeReply<T> {
    node_idx: usize,
    addr: String,
    result: ClientResult<T>,
}

/// Folds per-node replies under the graceful-degradation contract: full
/// success, degraded success with the partial flag, or total failure with
/// the first error. Complexity-limit errors always fail the operation.
fn collect_partial<T>(op: &str, replies: Vec<NodeReply<T>>) -> ClusterResult<(Vec<T>, bool)> {
    let total = replies.len();
    let mut oks = Vec::with_capacity(total);
    let mut first_err: Option<ClusterError> = None;
    let mut failures = 0usize;
    for reply in replies {
        match reply.result {
            Ok(v) => oks.push(v),
            Err(source) => {
                failures += 1;
                let err = ClusterError::Node {
                    addr: reply.addr,
                    source,
                };
                if err.is_fatal() {
                    return Err(err);
                }
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
    }
    match first_err {
        None => Ok((oks, false)),
        Some(err) if failures == total => Err(err),
        Some(err) => {
            // One log line per degraded operation; the remaining errors are
            // assumed correlated.
            tracing::warn!(
                op,
                failed = failures,
                nodes = total,
                error = %err,
                "storage nodes unavailable during the operation; returning partial result"
            );
            Ok((oks, true))
        }
    }
}

/// Strict collection for mutating operations: the first failure wins.
fn collect_all<T>(replies: Vec<NodeReply<T>>) -> ClusterResult<Vec<T>> {
    let mut oks = Vec::with_capacity(replies.len());
    for reply in replies {
        match reply.result {
            Ok(v) => oks.push(v),
            Err(source) => {
                return Err(ClusterError::Node {
                    addr: reply.addr,
                    source,
                })
            }
        }
    }
    Ok(oks)
}

/// Deduplicates via a set, sorts lexically and truncates to `max`
/// (0 = unlimited).
fn dedup_sort_truncate(items: impl Iterator<Item = String>, max: usize) -> Vec<String> {
    let set: std::collections::HashSet<String> = items.collect();
    let mut out: Vec<String> = set.into_iter().collect();
    out.sort_unstable();
    if max > 0 && out.len() > max {
        out.truncate(max);
    }
    out
}

/// Merges per-node statuses: totals and per-name series counts are summed,
/// label-value cardinalities take the maximum (values are replicated
/// verbatim across nodes), and every breakdown is re-truncated to `top_n`.
fn merge_tsdb_statuses(statuses: Vec<TsdbStatus>, top_n: usize) -> TsdbStatus {
    let mut total_series = 0u64;
    let mut total_label_value_pairs = 0u64;
    let mut by_metric_name: HashMap<String, u64> = HashMap::new();
    let mut by_label_name: HashMap<String, u64> = HashMap::new();
    let mut by_focus_label_value: HashMap<String, u64> = HashMap::new();
    let mut by_label_value_pair: HashMap<String, u64> = HashMap::new();
    let mut value_count_by_label_name: HashMap<String, u64> = HashMap::new();

    for st in statuses {
        total_series += st.total_series;
        total_label_value_pairs += st.total_label_value_pairs;
        for e in st.series_count_by_metric_name {
            *by_metric_name.entry(e.name).or_default() += e.count;
        }
        for e in st.series_count_by_label_name {
            *by_label_name.entry(e.name).or_default() += e.count;
        }
        for e in st.series_count_by_focus_label_value {
            *by_focus_label_value.entry(e.name).or_default() += e.count;
        }
        for e in st.series_count_by_label_value_pair {
            *by_label_value_pair.entry(e.name).or_default() += e.count;
        }
        for e in st.label_value_count_by_label_name {
            let slot = value_count_by_label_name.entry(e.name).or_default();
            *slot = (*slot).max(e.count);
        }
    }
    TsdbStatus {
        total_series,
        total_label_value_pairs,
        series_count_by_metric_name: top_entries(by_metric_name, top_n),
        series_count_by_label_name: top_entries(by_label_name, top_n),
        series_count_by_focus_label_value: top_entries(by_focus_label_value, top_n),
        series_count_by_label_value_pair: top_entries(by_label_value_pair, top_n),
        label_value_count_by_label_name: top_entries(value_count_by_label_name, top_n),
    }
}

/// Turns a name→count map into the top-N entries ordered by descending
/// count, name ascending as the tie-break.
fn top_entries(counts: HashMap<String, u64>, top_n: usize) -> Vec<TopEntry> {
    let mut entries: Vec<TopEntry> = counts
        .into_iter()
        .map(|(name, count)| TopEntry { name, count })
        .collect();
    entries.sort_unstable_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    if entries.len() > top_n {
        entries.truncate(top_n);
    }
    entries
}

/// Merges label entries per key: values are deduplicated and sorted, then
/// the entry list is ordered by descending value count, descending name.
fn merge_label_entries(entries: Vec<LabelEntry>) -> Vec<LabelEntry> {
    let mut by_name: HashMap<String, Vec<String>> = HashMap::new();
    for entry in entries {
        by_name.entry(entry.name).or_default().extend(entry.values);
    }
    let mut merged: Vec<LabelEntry> = by_name
        .into_iter()
        .map(|(name, values)| LabelEntry {
            name,
            values: dedup_sort_truncate(values.into_iter(), 0),
        })
        .collect();
    merged.sort_unstable_by(|a, b| {
        b.values
            .len()
            .cmp(&a.values.len())
            .then_with(|| b.name.cmp(&a.name))
    });
    merged
}

/// Appends the default node port to addresses given without one.
fn normalize_node_addr(addr: &str) -> String {
    if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{addr}:{DEFAULT_NODE_PORT}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply<T>(idx: usize, result: ClientResult<T>) -> NodeReply<T> {
        NodeReply {
            node_idx: idx,
            addr: format!("node-{idx}:9401"),
            result,
        }
    }

    fn io_err() -> ClientError {
        ClientError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ))
    }

    #[test]
    fn test_collect_partial_full_success() {
        let replies = vec![reply(0, Ok(1)), reply(1, Ok(2))];
        let (vals, partial) = collect_partial("op", replies).unwrap();
        assert_eq!(vals, vec![1, 2]);
        assert!(!partial);
    }

    #[test]
    fn test_collect_partial_some_failed() {
        let replies = vec![reply(0, Ok(1)), reply(1, Err(io_err())), reply(2, Ok(3))];
        let (vals, partial) = collect_partial("op", replies).unwrap();
        assert_eq!(vals, vec![1, 3]);
        assert!(partial);
    }

    #[test]
    fn test_collect_partial_all_failed_returns_first_error() {
        let replies: Vec<NodeReply<u64>> = vec![
            reply(0, Err(ClientError::Remote("first".into()))),
            reply(1, Err(ClientError::Remote("second".into()))),
        ];
        let err = collect_partial("op", replies).unwrap_err();
        assert!(err.to_string().contains("first"));
        assert!(err.to_string().contains("node-0"));
    }

    #[test]
    fn test_collect_partial_limit_error_is_fatal() {
        let replies: Vec<NodeReply<u64>> = vec![
            reply(0, Ok(1)),
            reply(1, Err(ClientError::Aborted("too many samples".into()))),
        ];
        assert!(collect_partial("op", replies).is_err());
    }

    #[test]
    fn test_collect_all_rejects_any_failure() {
        let replies = vec![reply(0, Ok(1)), reply(1, Err(io_err()))];
        assert!(collect_all(replies).is_err());
        let replies = vec![reply(0, Ok(1)), reply(1, Ok(2))];
        assert_eq!(collect_all(replies).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_dedup_sort_truncate() {
        let items = ["b", "a", "b", "c", "a"].iter().map(|s| s.to_string());
        assert_eq!(dedup_sort_truncate(items.clone(), 0), vec!["a", "b", "c"]);
        assert_eq!(dedup_sort_truncate(items, 2), vec!["a", "b"]);
    }

    #[test]
    fn test_merge_tsdb_statuses_sums_and_maxes() {
        let st = |series: u64, metric_count: u64, value_count: u64| TsdbStatus {
            total_series: series,
            total_label_value_pairs: series * 2,
            series_count_by_metric_name: vec![TopEntry {
                name: "cpu".into(),
                count: metric_count,
            }],
            label_value_count_by_label_name: vec![TopEntry {
                name: "host".into(),
                count: value_count,
            }],
            ..Default::default()
        };
        let merged = merge_tsdb_statuses(vec![st(10, 3, 7), st(5, 4, 9)], 10);
        assert_eq!(merged.total_series, 15);
        assert_eq!(merged.total_label_value_pairs, 30);
        // Per-metric series counts are summed across nodes.
        assert_eq!(merged.series_count_by_metric_name[0].count, 7);
        // Label-value cardinality takes the maximum, since values are
        // replicated verbatim across nodes.
        assert_eq!(merged.label_value_count_by_label_name[0].count, 9);
    }

    #[test]
    fn test_top_entries_order_and_truncation() {
        let mut counts = HashMap::new();
        counts.insert("b".to_string(), 5u64);
        counts.insert("a".to_string(), 5u64);
        counts.insert("z".to_string(), 9u64);
        counts.insert("c".to_string(), 1u64);
        let top = top_entries(counts, 3);
        let names: Vec<&str> = top.iter().map(|e| e.name.as_str()).collect();
        // Descending count, ascending name on ties, truncated to top-N.
        assert_eq!(names, vec!["z", "a", "b"]);
    }

    #[test]
    fn test_merge_label_entries() {
        let entries = vec![
            LabelEntry {
                name: "host".into(),
                values: vec!["b".into(), "a".into()],
            },
            LabelEntry {
                name: "host".into(),
                values: vec!["a".into(), "c".into()],
            },
            LabelEntry {
                name: "zone".into(),
                values: vec!["x".into(), "y".into(), "z".into()],
            },
            LabelEntry {
                name: "app".into(),
                values: vec!["p".into(), "q".into(), "r".into()],
            },
        ];
        let merged = merge_label_entries(entries);
        // Descending value count, then descending name.
        assert_eq!(merged[0].name, "zone");
        assert_eq!(merged[1].name, "host");
        assert_eq!(merged[1].values, vec!["a", "b", "c"]);
        assert_eq!(merged[2].name, "app");
    }

    #[test]
    fn test_normalize_node_addr() {
        assert_eq!(normalize_node_addr("10.0.0.1"), "10.0.0.1:9401");
        assert_eq!(normalize_node_addr("10.0.0.1:9500"), "10.0.0.1:9500");
    }

    #[test]
    fn test_connect_requires_nodes() {
        let cfg = Config::default();
        assert!(matches!(
            StorageCluster::connect(&cfg),
            Err(ClusterError::NoNodes)
        ));
    }
}
