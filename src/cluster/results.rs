//! Search results: staging, unpacking and parallel consumption.
//!
//! The scatter phase writes blocks into one [`BlockCollector`] per storage
//! node (single writer, no locking); the gather phase turns the collectors
//! into a [`Results`] value that owns the finalized temporary block stores
//! and drains every packed series through a bounded worker pool.
//!
//! `Results` releases its stores exactly once by construction: both
//! [`Results::run_parallel`] and [`Results::cancel`] consume the value, and
//! the stores close when it drops.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::cluster::error::{ClusterError, ClusterResult};
use crate::deadline::Deadline;
use crate::merge::{merge_sort_blocks, SortBlock};
use crate::model::marshal::MarshalError;
use crate::model::{Block, MetricBlock, TimeRange};
use crate::tmpstore::{StoreResult, TmpBlockAddr, TmpBlockStore};

/// One worker is spawned per this many series, capped at the number of CPUs.
const SERIES_PER_WORKER: usize = 32;

/// Series with at most this many staged blocks are unpacked sequentially;
/// larger ones fan out across a second-level worker pool.
const SEQUENTIAL_UNPACK_LIMIT: usize = 1000;

/// Externally visible per-series output of a search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub metric_name: String,
    /// Sorted by `timestamps`.
    pub timestamps: Vec<i64>,
    pub values: Vec<f64>,
}

impl QueryResult {
    fn reset(&mut self) {
        self.metric_name.clear();
        self.timestamps.clear();
        self.values.clear();
    }
}

/// Per-series list of staged block addresses accumulated from all nodes.
#[derive(Debug)]
pub(crate) struct PackedSeries {
    pub metric_name: String,
    pub addrs: Vec<TmpBlockAddr>,
}

/// Stages blocks received from one storage node during the scatter phase.
pub(crate) struct BlockCollector {
    store: TmpBlockStore,
    index: HashMap<String, usize>,
    series: Vec<(String, Vec<TmpBlockAddr>)>,
    buf: Vec<u8>,
}

impl BlockCollector {
    pub(crate) fn new(source_idx: usize, max_inmemory_size: usize, spill_dir: PathBuf) -> Self {
        Self {
            store: TmpBlockStore::new(source_idx, max_inmemory_size, spill_dir),
            index: HashMap::new(),
            series: Vec::new(),
            buf: Vec::new(),
        }
    }

    /// Stages one block and records its address under the block's metric
    /// name, preserving first-seen name order.
    pub(crate) fn register(&mut self, mb: &MetricBlock) -> StoreResult<()> {
        self.buf.clear();
        mb.block.marshal(&mut self.buf);
        let addr = self.store.write_block(&self.buf)?;
        match self.index.get(&mb.metric_name) {
            Some(&i) => self.series[i].1.push(addr),
            None => {
                self.index.insert(mb.metric_name.clone(), self.series.len());
                self.series.push((mb.metric_name.clone(), vec![addr]));
            }
        }
        Ok(())
    }

    pub(crate) fn finalize(mut self) -> StoreResult<(TmpBlockStore, Vec<(String, Vec<TmpBlockAddr>)>)> {
        self.store.finalize()?;
        Ok((self.store, self.series))
    }
}

/// Builds the packed series list from per-node collectors, preserving
/// first-seen ordering of metric names across nodes (collectors must be
/// passed in node order).
pub(crate) fn assemble_results(
    collectors: Vec<BlockCollector>,
    tr: TimeRange,
    deadline: Deadline,
    dedup_interval_ms: i64,
    max_samples_per_series: u64,
) -> StoreResult<Results> {
    let mut stores = Vec::with_capacity(collectors.len());
    let mut packed: Vec<PackedSeries> = Vec::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();
    for collector in collectors {
        let (store, series) = collector.finalize()?;
        stores.push(store);
        for (name, addrs) in series {
            match by_name.get(&name) {
                Some(&i) => packed[i].addrs.extend(addrs),
                None => {
                    by_name.insert(name.clone(), packed.len());
                    packed.push(PackedSeries {
                        metric_name: name,
                        addrs,
                    });
                }
            }
        }
    }
    Ok(Results {
        tr,
        deadline,
        dedup_interval_ms,
        max_samples_per_series,
        stores,
        packed,
    })
}

/// All series matching one search, staged across the temporary block stores.
///
/// Either [`Results::run_parallel`] or [`Results::cancel`] must be called;
/// both consume the value and release the stores.
pub struct Results {
    tr: TimeRange,
    deadline: Deadline,
    dedup_interval_ms: i64,
    max_samples_per_series: u64,
    stores: Vec<TmpBlockStore>,
    packed: Vec<PackedSeries>,
}

impl Results {
    /// Number of series in the result set.
    pub fn len(&self) -> usize {
        self.packed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packed.is_empty()
    }

    /// Abandons the result set and releases the temporary block stores.
    pub fn cancel(self) {
        // Dropping closes and deletes the spill files.
    }

    /// Unpacks and merges every series through a bounded worker pool and
    /// invokes `f` exactly once per non-empty series.
    ///
    /// `f` receives a scratch [`QueryResult`] that is reused between series
    /// and must not be retained, plus the id of the calling worker. The pool
    /// drains remaining work on the first error; that error is returned and
    /// later ones are discarded as redundant.
    pub fn run_parallel<F, E>(mut self, f: F) -> Result<(), E>
    where
        F: Fn(&mut QueryResult, usize) -> Result<(), E> + Send + Sync,
        E: From<ClusterError> + Send,
    {
        let packed = std::mem::take(&mut self.packed);
        if packed.is_empty() {
            return Ok(());
        }

        let ctx = UnpackContext {
            stores: &self.stores,
            tr: self.tr,
            deadline: self.deadline,
            dedup_interval_ms: self.dedup_interval_ms,
            max_samples_per_series: self.max_samples_per_series,
            rows_processed: AtomicU64::new(0),
            rows_skipped: AtomicU64::new(0),
        };

        let workers = (1 + packed.len() / SERIES_PER_WORKER).min(max_workers());
        let outcome = if workers <= 1 || packed.len() == 1 {
            let mut scratch = QueryResult::default();
            let mut res = Ok(());
            for series in &packed {
                res = process_series(&ctx, series, &mut scratch, 0, &f);
                if res.is_err() {
                    break;
                }
            }
            res
        } else {
            let next = AtomicUsize::new(0);
            let must_stop = AtomicBool::new(false);
            let first_err: Mutex<Option<E>> = Mutex::new(None);
            std::thread::scope(|scope| {
                for worker_id in 0..workers {
                    let packed = &packed;
                    let ctx = &ctx;
                    let f = &f;
                    let next = &next;
                    let must_stop = &must_stop;
                    let first_err = &first_err;
                    scope.spawn(move || {
                        let mut scratch = QueryResult::default();
                        loop {
                            let i = next.fetch_add(1, Ordering::Relaxed);
                            if i >= packed.len() {
                                return;
                            }
                            if must_stop.load(Ordering::Relaxed) {
                                // Drain the remaining work without
                                // processing it.
                                continue;
                            }
                            if let Err(e) =
                                process_series(ctx, &packed[i], &mut scratch, worker_id, f)
                            {
                                must_stop.store(true, Ordering::Relaxed);
                                let mut slot = match first_err.lock() {
                                    Ok(slot) => slot,
                                    Err(poisoned) => poisoned.into_inner(),
                                };
                                if slot.is_none() {
                                    *slot = Some(e);
                                }
                            }
                        }
                    });
                }
            });
            let first = match first_err.into_inner() {
                Ok(v) => v,
                Err(poisoned) => poisoned.into_inner(),
            };
            match first {
                Some(e) => Err(e),
                None => Ok(()),
            }
        };

        tracing::debug!(
            series = packed.len(),
            rows = ctx.rows_processed.load(Ordering::Relaxed),
            rows_skipped = ctx.rows_skipped.load(Ordering::Relaxed),
            "finished parallel processing of fetched series"
        );
        outcome
    }
}

struct UnpackContext<'a> {
    stores: &'a [TmpBlockStore],
    tr: TimeRange,
    deadline: Deadline,
    dedup_interval_ms: i64,
    max_samples_per_series: u64,
    rows_processed: AtomicU64,
    rows_skipped: AtomicU64,
}

fn process_series<F, E>(
    ctx: &UnpackContext<'_>,
    series: &PackedSeries,
    scratch: &mut QueryResult,
    worker_id: usize,
    f: &F,
) -> Result<(), E>
where
    F: Fn(&mut QueryResult, usize) -> Result<(), E>,
    E: From<ClusterError>,
{
    if ctx.deadline.exceeded() {
        return Err(ClusterError::DeadlineExceeded(format!(
            "timeout exceeded while processing series {:?}: {}",
            series.metric_name, ctx.deadline
        ))
        .into());
    }
    let blocks = unpack_series(ctx, series)?;
    scratch.reset();
    scratch.metric_name.push_str(&series.metric_name);
    merge_sort_blocks(
        &mut scratch.timestamps,
        &mut scratch.values,
        blocks,
        ctx.dedup_interval_ms,
    );
    ctx.rows_processed
        .fetch_add(scratch.timestamps.len() as u64, Ordering::Relaxed);
    if scratch.timestamps.is_empty() {
        return Ok(());
    }
    f(scratch, worker_id)
}

/// Unpacks all staged blocks of one series, fanning out across threads for
/// very large series.
fn unpack_series(ctx: &UnpackContext<'_>, series: &PackedSeries) -> ClusterResult<Vec<SortBlock>> {
    let addrs = &series.addrs;
    let workers = max_workers();
    let blocks = if addrs.len() <= SEQUENTIAL_UNPACK_LIMIT || workers == 1 {
        let mut blocks = Vec::with_capacity(addrs.len());
        let mut buf = Vec::new();
        for (source, &addr) in addrs.iter().enumerate() {
            blocks.push(unpack_block(ctx, addr, source, &mut buf)?);
        }
        blocks
    } else {
        let workers = workers.min(addrs.len());
        let chunk_size = addrs.len().div_ceil(workers);
        let chunks: Vec<ClusterResult<Vec<SortBlock>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = addrs
                .chunks(chunk_size)
                .enumerate()
                .map(|(chunk_idx, chunk)| {
                    scope.spawn(move || {
                        let mut blocks = Vec::with_capacity(chunk.len());
                        let mut buf = Vec::new();
                        for (i, &addr) in chunk.iter().enumerate() {
                            let source = chunk_idx * chunk_size + i;
                            blocks.push(unpack_block(ctx, addr, source, &mut buf)?);
                        }
                        Ok(blocks)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(r) => r,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        });
        let mut blocks = Vec::with_capacity(addrs.len());
        let mut first_err = None;
        for chunk in chunks {
            match chunk {
                Ok(mut sbs) => blocks.append(&mut sbs),
                Err(e) => {
                    // Return the first error only; the others are likely the
                    // same.
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        blocks
    };

    if ctx.max_samples_per_series > 0 {
        let samples: usize = blocks.iter().map(|sb| sb.timestamps.len()).sum();
        if samples as u64 > ctx.max_samples_per_series {
            return Err(ClusterError::LimitExceeded(format!(
                "cannot process more than {} samples per series; either increase \
                 `search.max_samples_per_series` or reduce the time range of the query",
                ctx.max_samples_per_series
            )));
        }
    }
    Ok(blocks)
}

/// Reads one staged block, decodes it and trims it to the query time range.
fn unpack_block(
    ctx: &UnpackContext<'_>,
    addr: TmpBlockAddr,
    source: usize,
    buf: &mut Vec<u8>,
) -> ClusterResult<SortBlock> {
    ctx.stores[addr.source_idx].read_block_at(addr, buf)?;
    let (block, tail) = Block::unmarshal(buf)?;
    if !tail.is_empty() {
        return Err(ClusterError::Unpack(MarshalError::TrailingData(tail.len())));
    }

    let mut sb = SortBlock {
        timestamps: Vec::with_capacity(block.timestamps.len()),
        values: Vec::with_capacity(block.timestamps.len()),
        next_idx: 0,
        source,
    };
    for (i, &ts) in block.timestamps.iter().enumerate() {
        if ctx.tr.contains(ts) {
            sb.timestamps.push(ts);
            sb.values.push(block.values[i]);
        }
    }
    let skipped = block.row_count() - sb.timestamps.len();
    if skipped > 0 {
        ctx.rows_skipped.fetch_add(skipped as u64, Ordering::Relaxed);
    }
    Ok(sb)
}

fn max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn deadline() -> Deadline {
        Deadline::new(Duration::from_secs(30), "search.max_query_duration")
    }

    fn collect_block(collector: &mut BlockCollector, name: &str, samples: &[(i64, f64)]) {
        let mb = MetricBlock {
            metric_name: name.to_string(),
            block: Block::new(
                samples.iter().map(|&(ts, _)| ts).collect(),
                samples.iter().map(|&(_, v)| v).collect(),
            ),
        };
        collector.register(&mb).unwrap();
    }

    fn build_results(
        collectors: Vec<BlockCollector>,
        tr: TimeRange,
        dedup_interval_ms: i64,
    ) -> Results {
        assemble_results(collectors, tr, deadline(), dedup_interval_ms, 0).unwrap()
    }

    fn drain(results: Results) -> Vec<QueryResult> {
        let out = Mutex::new(Vec::new());
        results
            .run_parallel(|rs, _| -> Result<(), ClusterError> {
                out.lock().unwrap().push(rs.clone());
                Ok(())
            })
            .unwrap();
        let mut v = out.into_inner().unwrap();
        v.sort_by(|a, b| a.metric_name.cmp(&b.metric_name));
        v
    }

    #[test]
    fn test_single_node_single_series() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = BlockCollector::new(0, 1024, dir.path().to_path_buf());
        collect_block(&mut c, "cpu", &[(1, 1.0), (2, 2.0)]);
        collect_block(&mut c, "cpu", &[(3, 3.0)]);

        let results = build_results(vec![c], TimeRange::new(0, 10), 0);
        assert_eq!(results.len(), 1);
        let out = drain(results);
        assert_eq!(out[0].metric_name, "cpu");
        assert_eq!(out[0].timestamps, vec![1, 2, 3]);
        assert_eq!(out[0].values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_merge_across_nodes_with_time_filter() {
        let dir = tempfile::tempdir().unwrap();
        let mut c0 = BlockCollector::new(0, 64, dir.path().to_path_buf());
        let mut c1 = BlockCollector::new(1, 64, dir.path().to_path_buf());
        collect_block(&mut c0, "cpu", &[(1, 1.0), (5, 5.0), (100, 100.0)]);
        collect_block(&mut c1, "cpu", &[(2, 2.0), (6, 6.0)]);
        collect_block(&mut c1, "mem", &[(4, 4.0)]);

        let results = build_results(vec![c0, c1], TimeRange::new(0, 10), 0);
        // First-seen order across nodes: cpu (node 0) before mem (node 1).
        assert_eq!(results.len(), 2);
        let out = drain(results);
        assert_eq!(out[0].metric_name, "cpu");
        // Sample at ts=100 is outside the range and must be skipped.
        assert_eq!(out[0].timestamps, vec![1, 2, 5, 6]);
        assert_eq!(out[1].metric_name, "mem");
        assert_eq!(out[1].timestamps, vec![4]);
    }

    #[test]
    fn test_replicated_nodes_dedup_keeps_last_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut c0 = BlockCollector::new(0, 1024, dir.path().to_path_buf());
        let mut c1 = BlockCollector::new(1, 1024, dir.path().to_path_buf());
        collect_block(&mut c0, "cpu", &[(1000, 1.0), (2000, 2.0)]);
        collect_block(&mut c1, "cpu", &[(1000, 10.0), (2000, 20.0)]);

        let results = build_results(vec![c0, c1], TimeRange::new(0, 10_000), 1000);
        let out = drain(results);
        assert_eq!(out[0].timestamps, vec![1000, 2000]);
        // The replica staged later in merge order wins each bucket.
        assert_eq!(out[0].values, vec![10.0, 20.0]);
    }

    #[test]
    fn test_empty_series_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = BlockCollector::new(0, 1024, dir.path().to_path_buf());
        // All samples fall outside the queried range.
        collect_block(&mut c, "cpu", &[(100, 1.0)]);

        let results = build_results(vec![c], TimeRange::new(0, 10), 0);
        assert_eq!(results.len(), 1);
        let out = drain(results);
        assert!(out.is_empty(), "callback must not run for empty series");
    }

    #[test]
    fn test_run_parallel_many_series_spilled_store() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny threshold forces a spill mid-way.
        let mut c = BlockCollector::new(0, 256, dir.path().to_path_buf());
        for i in 0..200 {
            let name = format!("metric_{i:03}");
            collect_block(&mut c, &name, &[(i, i as f64), (i + 1, (i + 1) as f64)]);
        }
        let results = build_results(vec![c], TimeRange::new(0, 1_000_000), 0);
        assert_eq!(results.len(), 200);
        let out = drain(results);
        assert_eq!(out.len(), 200);
        for (i, rs) in out.iter().enumerate() {
            assert_eq!(rs.metric_name, format!("metric_{i:03}"));
            assert_eq!(rs.timestamps, vec![i as i64, i as i64 + 1]);
        }
    }

    #[test]
    fn test_first_error_stops_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = BlockCollector::new(0, 1024 * 1024, dir.path().to_path_buf());
        for i in 0..100 {
            collect_block(&mut c, &format!("m{i}"), &[(1, 1.0)]);
        }
        let results = build_results(vec![c], TimeRange::new(0, 10), 0);
        let calls = AtomicU64::new(0);
        let err = results
            .run_parallel(|_, _| -> Result<(), ClusterError> {
                calls.fetch_add(1, Ordering::Relaxed);
                Err(ClusterError::LimitExceeded("boom".into()))
            })
            .unwrap_err();
        assert!(matches!(err, ClusterError::LimitExceeded(_)));
        // The pool drained the remaining series instead of processing them.
        assert!(calls.load(Ordering::Relaxed) < 100);
    }

    #[test]
    fn test_max_samples_per_series_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = BlockCollector::new(0, 1024, dir.path().to_path_buf());
        collect_block(&mut c, "cpu", &[(1, 1.0), (2, 2.0), (3, 3.0)]);
        let results =
            assemble_results(vec![c], TimeRange::new(0, 10), deadline(), 0, 2).unwrap();
        let err = results
            .run_parallel(|_, _| -> Result<(), ClusterError> { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, ClusterError::LimitExceeded(_)));
    }

    #[test]
    fn test_parallel_unpack_of_large_series() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = BlockCollector::new(0, 4096, dir.path().to_path_buf());
        // More blocks than the sequential unpack limit, in one series.
        for i in 0..(SEQUENTIAL_UNPACK_LIMIT as i64 + 200) {
            collect_block(&mut c, "big", &[(i, i as f64)]);
        }
        let results = build_results(vec![c], TimeRange::new(0, i64::MAX), 0);
        let out = drain(results);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamps.len(), SEQUENTIAL_UNPACK_LIMIT + 200);
        // Source order is preserved by the chunked fan-out.
        assert!(out[0].timestamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_cancel_releases_stores() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = BlockCollector::new(0, 16, dir.path().to_path_buf());
        collect_block(&mut c, "cpu", &[(1, 1.0), (2, 2.0), (3, 3.0)]);
        let results = build_results(vec![c], TimeRange::new(0, 10), 0);
        results.cancel();
    }
}
