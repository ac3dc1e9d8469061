//! Streaming k-way merge of per-source sample blocks.
//!
//! Each source contributes a [`SortBlock`]: an unpacked, time-range-filtered
//! run of samples with non-decreasing timestamps. [`merge_sort_blocks`]
//! merges any number of them into one timestamp-ordered series via a binary
//! heap keyed by each block's current head timestamp, then applies
//! deduplication ([`dedup::deduplicate_samples`]).
//!
//! Ties between equal head timestamps are broken by source index, so samples
//! with identical timestamps are emitted in source order and keep-last
//! deduplication selects the sample from the last source supplying that
//! timestamp.

pub mod dedup;

use std::cmp::Ordering;
use std::collections::BinaryHeap;

pub use dedup::{deduplicate_samples, needs_dedup};

/// One source's unpacked samples plus a cursor into the unconsumed tail.
///
/// `next_idx` is monotonically non-decreasing; samples before it have already
/// been merged.
#[derive(Debug, Default, Clone)]
pub struct SortBlock {
    pub timestamps: Vec<i64>,
    pub values: Vec<f64>,
    pub next_idx: usize,
    /// Arrival order of this block across all sources; the merge tie-break.
    pub source: usize,
}

impl SortBlock {
    /// Clears the block for reuse. Pooled blocks must be reset before any
    /// field is read.
    pub fn reset(&mut self) {
        self.timestamps.clear();
        self.values.clear();
        self.next_idx = 0;
        self.source = 0;
    }

    fn head_timestamp(&self) -> i64 {
        self.timestamps[self.next_idx]
    }

    fn remaining(&self) -> usize {
        self.timestamps.len() - self.next_idx
    }
}

/// Min-heap adapter: `BinaryHeap` is a max-heap, so the ordering is reversed.
struct MergeCandidate(SortBlock);

impl PartialEq for MergeCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeCandidate {}

impl PartialOrd for MergeCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.0.head_timestamp(), other.0.source).cmp(&(self.0.head_timestamp(), self.0.source))
    }
}

/// Merges `blocks` into `dst_timestamps`/`dst_values` and deduplicates with
/// `dedup_interval` (0 disables dedup). Empty blocks are skipped.
pub fn merge_sort_blocks(
    dst_timestamps: &mut Vec<i64>,
    dst_values: &mut Vec<f64>,
    blocks: Vec<SortBlock>,
    dedup_interval: i64,
) {
    let mut heap: BinaryHeap<MergeCandidate> = blocks
        .into_iter()
        .filter(|sb| sb.remaining() > 0)
        .map(MergeCandidate)
        .collect();

    while let Some(MergeCandidate(mut top)) = heap.pop() {
        let Some(MergeCandidate(next)) = heap.peek() else {
            // Single remaining source: append the whole tail without further
            // comparisons.
            dst_timestamps.extend_from_slice(&top.timestamps[top.next_idx..]);
            dst_values.extend_from_slice(&top.values[top.next_idx..]);
            break;
        };
        let ts_next = next.head_timestamp();
        let start = top.next_idx;

        let replicated = if dedup_interval > 0 {
            equal_samples_prefix(&top, next)
        } else {
            0
        };
        if replicated > 0 {
            // The prefix is replicated verbatim in the next source; skip it
            // here, it will be emitted from there.
            top.next_idx = start + replicated;
        } else {
            let ahead = &top.timestamps[start..];
            let mut n = binary_search_timestamps(ahead, ts_next);
            if n == 0 {
                // Head timestamps are tied. The heap already ordered the tie
                // by source index, so emitting this source's run of equal
                // timestamps keeps equal samples in source order and
                // guarantees progress.
                while n < ahead.len() && ahead[n] == ts_next {
                    n += 1;
                }
            }
            let end = start + n;
            dst_timestamps.extend_from_slice(&top.timestamps[start..end]);
            dst_values.extend_from_slice(&top.values[start..end]);
            top.next_idx = end;
        }
        if top.remaining() > 0 {
            heap.push(MergeCandidate(top));
        }
    }

    deduplicate_samples(dst_timestamps, dst_values, dedup_interval);
}

/// Number of leading unconsumed samples shared verbatim between `a` and `b`
/// (both timestamp and value must match).
fn equal_samples_prefix(a: &SortBlock, b: &SortBlock) -> usize {
    let ats = &a.timestamps[a.next_idx..];
    let bts = &b.timestamps[b.next_idx..];
    let avs = &a.values[a.next_idx..];
    let bvs = &b.values[b.next_idx..];
    let mut n = 0;
    while n < ats.len() && n < bts.len() && ats[n] == bts[n] && avs[n].to_bits() == bvs[n].to_bits()
    {
        n += 1;
    }
    n
}

/// Index of the first timestamp not less than `ts`; `timestamps` is sorted.
fn binary_search_timestamps(timestamps: &[i64], ts: i64) -> usize {
    if timestamps.last().is_some_and(|&last| last < ts) {
        // Fast path for timestamps scanned in ascending order.
        return timestamps.len();
    }
    timestamps.partition_point(|&t| t < ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sb(source: usize, samples: &[(i64, f64)]) -> SortBlock {
        SortBlock {
            timestamps: samples.iter().map(|&(ts, _)| ts).collect(),
            values: samples.iter().map(|&(_, v)| v).collect(),
            next_idx: 0,
            source,
        }
    }

    fn merge(blocks: Vec<SortBlock>, dedup_interval: i64) -> (Vec<i64>, Vec<f64>) {
        let mut ts = Vec::new();
        let mut vs = Vec::new();
        merge_sort_blocks(&mut ts, &mut vs, blocks, dedup_interval);
        (ts, vs)
    }

    #[test]
    fn test_empty_input() {
        let (ts, vs) = merge(vec![], 0);
        assert!(ts.is_empty() && vs.is_empty());
        let (ts, _) = merge(vec![sb(0, &[])], 0);
        assert!(ts.is_empty());
    }

    #[test]
    fn test_single_block_fast_path() {
        let (ts, vs) = merge(vec![sb(0, &[(1, 1.0), (5, 5.0), (9, 9.0)])], 0);
        assert_eq!(ts, vec![1, 5, 9]);
        assert_eq!(vs, vec![1.0, 5.0, 9.0]);
    }

    #[test]
    fn test_merge_without_dedup_is_stable_sort_of_concat() {
        // With dedup disabled the merge must be exactly the concatenation of
        // all inputs, stably sorted by timestamp: nothing dropped, equal
        // timestamps in source order.
        let blocks = vec![
            sb(0, &[(1, 10.0), (3, 30.0), (5, 50.0)]),
            sb(1, &[(1, 11.0), (2, 21.0), (5, 51.0)]),
            sb(2, &[(2, 22.0), (5, 52.0), (8, 82.0)]),
        ];
        let (ts, vs) = merge(blocks, 0);
        assert_eq!(ts, vec![1, 1, 2, 2, 3, 5, 5, 5, 8]);
        assert_eq!(vs, vec![10.0, 11.0, 21.0, 22.0, 30.0, 50.0, 51.0, 52.0, 82.0]);
    }

    #[test]
    fn test_merge_with_dedup_keeps_one_sample_per_bucket() {
        let blocks = vec![
            sb(0, &[(1000, 1.0), (2100, 2.0), (4100, 4.0)]),
            sb(1, &[(1900, 1.9), (2900, 2.9)]),
        ];
        let (ts, vs) = merge(blocks, 1000);
        // Buckets of width 1000 (ends at multiples of 1000): every bucket
        // holds exactly one surviving sample, the last one merged into it.
        assert_eq!(ts, vec![1000, 1900, 2900, 4100]);
        assert_eq!(vs, vec![1.0, 1.9, 2.9, 4.0]);
    }

    #[test]
    fn test_duplicate_timestamps_last_source_wins() {
        // Three sources share timestamps; at every duplicated timestamp the
        // value from the last source supplying it must survive dedup.
        let blocks = vec![
            sb(0, &[(1, 0.1), (2, 0.2), (3, 0.3), (5, 0.5)]),
            sb(1, &[(1, 1.1), (2, 1.2), (4, 1.4)]),
            sb(2, &[(1, 2.1), (2, 2.2), (4, 2.4)]),
        ];
        let (ts, vs) = merge(blocks, 1);
        assert_eq!(ts, vec![1, 2, 3, 4, 5]);
        assert_eq!(vs, vec![2.1, 2.2, 0.3, 2.4, 0.5]);
    }

    #[test]
    fn test_replicated_blocks_collapse_once() {
        // Two identical replicas plus one distinct block: with dedup enabled
        // the replicated samples must appear exactly once.
        let replica = &[(1, 1.0), (2, 2.0), (4, 4.0)];
        let blocks = vec![
            sb(0, &[(1, 1.0), (2, 2.0), (3, 3.0), (5, 5.0)]),
            sb(1, replica),
            sb(2, replica),
        ];
        let (ts, _) = merge(blocks, 1);
        assert_eq!(ts, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_disjoint_ranges_concatenate() {
        let blocks = vec![
            sb(0, &[(10, 1.0), (11, 1.1)]),
            sb(1, &[(1, 0.1), (2, 0.2)]),
        ];
        let (ts, vs) = merge(blocks, 0);
        assert_eq!(ts, vec![1, 2, 10, 11]);
        assert_eq!(vs, vec![0.1, 0.2, 1.0, 1.1]);
    }

    #[test]
    fn test_binary_search_timestamps() {
        assert_eq!(binary_search_timestamps(&[], 5), 0);
        assert_eq!(binary_search_timestamps(&[1, 2, 3], 0), 0);
        assert_eq!(binary_search_timestamps(&[1, 2, 3], 2), 1);
        assert_eq!(binary_search_timestamps(&[1, 2, 3], 3), 2);
        assert_eq!(binary_search_timestamps(&[1, 2, 3], 9), 3);
        assert_eq!(binary_search_timestamps(&[1, 1, 2, 2], 1), 0);
        assert_eq!(binary_search_timestamps(&[1, 1, 2, 2], 2), 2);
    }

    #[test]
    fn test_sort_block_reset() {
        let mut b = sb(3, &[(1, 1.0)]);
        b.next_idx = 1;
        b.reset();
        assert!(b.timestamps.is_empty());
        assert!(b.values.is_empty());
        assert_eq!(b.next_idx, 0);
        assert_eq!(b.source, 0);
    }
}
