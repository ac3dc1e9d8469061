//! Shared data model of the query tier.
//!
//! The request descriptor ([`SearchQuery`]), the unit of transfer between
//! storage nodes and the query tier ([`MetricBlock`]), and the aggregate
//! structures returned by the metadata operations all live here, together
//! with their wire representations.

pub mod marshal;

use crate::model::marshal::{
    append_bool, append_bytes, append_f64, append_i64, append_u32, append_u64, take_bool,
    take_bytes, take_f64, take_i64, take_u32, take_u64, MarshalError, MarshalResult,
};
use crate::wire::{MAX_LABEL_VALUE_SIZE, MAX_METRIC_NAME_SIZE};

/// Inclusive time range in unix milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeRange {
    pub min_timestamp: i64,
    pub max_timestamp: i64,
}

impl TimeRange {
    pub fn new(min_timestamp: i64, max_timestamp: i64) -> Self {
        Self {
            min_timestamp,
            max_timestamp,
        }
    }

    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.min_timestamp && ts <= self.max_timestamp
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}..{}]", self.min_timestamp, self.max_timestamp)
    }
}

/// A single tag filter inside a [`SearchQuery`] conjunction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TagFilter {
    pub key: String,
    pub value: String,
    /// Invert the match.
    pub negate: bool,
    /// Treat `value` as a regular expression.
    pub regexp: bool,
}

/// Immutable search request descriptor.
///
/// The filter sets form a disjunction of conjunctions: a series matches when
/// all filters of at least one set match. The query is serialized once with
/// [`SearchQuery::marshal`] and the identical bytes are sent to every storage
/// node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchQuery {
    pub account_id: u32,
    pub project_id: u32,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub tag_filter_sets: Vec<Vec<TagFilter>>,
    /// Cap on the number of matching series; 0 means no cap.
    pub max_metrics: u32,
}

impl SearchQuery {
    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(self.min_timestamp, self.max_timestamp)
    }

    pub fn marshal(&self, buf: &mut Vec<u8>) {
        append_u32(buf, self.account_id);
        append_u32(buf, self.project_id);
        append_i64(buf, self.min_timestamp);
        append_i64(buf, self.max_timestamp);
        append_u64(buf, self.tag_filter_sets.len() as u64);
        for set in &self.tag_filter_sets {
            append_u64(buf, set.len() as u64);
            for tf in set {
                append_bytes(buf, tf.key.as_bytes());
                append_bytes(buf, tf.value.as_bytes());
                append_bool(buf, tf.negate);
                append_bool(buf, tf.regexp);
            }
        }
        append_u32(buf, self.max_metrics);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        self.marshal(&mut buf);
        buf
    }

    /// Parses a query from `buf`, which must be fully consumed.
    pub fn unmarshal(buf: &[u8]) -> MarshalResult<Self> {
        let (account_id, buf) = take_u32(buf)?;
        let (project_id, buf) = take_u32(buf)?;
        let (min_timestamp, buf) = take_i64(buf)?;
        let (max_timestamp, buf) = take_i64(buf)?;
        let (set_count, mut buf) = take_u64(buf)?;

        let mut tag_filter_sets = Vec::new();
        for _ in 0..set_count {
            let (filter_count, mut rest) = take_u64(buf)?;
            let mut set = Vec::new();
            for _ in 0..filter_count {
                let (key, r) = take_bytes(rest, MAX_LABEL_VALUE_SIZE)?;
                let (value, r) = take_bytes(r, MAX_LABEL_VALUE_SIZE)?;
                let (negate, r) = take_bool(r)?;
                let (regexp, r) = take_bool(r)?;
                set.push(TagFilter {
                    key: String::from_utf8_lossy(key).into_owned(),
                    value: String::from_utf8_lossy(value).into_owned(),
                    negate,
                    regexp,
                });
                rest = r;
            }
            tag_filter_sets.push(set);
            buf = rest;
        }
        let (max_metrics, buf) = take_u32(buf)?;
        if !buf.is_empty() {
            return Err(MarshalError::TrailingData(buf.len()));
        }
        Ok(Self {
            account_id,
            project_id,
            min_timestamp,
            max_timestamp,
            tag_filter_sets,
            max_metrics,
        })
    }
}

impl std::fmt::Display for SearchQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "filters={}, timeRange=[{}..{}]",
            self.tag_filter_sets.len(),
            self.min_timestamp,
            self.max_timestamp
        )
    }
}

/// Columnar block of samples for one series.
///
/// Timestamps are non-decreasing; `timestamps` and `values` always have the
/// same length.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    pub timestamps: Vec<i64>,
    pub values: Vec<f64>,
}

impl Block {
    pub fn new(timestamps: Vec<i64>, values: Vec<f64>) -> Self {
        debug_assert_eq!(timestamps.len(), values.len());
        Self { timestamps, values }
    }

    pub fn row_count(&self) -> usize {
        self.timestamps.len()
    }

    pub fn marshal(&self, buf: &mut Vec<u8>) {
        append_u64(buf, self.timestamps.len() as u64);
        for &ts in &self.timestamps {
            append_i64(buf, ts);
        }
        for &v in &self.values {
            append_f64(buf, v);
        }
    }

    pub fn unmarshal(buf: &[u8]) -> MarshalResult<(Self, &[u8])> {
        let (rows, mut buf) = take_u64(buf)?;
        let need = (rows as usize).checked_mul(16).ok_or(MarshalError::TooLarge {
            size: rows,
            max: usize::MAX / 16,
        })?;
        if buf.len() < need {
            return Err(MarshalError::UnexpectedEod {
                need,
                got: buf.len(),
            });
        }
        let mut timestamps = Vec::with_capacity(rows as usize);
        let mut values = Vec::with_capacity(rows as usize);
        for _ in 0..rows {
            let (ts, rest) = take_i64(buf)?;
            timestamps.push(ts);
            buf = rest;
        }
        for _ in 0..rows {
            let (v, rest) = take_f64(buf)?;
            values.push(v);
            buf = rest;
        }
        Ok((Self { timestamps, values }, buf))
    }
}

/// A metric name together with one block of its samples; the unit of transfer
/// between the storage-node server and the query tier.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetricBlock {
    pub metric_name: String,
    pub block: Block,
}

impl MetricBlock {
    pub fn marshal(&self, buf: &mut Vec<u8>) {
        append_bytes(buf, self.metric_name.as_bytes());
        self.block.marshal(buf);
    }

    /// Parses a metric block from `buf`, which must be fully consumed.
    pub fn unmarshal(buf: &[u8]) -> MarshalResult<Self> {
        let (name, buf) = take_bytes(buf, MAX_METRIC_NAME_SIZE)?;
        let (block, tail) = Block::unmarshal(buf)?;
        if !tail.is_empty() {
            return Err(MarshalError::TrailingData(tail.len()));
        }
        Ok(Self {
            metric_name: String::from_utf8_lossy(name).into_owned(),
            block,
        })
    }
}

/// A raw metric name plus a timestamp, registered ahead of ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetricRow {
    pub metric_name_raw: Vec<u8>,
    pub timestamp: i64,
}

/// A name with an associated count, used by the top-N breakdowns of
/// [`TsdbStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopEntry {
    pub name: String,
    pub count: u64,
}

/// Cardinality statistics for the indexed data of one or more storage nodes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TsdbStatus {
    pub total_series: u64,
    pub total_label_value_pairs: u64,
    pub series_count_by_metric_name: Vec<TopEntry>,
    pub series_count_by_label_name: Vec<TopEntry>,
    pub series_count_by_focus_label_value: Vec<TopEntry>,
    pub series_count_by_label_value_pair: Vec<TopEntry>,
    pub label_value_count_by_label_name: Vec<TopEntry>,
}

/// A label name together with all its observed values.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelEntry {
    pub name: String,
    pub values: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_query() -> SearchQuery {
        SearchQuery {
            account_id: 3,
            project_id: 7,
            min_timestamp: -60_000,
            max_timestamp: 60_000,
            tag_filter_sets: vec![
                vec![
                    TagFilter {
                        key: "__name__".into(),
                        value: "http_requests_total".into(),
                        negate: false,
                        regexp: false,
                    },
                    TagFilter {
                        key: "region".into(),
                        value: "eu-.*".into(),
                        negate: true,
                        regexp: true,
                    },
                ],
                vec![],
            ],
            max_metrics: 1000,
        }
    }

    #[test]
    fn test_search_query_roundtrip() {
        let sq = sample_query();
        let parsed = SearchQuery::unmarshal(&sq.to_bytes()).unwrap();
        assert_eq!(parsed, sq);
    }

    #[test]
    fn test_search_query_rejects_trailing_data() {
        let mut data = sample_query().to_bytes();
        data.push(0);
        assert!(matches!(
            SearchQuery::unmarshal(&data),
            Err(MarshalError::TrailingData(1))
        ));
    }

    #[test]
    fn test_metric_block_roundtrip() {
        let mb = MetricBlock {
            metric_name: "cpu_usage".into(),
            block: Block::new(vec![1, 2, 3], vec![0.5, f64::NAN, -1.0]),
        };
        let mut buf = Vec::new();
        mb.marshal(&mut buf);
        let parsed = MetricBlock::unmarshal(&buf).unwrap();
        assert_eq!(parsed.metric_name, "cpu_usage");
        assert_eq!(parsed.block.timestamps, vec![1, 2, 3]);
        assert_eq!(parsed.block.values[0], 0.5);
        assert!(parsed.block.values[1].is_nan());
        assert_eq!(parsed.block.values[2], -1.0);
    }

    #[test]
    fn test_block_unmarshal_rejects_bogus_row_count() {
        let mut buf = Vec::new();
        append_u64(&mut buf, u64::MAX / 2);
        assert!(Block::unmarshal(&buf).is_err());
    }

    #[test]
    fn test_time_range_contains() {
        let tr = TimeRange::new(10, 20);
        assert!(tr.contains(10));
        assert!(tr.contains(20));
        assert!(!tr.contains(9));
        assert!(!tr.contains(21));
    }
}
