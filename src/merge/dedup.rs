//! Sample deduplication.
//!
//! When the same series is replicated across storage nodes with slightly
//! different retention, the merged stream contains near-duplicate samples.
//! [`deduplicate_samples`] collapses them: timestamps are grouped into
//! buckets of `dedup_interval` width (bucket ends are the multiples of the
//! interval, rounding the first timestamp up) and only the last sample of
//! each bucket survives. Equal timestamps within a bucket keep the sample
//! that arrived last in merge order. `dedup_interval <= 0` disables
//! deduplication entirely.

/// Collapses `timestamps`/`values` in place so that every `dedup_interval`
/// bucket keeps exactly its last sample.
pub fn deduplicate_samples(timestamps: &mut Vec<i64>, values: &mut Vec<f64>, dedup_interval: i64) {
    debug_assert_eq!(timestamps.len(), values.len());
    if !needs_dedup(timestamps, dedup_interval) {
        return;
    }
    let mut ts_next = bucket_end(timestamps[0], dedup_interval);
    let mut j = 0usize;
    for i in 1..timestamps.len() {
        let ts = timestamps[i];
        if ts <= ts_next {
            continue;
        }
        // timestamps[i-1] is the last sample of the current bucket.
        timestamps[j] = timestamps[i - 1];
        values[j] = values[i - 1];
        j += 1;
        ts_next += dedup_interval;
        if ts_next < ts {
            ts_next = bucket_end(ts, dedup_interval);
        }
    }
    let last = timestamps.len() - 1;
    timestamps[j] = timestamps[last];
    values[j] = values[last];
    j += 1;
    timestamps.truncate(j);
    values.truncate(j);
}

/// Rounds `ts` up to the nearest multiple of `interval`.
fn bucket_end(ts: i64, interval: i64) -> i64 {
    let t = ts + interval - 1;
    t - t % interval
}

/// Reports whether `timestamps` contains at least two samples falling into
/// one dedup bucket. Lets callers skip the compaction pass on the common
/// already-deduplicated case.
pub fn needs_dedup(timestamps: &[i64], dedup_interval: i64) -> bool {
    if dedup_interval <= 0 || timestamps.len() < 2 {
        return false;
    }
    let mut ts_next = bucket_end(timestamps[0], dedup_interval);
    for &ts in &timestamps[1..] {
        if ts <= ts_next {
            return true;
        }
        ts_next += dedup_interval;
        if ts > ts_next {
            ts_next = bucket_end(ts, dedup_interval);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dedup(timestamps: &[i64], dedup_interval: i64) -> (Vec<i64>, Vec<f64>) {
        let mut ts = timestamps.to_vec();
        // Values are the source positions, so the surviving sample of each
        // bucket is identifiable.
        let mut vs: Vec<f64> = (0..ts.len()).map(|i| i as f64).collect();
        deduplicate_samples(&mut ts, &mut vs, dedup_interval);
        (ts, vs)
    }

    #[test]
    fn test_needs_dedup() {
        let f = |interval: i64, timestamps: &[i64], expected: bool| {
            assert_eq!(
                needs_dedup(timestamps, interval),
                expected,
                "needs_dedup({timestamps:?}, {interval})"
            );
        };
        f(-1, &[], false);
        f(-1, &[1], false);
        f(0, &[1, 2], false);
        f(10, &[1], false);
        f(10, &[1, 2], true);
        f(10, &[9, 11], false);
        f(10, &[10, 11], false);
        f(10, &[0, 10, 11], false);
        f(10, &[9, 10], true);
        f(10, &[0, 10, 19], false);
        f(10, &[9, 19], false);
        f(10, &[0, 11, 19], true);
        f(10, &[0, 11, 20], true);
        f(10, &[0, 11, 21], false);
        f(10, &[0, 19], false);
        f(10, &[0, 30, 40], false);
        f(10, &[0, 31, 40], true);
        f(10, &[0, 31, 41], false);
        f(10, &[0, 31, 49], false);
    }

    #[test]
    fn test_zero_interval_keeps_everything() {
        let (ts, vs) = dedup(&[0, 0, 0, 1, 1, 2, 3, 3, 3, 4], 0);
        assert_eq!(ts, vec![0, 0, 0, 1, 1, 2, 3, 3, 3, 4]);
        assert_eq!(vs, (0..10).map(|i| i as f64).collect::<Vec<_>>());
    }

    #[test]
    fn test_last_sample_per_bucket_survives() {
        let (ts, vs) = dedup(&[0, 0, 0, 1, 1, 2, 3, 3, 3, 4], 1);
        assert_eq!(ts, vec![0, 1, 2, 3, 4]);
        assert_eq!(vs, vec![2.0, 4.0, 5.0, 8.0, 9.0]);

        let (ts, vs) = dedup(&[0, 100, 100, 101, 150, 180, 205, 300, 1000], 100);
        assert_eq!(ts, vec![0, 100, 180, 300, 1000]);
        assert_eq!(vs, vec![0.0, 2.0, 5.0, 7.0, 8.0]);

        let (ts, vs) = dedup(
            &[10_000, 13_000, 21_000, 22_000, 30_000, 33_000, 39_000, 45_000],
            10_000,
        );
        assert_eq!(ts, vec![10_000, 13_000, 30_000, 39_000, 45_000]);
        assert_eq!(vs, vec![0.0, 1.0, 4.0, 6.0, 7.0]);
    }

    #[test]
    fn test_equal_timestamps_keep_last_arrival() {
        let (ts, vs) = dedup(&[1000, 1000], 1000);
        assert_eq!(ts, vec![1000]);
        assert_eq!(vs, vec![1.0]);

        let (ts, vs) = dedup(&[1000, 1001, 1001, 1001, 2001], 1000);
        assert_eq!(ts, vec![1000, 1001, 2001]);
        assert_eq!(vs, vec![0.0, 3.0, 4.0]);
    }

    #[test]
    fn test_dedup_is_idempotent() {
        let mut ts = vec![0, 100, 100, 101, 150, 180, 205, 300, 1000];
        let mut vs: Vec<f64> = (0..ts.len()).map(|i| i as f64).collect();
        deduplicate_samples(&mut ts, &mut vs, 100);
        let (ts1, vs1) = (ts.clone(), vs.clone());
        deduplicate_samples(&mut ts, &mut vs, 100);
        assert_eq!(ts, ts1);
        assert_eq!(vs, vs1);
    }

    #[test]
    fn test_small_inputs() {
        let (ts, vs) = dedup(&[], 10);
        assert!(ts.is_empty() && vs.is_empty());
        let (ts, vs) = dedup(&[123], 10);
        assert_eq!(ts, vec![123]);
        assert_eq!(vs, vec![0.0]);
    }
}
