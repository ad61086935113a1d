//! In-process write metrics.
//!
//! Counters are lock-free so partition completions can be recorded on
//! hot paths without coordination. Everything merges by addition: the
//! per-kind counters sum, and the duration histogram merges bucket-wise,
//! which keeps the merge associative and commutative regardless of the
//! order worker reports arrive in.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use stratum_client::MutationKind;

/// Number of histogram buckets, including the overflow bucket.
const BUCKETS: usize = 16;

/// Upper bounds (exclusive) of the first `BUCKETS - 1` buckets, in
/// nanoseconds: 1ms, 2ms, 4ms, ... doubling. The final bucket is
/// unbounded.
const BUCKET_BOUNDS_NS: [u64; BUCKETS - 1] = {
    let mut bounds = [0u64; BUCKETS - 1];
    let mut i = 0;
    while i < BUCKETS - 1 {
        bounds[i] = 1_000_000u64 << i;
        i += 1;
    }
    bounds
};

/// Lock-free duration distribution with power-of-two millisecond buckets.
#[derive(Debug)]
pub struct DurationHistogram {
    counts: [AtomicU64; BUCKETS],
    count: AtomicU64,
    sum_ns: AtomicU64,
}

impl Default for DurationHistogram {
    fn default() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_ns: AtomicU64::new(0),
        }
    }
}

impl DurationHistogram {
    /// Records one elapsed-time sample.
    pub fn record(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        let idx = BUCKET_BOUNDS_NS
            .iter()
            .position(|bound| nanos < *bound)
            .unwrap_or(BUCKETS - 1);
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ns.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Adds a previously captured distribution into this one.
    pub fn absorb(&self, other: &DurationSnapshot) {
        for (idx, count) in other.counts.iter().enumerate() {
            self.counts[idx].fetch_add(*count, Ordering::Relaxed);
        }
        self.count.fetch_add(other.count, Ordering::Relaxed);
        self.sum_ns.fetch_add(other.sum_ns, Ordering::Relaxed);
    }

    /// Captures a point-in-time copy of the distribution.
    pub fn snapshot(&self) -> DurationSnapshot {
        DurationSnapshot {
            counts: std::array::from_fn(|idx| self.counts[idx].load(Ordering::Relaxed)),
            count: self.count.load(Ordering::Relaxed),
            sum_ns: self.sum_ns.load(Ordering::Relaxed),
        }
    }
}

/// Immutable copy of one [`DurationHistogram`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DurationSnapshot {
    /// Per-bucket sample counts; the last bucket is unbounded.
    pub counts: [u64; BUCKETS],
    /// Total samples recorded.
    pub count: u64,
    /// Sum of all samples in nanoseconds.
    pub sum_ns: u64,
}

impl DurationSnapshot {
    /// Merges two distributions bucket-wise.
    pub fn merge(mut self, other: DurationSnapshot) -> DurationSnapshot {
        for (idx, count) in other.counts.iter().enumerate() {
            self.counts[idx] += count;
        }
        self.count += other.count;
        self.sum_ns += other.sum_ns;
        self
    }

    /// Mean sample duration, or zero with no samples.
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.sum_ns / self.count)
    }

    /// Upper-bound estimate of the `q` quantile (`0.0..=1.0`). Samples in
    /// the unbounded bucket report the mean, which is the best bound the
    /// bucketing keeps.
    pub fn quantile(&self, q: f64) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        let target = ((q.clamp(0.0, 1.0) * self.count as f64).ceil() as u64).max(1);
        let mut seen = 0u64;
        for (idx, count) in self.counts.iter().enumerate() {
            seen += count;
            if seen >= target {
                return if idx < BUCKETS - 1 {
                    Duration::from_nanos(BUCKET_BOUNDS_NS[idx])
                } else {
                    self.mean()
                };
            }
        }
        self.mean()
    }
}

/// Aggregated counters for one process's write pipeline.
#[derive(Debug, Default)]
pub struct WriteMetrics {
    /// Rows processed by insert partitions.
    rows_inserted: AtomicU64,
    /// Rows processed by upsert partitions.
    rows_upserted: AtomicU64,
    /// Rows processed by update partitions.
    rows_updated: AtomicU64,
    /// Rows processed by delete partitions.
    rows_deleted: AtomicU64,
    /// Partition executions completed (successfully or not).
    partitions: AtomicU64,
    /// Distribution of per-partition wall time.
    durations: DurationHistogram,
}

/// Immutable snapshot view of [`WriteMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteMetricsSnapshot {
    pub rows_inserted: u64,
    pub rows_upserted: u64,
    pub rows_updated: u64,
    pub rows_deleted: u64,
    pub partitions: u64,
    pub durations: DurationSnapshot,
}

impl WriteMetrics {
    /// Merges one completed partition report into the totals.
    pub fn record_partition(&self, kind: MutationKind, rows: u64, elapsed: Duration) {
        let counter = match kind {
            MutationKind::Insert => &self.rows_inserted,
            MutationKind::Upsert => &self.rows_upserted,
            MutationKind::Update => &self.rows_updated,
            MutationKind::Delete => &self.rows_deleted,
        };
        counter.fetch_add(rows, Ordering::Relaxed);
        self.partitions.fetch_add(1, Ordering::Relaxed);
        self.durations.record(elapsed);
    }

    /// Adds another process's snapshot into these totals.
    pub fn absorb(&self, other: &WriteMetricsSnapshot) {
        self.rows_inserted
            .fetch_add(other.rows_inserted, Ordering::Relaxed);
        self.rows_upserted
            .fetch_add(other.rows_upserted, Ordering::Relaxed);
        self.rows_updated
            .fetch_add(other.rows_updated, Ordering::Relaxed);
        self.rows_deleted
            .fetch_add(other.rows_deleted, Ordering::Relaxed);
        self.partitions
            .fetch_add(other.partitions, Ordering::Relaxed);
        self.durations.absorb(&other.durations);
    }

    /// Captures a point-in-time copy of all counters.
    pub fn snapshot(&self) -> WriteMetricsSnapshot {
        WriteMetricsSnapshot {
            rows_inserted: self.rows_inserted.load(Ordering::Relaxed),
            rows_upserted: self.rows_upserted.load(Ordering::Relaxed),
            rows_updated: self.rows_updated.load(Ordering::Relaxed),
            rows_deleted: self.rows_deleted.load(Ordering::Relaxed),
            partitions: self.partitions.load(Ordering::Relaxed),
            durations: self.durations.snapshot(),
        }
    }

    /// Renders metrics in a plain-text format suitable for `/metrics`.
    pub fn render_text(&self) -> String {
        let s = self.snapshot();
        let mut out = format!(
            "rows_inserted={}\nrows_upserted={}\nrows_updated={}\nrows_deleted={}\npartitions={}\nwrite_duration_count={}\nwrite_duration_sum_ns={}\n",
            s.rows_inserted,
            s.rows_upserted,
            s.rows_updated,
            s.rows_deleted,
            s.partitions,
            s.durations.count,
            s.durations.sum_ns,
        );
        for (idx, count) in s.durations.counts.iter().enumerate() {
            if idx < BUCKETS - 1 {
                let le_ms = BUCKET_BOUNDS_NS[idx] / 1_000_000;
                out.push_str(&format!("write_duration_bucket_le_{le_ms}ms={count}\n"));
            } else {
                out.push_str(&format!("write_duration_bucket_inf={count}\n"));
            }
        }
        out
    }
}
