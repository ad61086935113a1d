//! Write pipeline bridging Arrow row batches into Stratum tables.
//!
//! A [`SinkContext`] owns the process-wide connection cache, the write
//! metrics, and the identity of the target cluster. One `write` call is
//! one coordinated set of partitions: the coordinator reads its
//! connection's watermark once, dispatches one partition executor per
//! `RecordBatch` onto independent tasks, then reduces the per-partition
//! reports: watermarks by `max`, metrics by summation, row failures
//! into one count-plus-samples error. Rows that applied stay applied;
//! there is no rollback.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::RecordBatch;
use stratum_client::{Connection, ConnectionConfig, Connector, MutationKind, SessionConfig};
use tokio::task::JoinSet;
use tracing::info;

mod cache;
mod convert;
mod error;
pub mod metrics;
mod watermark;
mod writer;

pub use cache::ConnectionCache;
pub use convert::{arrow_cell, parse_literal};
pub use error::{ConvertError, SinkError};
pub use metrics::{DurationHistogram, DurationSnapshot, WriteMetrics, WriteMetricsSnapshot};
pub use watermark::Watermark;
pub use writer::WriteOptions;

use writer::{update_partition, write_partition, PartitionOutcome};

/// Maximum row-failure samples included in a [`SinkError::RowFailures`].
const FAILURE_SAMPLE_LIMIT: usize = 5;

/// Process-level tuning for the write pipeline.
#[derive(Debug, Clone, Copy)]
pub struct SinkConfig {
    /// Buffered mutations that trigger a background session flush.
    pub flush_threshold: usize,
    /// Row failures kept with full detail per session.
    pub max_buffered_errors: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 1000,
            max_buffered_errors: 100,
        }
    }
}

impl SinkConfig {
    /// Loads configuration from environment variables with defaults.
    pub fn from_env() -> Result<Self, SinkError> {
        let defaults = Self::default();
        Ok(Self {
            flush_threshold: parse_usize("STRATUM_SINK_FLUSH_THRESHOLD", defaults.flush_threshold)?
                .max(1),
            max_buffered_errors: parse_usize(
                "STRATUM_SINK_MAX_BUFFERED_ERRORS",
                defaults.max_buffered_errors,
            )?,
        })
    }

    /// Session tuning derived from this config. Duplicate suppression is
    /// decided per call by the executor, from its write options.
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            flush_threshold: self.flush_threshold,
            max_buffered_errors: self.max_buffered_errors,
            ignore_duplicate_rows: false,
        }
    }
}

/// Parses one optional environment variable.
fn parse_usize(name: &'static str, default: usize) -> Result<usize, SinkError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|_| SinkError::InvalidConfig { name, value: raw }),
    }
}

/// Entry point for distributed writes against one Stratum cluster.
pub struct SinkContext {
    cluster: ConnectionConfig,
    cache: Arc<ConnectionCache>,
    config: SinkConfig,
    metrics: Arc<WriteMetrics>,
}

impl SinkContext {
    /// Builds a context targeting `cluster` through `connector`.
    pub fn new(
        cluster: ConnectionConfig,
        connector: Arc<dyn Connector>,
        config: SinkConfig,
    ) -> Self {
        Self {
            cluster,
            cache: Arc::new(ConnectionCache::new(connector)),
            config,
            metrics: Arc::new(WriteMetrics::default()),
        }
    }

    /// Applies every partition's rows to `table` as `kind` mutations.
    ///
    /// All partitions run to completion even when one fails; the first
    /// fatal error wins, otherwise any accumulated row failures are
    /// reported as one [`SinkError::RowFailures`].
    pub async fn write(
        &self,
        partitions: Vec<RecordBatch>,
        table: &str,
        kind: MutationKind,
        options: WriteOptions,
    ) -> Result<(), SinkError> {
        let coordinator = self.cache.acquire(&self.cluster).await?;
        // Read once before dispatch: every worker in this call starts
        // from the same pre-write view.
        let prior_watermark = coordinator.observed_watermark();
        let credential = coordinator.export_credential().await?;
        let session_config = self.config.session_config();

        info!(
            table,
            kind = kind.as_str(),
            partitions = partitions.len(),
            prior_watermark,
            "dispatching write"
        );

        let mut tasks = JoinSet::new();
        for batch in partitions {
            let cache = Arc::clone(&self.cache);
            let cluster = self.cluster.clone();
            let table = table.to_string();
            let credential = credential.clone();
            tasks.spawn(async move {
                let conn = match cache.acquire(&cluster).await {
                    Ok(conn) => conn,
                    Err(err) => return PartitionOutcome::failed_before_start(kind, err.into()),
                };
                if let Err(err) = conn.import_credential(credential).await {
                    return PartitionOutcome::failed_before_start(kind, err.into());
                }
                write_partition(
                    conn,
                    table,
                    batch,
                    kind,
                    prior_watermark,
                    options,
                    session_config,
                )
                .await
            });
        }
        self.reduce(&coordinator, prior_watermark, tasks).await
    }

    /// Updates only the columns named in `column_values` (plus key
    /// columns taken from each row), leaving every other column's stored
    /// value untouched. `None` literals store explicit NULLs.
    pub async fn update_columns(
        &self,
        partitions: Vec<RecordBatch>,
        table: &str,
        column_values: BTreeMap<String, Option<String>>,
    ) -> Result<(), SinkError> {
        let coordinator = self.cache.acquire(&self.cluster).await?;
        let prior_watermark = coordinator.observed_watermark();
        let credential = coordinator.export_credential().await?;
        let session_config = self.config.session_config();
        let column_values = Arc::new(column_values);

        info!(
            table,
            partitions = partitions.len(),
            columns = column_values.len(),
            prior_watermark,
            "dispatching selective update"
        );

        let mut tasks = JoinSet::new();
        for batch in partitions {
            let cache = Arc::clone(&self.cache);
            let cluster = self.cluster.clone();
            let table = table.to_string();
            let credential = credential.clone();
            let column_values = Arc::clone(&column_values);
            tasks.spawn(async move {
                let conn = match cache.acquire(&cluster).await {
                    Ok(conn) => conn,
                    Err(err) => {
                        return PartitionOutcome::failed_before_start(MutationKind::Update, err.into())
                    }
                };
                if let Err(err) = conn.import_credential(credential).await {
                    return PartitionOutcome::failed_before_start(MutationKind::Update, err.into());
                }
                update_partition(
                    conn,
                    table,
                    batch,
                    column_values,
                    prior_watermark,
                    session_config,
                )
                .await
            });
        }
        self.reduce(&coordinator, prior_watermark, tasks).await
    }

    /// Awaits every partition task and folds their reports.
    async fn reduce(
        &self,
        coordinator: &Arc<Connection>,
        prior_watermark: u64,
        mut tasks: JoinSet<PartitionOutcome>,
    ) -> Result<(), SinkError> {
        let mut combined = Watermark(prior_watermark);
        let mut fatal: Option<SinkError> = None;
        let mut failure_count = 0u64;
        let mut samples: Vec<String> = Vec::new();
        let mut overflowed = false;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    combined = combined.merge(Watermark(outcome.observed_watermark));
                    self.metrics
                        .record_partition(outcome.kind, outcome.rows, outcome.elapsed);
                    failure_count += outcome.failures.len() as u64;
                    overflowed |= outcome.overflowed;
                    for failure in &outcome.failures {
                        if samples.len() < FAILURE_SAMPLE_LIMIT {
                            samples.push(format!("row {}: {}", failure.row, failure.status));
                        }
                    }
                    if fatal.is_none() {
                        fatal = outcome.error;
                    }
                }
                Err(join_err) => {
                    if fatal.is_none() {
                        fatal = Some(SinkError::Task(join_err.to_string()));
                    }
                }
            }
        }

        // Single authoritative reduction: the coordinator's connection
        // advances once, after all reports are in.
        coordinator.advance_watermark(combined.value());

        if let Some(err) = fatal {
            return Err(err);
        }
        if failure_count > 0 {
            return Err(SinkError::RowFailures {
                count: failure_count,
                samples,
                overflowed,
            });
        }
        Ok(())
    }

    /// Read surface for per-kind counts and the duration distribution.
    pub fn metrics(&self) -> &WriteMetrics {
        &self.metrics
    }

    /// Test hook: drops every cached connection.
    pub async fn reset_connection_cache(&self) {
        self.cache.reset_for_tests().await;
    }

    /// Number of live cached connections. Test visibility.
    pub async fn cached_connections(&self) -> usize {
        self.cache.cached().await
    }

    /// Acquires (building if needed) the connection for an identity.
    /// Exposed so callers can pre-warm or inspect cache identity.
    pub async fn connection(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<Connection>, SinkError> {
        Ok(self.cache.acquire(config).await?)
    }

    /// Process-exit teardown: closes every cached connection exactly once.
    pub async fn shutdown(&self) {
        self.cache.shutdown_all().await;
    }
}
