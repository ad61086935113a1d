//! Batching write sessions.
//!
//! A session buffers mutations against one table on one connection and
//! flushes them on a background task whenever the buffer reaches the
//! flush threshold. Closing the session flushes the remainder, joins the
//! flusher, and returns every buffered row failure. The failure buffer is
//! capacity-bounded; once full, further failures only set the overflow
//! flag so a pathological partition cannot hold the whole error set in
//! memory.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cluster::{is_duplicate_row_status, RowError, SequencedMutation};
use crate::connection::Connection;
use crate::error::ClientError;
use crate::mutation::Mutation;
use crate::table::TableHandle;

/// Tuning for one write session.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Buffered mutations that trigger a background flush.
    pub flush_threshold: usize,
    /// Maximum row failures kept with full detail.
    pub max_buffered_errors: usize,
    /// Silently drop duplicate-key row failures.
    pub ignore_duplicate_rows: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 1000,
            max_buffered_errors: 100,
            ignore_duplicate_rows: false,
        }
    }
}

/// Row failures observed over the life of one session.
#[derive(Debug, Clone, Default)]
pub struct RowErrorReport {
    /// Failures in flush order, capped at the session's buffer capacity.
    pub failures: Vec<RowError>,
    /// Set when failures were dropped because the buffer was full.
    pub overflowed: bool,
}

/// An in-flight batch accumulator bound to one connection and one table.
pub struct WriteSession {
    tx: mpsc::Sender<Vec<SequencedMutation>>,
    flusher: JoinHandle<Result<RowErrorReport, ClientError>>,
    buffer: Vec<SequencedMutation>,
    next_seq: u64,
    flush_threshold: usize,
}

impl WriteSession {
    /// Opens a session against `table` on a shared connection, spawning
    /// the background flusher.
    pub fn open(conn: Arc<Connection>, table: &TableHandle, config: SessionConfig) -> Self {
        let (tx, rx) = mpsc::channel(16);
        let table_name = table.name().to_string();
        let flusher = tokio::spawn(run_flusher(conn, table_name, rx, config));
        Self {
            tx,
            flusher,
            buffer: Vec::new(),
            next_seq: 0,
            flush_threshold: config.flush_threshold.max(1),
        }
    }

    /// Number of mutations applied to this session so far.
    pub fn applied(&self) -> u64 {
        self.next_seq
    }

    /// Buffers one mutation, flushing in the background once the
    /// threshold is reached. The mutation may not be durable until
    /// [`close`](Self::close) returns.
    pub async fn apply(&mut self, mutation: Mutation) -> Result<(), ClientError> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.buffer.push(SequencedMutation { seq, mutation });
        if self.buffer.len() >= self.flush_threshold {
            let batch = std::mem::take(&mut self.buffer);
            self.tx.send(batch).await.map_err(|_| {
                ClientError::SessionClosed("background flusher is gone".to_string())
            })?;
        }
        Ok(())
    }

    /// Flushes all remaining buffered mutations and returns the failure
    /// report. Must be called on every exit path of the owning partition.
    pub async fn close(self) -> Result<RowErrorReport, ClientError> {
        let WriteSession {
            tx,
            flusher,
            buffer,
            next_seq,
            ..
        } = self;
        if !buffer.is_empty() {
            // A send failure here means the flusher already stopped; its
            // join result below carries the underlying error.
            let _ = tx.send(buffer).await;
        }
        drop(tx);
        let report = flusher
            .await
            .map_err(|err| ClientError::SessionClosed(err.to_string()))??;
        debug!(
            rows = next_seq,
            failures = report.failures.len(),
            overflowed = report.overflowed,
            "write session closed"
        );
        Ok(report)
    }
}

/// Background flush loop: applies batches in arrival order and collects
/// row failures until the channel closes.
async fn run_flusher(
    conn: Arc<Connection>,
    table: String,
    mut rx: mpsc::Receiver<Vec<SequencedMutation>>,
    config: SessionConfig,
) -> Result<RowErrorReport, ClientError> {
    let mut report = RowErrorReport::default();
    while let Some(batch) = rx.recv().await {
        let outcome = conn.rpc().apply_batch(&table, batch).await?;
        conn.advance_watermark(outcome.watermark);
        for failure in outcome.row_failures {
            if config.ignore_duplicate_rows && is_duplicate_row_status(&failure.status) {
                continue;
            }
            if report.failures.len() >= config.max_buffered_errors {
                report.overflowed = true;
            } else {
                report.failures.push(failure);
            }
        }
    }
    Ok(report)
}
