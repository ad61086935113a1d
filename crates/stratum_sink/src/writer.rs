//! Per-partition mutation executors.
//!
//! One executor instance consumes one partition's rows: it synchronizes
//! the connection watermark, resolves the column mapping once, streams
//! row mutations through a background-flushing session, and closes the
//! session on every exit path. Executors never return early through `?`
//! past the session close; a fatal row-loop error and the close result
//! are reconciled afterwards so buffered mutations always flush.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arrow::array::RecordBatch;
use arrow::datatypes::Schema;
use stratum_client::{
    ClientError, ColumnType, Connection, Mutation, MutationKind, RowError, RowErrorReport,
    SessionConfig, TableHandle, Value, WriteSession,
};
use tracing::debug;

use crate::convert::{arrow_cell, parse_literal};
use crate::error::SinkError;

/// Immutable per-call write options.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Treat duplicate-key rejections as successes.
    pub ignore_duplicate_rows: bool,
    /// Leave null row values unset instead of writing explicit NULLs.
    /// On update-like operations an unset cell preserves the stored value.
    pub ignore_null: bool,
}

/// What one partition execution reports back to the coordinator.
///
/// The report is produced on every exit path, fatal or not, so the
/// coordinator can merge watermarks and metrics before deciding how the
/// overall call ends.
#[derive(Debug)]
pub(crate) struct PartitionOutcome {
    pub kind: MutationKind,
    /// Rows submitted to the session before the first fatal error.
    pub rows: u64,
    /// The connection's observed watermark after the session closed.
    pub observed_watermark: u64,
    pub elapsed: Duration,
    /// Per-row rejections accumulated by the session.
    pub failures: Vec<RowError>,
    /// Whether the session's failure buffer overflowed.
    pub overflowed: bool,
    /// Fatal error, if the partition aborted.
    pub error: Option<SinkError>,
}

impl PartitionOutcome {
    /// Outcome for a partition that never reached its table.
    pub(crate) fn failed_before_start(kind: MutationKind, error: SinkError) -> Self {
        Self {
            kind,
            rows: 0,
            observed_watermark: 0,
            elapsed: Duration::ZERO,
            failures: Vec::new(),
            overflowed: false,
            error: Some(error),
        }
    }
}

/// One mapped input column.
struct ColumnPlan {
    name: String,
    /// Index into the input batch.
    src: usize,
    /// Index into the table's column order.
    dst: usize,
    ty: ColumnType,
    is_key: bool,
}

/// Name-matches the input schema against the table's column list.
fn map_columns(input: &Schema, table: &TableHandle) -> Result<Vec<ColumnPlan>, SinkError> {
    let table_schema = table.schema();
    input
        .fields()
        .iter()
        .enumerate()
        .map(|(src, field)| {
            let field_name: &str = field.name();
            let dst = table_schema.column_index(field_name).ok_or_else(|| {
                SinkError::UnknownColumn {
                    column: field_name.to_string(),
                    table: table.name().to_string(),
                }
            })?;
            let column = &table_schema.columns()[dst];
            Ok(ColumnPlan {
                name: column.name.clone(),
                src,
                dst,
                ty: column.ty,
                is_key: column.is_key,
            })
        })
        .collect()
}

/// Executes one partition of a bulk write.
pub(crate) async fn write_partition(
    conn: Arc<Connection>,
    table_name: String,
    batch: RecordBatch,
    kind: MutationKind,
    prior_watermark: u64,
    options: WriteOptions,
    session_config: SessionConfig,
) -> PartitionOutcome {
    let started = Instant::now();
    // The connection must observe at least the coordinator's pre-write
    // watermark before any table access.
    conn.advance_watermark(prior_watermark);

    let table = match conn.open_table(&table_name).await {
        Ok(table) => table,
        Err(err) => return PartitionOutcome::failed_before_start(kind, err.into()),
    };
    let plan = match map_columns(batch.schema().as_ref(), &table) {
        Ok(plan) => plan,
        Err(err) => return PartitionOutcome::failed_before_start(kind, err),
    };

    let session_config = SessionConfig {
        ignore_duplicate_rows: options.ignore_duplicate_rows,
        ..session_config
    };
    let mut session = WriteSession::open(Arc::clone(&conn), &table, session_config);
    let width = table.schema().width();

    let mut rows_done = 0u64;
    let row_result = apply_rows(
        &mut session,
        &batch,
        &plan,
        width,
        kind,
        options,
        &mut rows_done,
    )
    .await;
    let close_result = session.close().await;
    finish_partition(conn, kind, rows_done, started, row_result, close_result)
}

/// Executes one partition of a selective update.
///
/// Key cells come from the row; cells named in `column_values` come from
/// the pre-parsed literals; everything else stays unset so stored values
/// survive.
pub(crate) async fn update_partition(
    conn: Arc<Connection>,
    table_name: String,
    batch: RecordBatch,
    column_values: Arc<BTreeMap<String, Option<String>>>,
    prior_watermark: u64,
    session_config: SessionConfig,
) -> PartitionOutcome {
    let kind = MutationKind::Update;
    let started = Instant::now();
    conn.advance_watermark(prior_watermark);

    let table = match conn.open_table(&table_name).await {
        Ok(table) => table,
        Err(err) => return PartitionOutcome::failed_before_start(kind, err.into()),
    };
    let input_schema = batch.schema();
    let plans = match selective_plans(input_schema.as_ref(), &table, &column_values) {
        Ok(plans) => plans,
        Err(err) => return PartitionOutcome::failed_before_start(kind, err),
    };
    let (key_plan, literal_plan) = plans;

    let mut session = WriteSession::open(Arc::clone(&conn), &table, session_config);
    let width = table.schema().width();

    let mut rows_done = 0u64;
    let row_result = apply_selective_rows(
        &mut session,
        &batch,
        &key_plan,
        &literal_plan,
        width,
        &mut rows_done,
    )
    .await;
    let close_result = session.close().await;
    finish_partition(conn, kind, rows_done, started, row_result, close_result)
}

/// Reconciles the row-loop result with the mandatory session close.
fn finish_partition(
    conn: Arc<Connection>,
    kind: MutationKind,
    rows_done: u64,
    started: Instant,
    row_result: Result<(), SinkError>,
    close_result: Result<RowErrorReport, ClientError>,
) -> PartitionOutcome {
    let (failures, overflowed, close_err) = match close_result {
        Ok(report) => (report.failures, report.overflowed, None),
        Err(err) => (Vec::new(), false, Some(SinkError::from(err))),
    };
    let error = match row_result {
        Ok(()) => close_err,
        // When the row loop failed only because the flusher had already
        // died, the close result carries the root cause.
        Err(SinkError::Client(_)) if close_err.is_some() => close_err,
        Err(err) => Some(err),
    };
    let outcome = PartitionOutcome {
        kind,
        rows: rows_done,
        observed_watermark: conn.observed_watermark(),
        elapsed: started.elapsed(),
        failures,
        overflowed,
        error,
    };
    debug!(
        kind = kind.as_str(),
        rows = outcome.rows,
        failures = outcome.failures.len(),
        watermark = outcome.observed_watermark,
        fatal = outcome.error.is_some(),
        "partition execution finished"
    );
    outcome
}

/// Streams one partition's rows into the session as `kind` mutations.
async fn apply_rows(
    session: &mut WriteSession,
    batch: &RecordBatch,
    plan: &[ColumnPlan],
    width: usize,
    kind: MutationKind,
    options: WriteOptions,
    rows_done: &mut u64,
) -> Result<(), SinkError> {
    for row in 0..batch.num_rows() {
        let mut mutation = Mutation::new(kind, width);
        for column in plan {
            // Deletes only need the key; non-key cells are never read.
            if kind == MutationKind::Delete && !column.is_key {
                continue;
            }
            match arrow_cell(&column.name, batch.column(column.src), row, column.ty)? {
                Some(value) => mutation.set(column.dst, value),
                None => {
                    if column.is_key {
                        return Err(SinkError::NullKey {
                            column: column.name.clone(),
                        });
                    }
                    if !options.ignore_null {
                        mutation.set_null(column.dst);
                    }
                }
            }
        }
        session.apply(mutation).await?;
        *rows_done += 1;
    }
    Ok(())
}

/// Pre-parsed literal assignment for one target column.
struct LiteralPlan {
    dst: usize,
    /// `None` is the explicit null marker.
    value: Option<Value>,
}

/// Resolves the key mapping and parses every literal once per partition.
fn selective_plans(
    input: &Schema,
    table: &TableHandle,
    column_values: &BTreeMap<String, Option<String>>,
) -> Result<(Vec<ColumnPlan>, Vec<LiteralPlan>), SinkError> {
    let table_schema = table.schema();

    let mut key_plan = Vec::new();
    for dst in table_schema.key_indexes() {
        let column = &table_schema.columns()[dst];
        let src = input
            .fields()
            .iter()
            .position(|field| {
                let field_name: &str = field.name();
                field_name == column.name
            })
            .ok_or_else(|| SinkError::MissingKeyColumn {
                column: column.name.clone(),
            })?;
        key_plan.push(ColumnPlan {
            name: column.name.clone(),
            src,
            dst,
            ty: column.ty,
            is_key: true,
        });
    }

    let mut literal_plan = Vec::new();
    for (name, raw) in column_values {
        let dst = table_schema
            .column_index(name)
            .ok_or_else(|| SinkError::UnknownColumn {
                column: name.clone(),
                table: table.name().to_string(),
            })?;
        let column = &table_schema.columns()[dst];
        if column.is_key {
            return Err(SinkError::KeyFromLiterals {
                column: name.clone(),
            });
        }
        let value = match raw {
            None => None,
            Some(raw) => Some(parse_literal(name, raw, column.ty)?),
        };
        literal_plan.push(LiteralPlan { dst, value });
    }
    Ok((key_plan, literal_plan))
}

/// Streams one partition's rows as selective `update` mutations.
async fn apply_selective_rows(
    session: &mut WriteSession,
    batch: &RecordBatch,
    key_plan: &[ColumnPlan],
    literal_plan: &[LiteralPlan],
    width: usize,
    rows_done: &mut u64,
) -> Result<(), SinkError> {
    for row in 0..batch.num_rows() {
        let mut mutation = Mutation::new(MutationKind::Update, width);
        for key in key_plan {
            match arrow_cell(&key.name, batch.column(key.src), row, key.ty)? {
                Some(value) => mutation.set(key.dst, value),
                // A null key cannot address a row; the cluster reports it
                // as a per-row failure rather than aborting the partition.
                None => mutation.set_null(key.dst),
            }
        }
        for literal in literal_plan {
            match &literal.value {
                Some(value) => mutation.set(literal.dst, value.clone()),
                None => mutation.set_null(literal.dst),
            }
        }
        session.apply(mutation).await?;
        *rows_done += 1;
    }
    Ok(())
}
