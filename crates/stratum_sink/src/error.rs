//! Error taxonomy of the write pipeline.
//!
//! Configuration and conversion errors are fatal to the partition that
//! raises them; row-apply failures are accumulated by the session and
//! surfaced once, after close, as [`SinkError::RowFailures`].

use stratum_client::{ClientError, ColumnType};
use thiserror::Error;

/// A value could not be converted into a mutation column slot.
#[derive(Debug, Error)]
pub enum ConvertError {
    /// The source array's physical type does not match the declared column type.
    #[error("column '{column}' has unsupported source type {actual} for declared type {declared}")]
    Mismatch {
        column: String,
        actual: String,
        declared: ColumnType,
    },

    /// A literal string value failed to parse against its column's type.
    #[error("column '{column}': cannot parse '{input}' as {declared}: {reason}")]
    Literal {
        column: String,
        input: String,
        declared: ColumnType,
        reason: String,
    },
}

/// Errors surfaced by [`crate::SinkContext`] write calls.
#[derive(Debug, Error)]
pub enum SinkError {
    /// A key column carried a NULL row value. Keys may never be null.
    #[error("key column '{column}' has a null value")]
    NullKey { column: String },

    /// An input column has no same-named column in the target table.
    #[error("input column '{column}' does not exist in table '{table}'")]
    UnknownColumn { column: String, table: String },

    /// A table key column is absent from the input schema.
    #[error("key column '{column}' is missing from the input schema")]
    MissingKeyColumn { column: String },

    /// A key column was named in a selective update's literal values.
    #[error("key column '{column}' cannot be set from literal values")]
    KeyFromLiterals { column: String },

    /// Per-value conversion or literal parse failure.
    #[error(transparent)]
    Conversion(#[from] ConvertError),

    /// Rows rejected by the cluster. Applied rows stay applied.
    #[error("{count} row(s) failed to apply (failure detail truncated: {overflowed}); sample failures: [{}]", .samples.join("; "))]
    RowFailures {
        count: u64,
        samples: Vec<String>,
        overflowed: bool,
    },

    /// Connection or RPC failure from the client layer.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// An environment variable held an unparseable configuration value.
    #[error("invalid configuration value for {name}: '{value}'")]
    InvalidConfig { name: &'static str, value: String },

    /// A partition task could not be joined (panic or cancellation).
    #[error("partition task failed: {0}")]
    Task(String),
}
