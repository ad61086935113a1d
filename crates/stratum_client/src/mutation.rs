//! Pending mutations built by the write path.

use serde::{Deserialize, Serialize};

use crate::table::Value;

/// The declared kind of a mutation batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    /// Insert a new row; fails per-row when the key already exists.
    Insert,
    /// Insert or overwrite by key.
    Upsert,
    /// Update an existing row; fails per-row when the key is absent.
    Update,
    /// Delete by key; fails per-row when the key is absent.
    Delete,
}

impl MutationKind {
    /// Stable lowercase name used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            MutationKind::Insert => "insert",
            MutationKind::Upsert => "upsert",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        }
    }
}

/// Per-column change carried by one mutation.
///
/// `Unset` and `Null` differ on the wire: an unset cell preserves any
/// stored value on update-like operations, an explicit null overwrites it.
#[derive(Debug, Clone, PartialEq)]
pub enum CellChange {
    /// Leave the stored value untouched.
    Unset,
    /// Store an explicit NULL.
    Null,
    /// Store the given value.
    Set(Value),
}

/// One pending change of a declared kind, bound to a table's column order.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    kind: MutationKind,
    cells: Vec<CellChange>,
}

impl Mutation {
    /// Creates a mutation with every cell unset, sized to the table width.
    pub fn new(kind: MutationKind, width: usize) -> Self {
        Self {
            kind,
            cells: vec![CellChange::Unset; width],
        }
    }

    /// Sets the cell at `column` to `value`.
    pub fn set(&mut self, column: usize, value: Value) {
        self.cells[column] = CellChange::Set(value);
    }

    /// Sets the cell at `column` to an explicit NULL.
    pub fn set_null(&mut self, column: usize) {
        self.cells[column] = CellChange::Null;
    }

    /// The declared mutation kind.
    pub fn kind(&self) -> MutationKind {
        self.kind
    }

    /// The per-column changes, indexed by table column order.
    pub fn cells(&self) -> &[CellChange] {
        &self.cells
    }
}
