//! Cluster RPC contract and the in-memory implementation used by tests.
//!
//! The trait mirrors the wire surface a real Stratum deployment exposes:
//! schema resolution, batched mutation apply, watermark reads, credential
//! hand-off. [`InMemoryCluster`] implements the same contract over a
//! process-local table map so session and pipeline behavior can be
//! exercised without a running cluster.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::connection::{Connection, ConnectionConfig, Connector, Credential};
use crate::error::ClientError;
use crate::mutation::{CellChange, Mutation, MutationKind};
use crate::table::{TableSchema, Value};

/// One mutation tagged with its row-order surrogate within a session.
#[derive(Debug, Clone)]
pub struct SequencedMutation {
    /// Row index surrogate: position of the source row within its partition.
    pub seq: u64,
    /// The pending change.
    pub mutation: Mutation,
}

/// Per-row failure reported by the cluster for one apply batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    /// Row index surrogate of the rejected mutation.
    pub row: u64,
    /// Human-readable status describing the rejection.
    pub status: String,
}

/// Result of applying one mutation batch.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// Rows the cluster rejected; accepted rows stay applied.
    pub row_failures: Vec<RowError>,
    /// The cluster's logical write time after this batch.
    pub watermark: u64,
}

/// Returns `true` when `status` encodes a duplicate-key rejection.
pub fn is_duplicate_row_status(status: &str) -> bool {
    status.contains("key already present")
}

/// Wire surface of one Stratum cluster, as seen by a single connection.
#[async_trait]
pub trait ClusterRpc: Send + Sync + 'static {
    /// Resolves the named table's ordered column list.
    async fn open_table(&self, name: &str) -> Result<TableSchema, ClientError>;

    /// Applies a batch of mutations to `table` in order.
    ///
    /// Individual row rejections are reported in the outcome, not as an
    /// `Err`; `Err` means the batch as a whole could not be delivered.
    async fn apply_batch(
        &self,
        table: &str,
        batch: Vec<SequencedMutation>,
    ) -> Result<ApplyOutcome, ClientError>;

    /// The cluster's current logical write time.
    async fn current_watermark(&self) -> Result<u64, ClientError>;

    /// Reads back one row by key tuple. Test and verification support.
    async fn read_row(
        &self,
        table: &str,
        key: Vec<Value>,
    ) -> Result<Option<Vec<Option<Value>>>, ClientError>;

    /// Exports the opaque authentication credential bound to this channel.
    async fn export_credential(&self) -> Result<Credential, ClientError>;

    /// Imports a credential exported from another connection.
    async fn import_credential(&self, credential: Credential) -> Result<(), ClientError>;

    /// Releases transport resources. Idempotency is the caller's concern.
    async fn close(&self) -> Result<(), ClientError> {
        Ok(())
    }
}

struct TableState {
    schema: TableSchema,
    rows: BTreeMap<Vec<u8>, Vec<Option<Value>>>,
}

/// Process-local cluster holding tables in ordinary maps.
///
/// Mutation semantics match the real cluster: inserts reject existing
/// keys, updates and deletes reject missing keys, upserts do either, and
/// unset cells preserve stored values on update-like operations. Each
/// applied batch advances a logical clock that doubles as the watermark.
pub struct InMemoryCluster {
    tables: Mutex<HashMap<String, TableState>>,
    clock: AtomicU64,
    token: Vec<u8>,
    imported: Mutex<Option<Credential>>,
}

impl InMemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tables: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
            token: b"stratum-inmemory-token".to_vec(),
            imported: Mutex::new(None),
        })
    }

    /// Registers a table. Test setup; DDL passthrough is out of scope here.
    pub fn create_table(&self, name: impl Into<String>, schema: TableSchema) {
        let mut tables = self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tables.insert(
            name.into(),
            TableState {
                schema,
                rows: BTreeMap::new(),
            },
        );
    }

    /// Number of stored rows in `table`, or `None` when it does not exist.
    pub fn row_count(&self, table: &str) -> Option<usize> {
        let tables = self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tables.get(table).map(|t| t.rows.len())
    }

    /// Synchronous read-back used by tests that already hold the cluster.
    pub fn get_row(&self, table: &str, key: &[Value]) -> Option<Vec<Option<Value>>> {
        let tables = self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let state = tables.get(table)?;
        state.rows.get(&encode_key(key)).cloned()
    }

    /// The credential most recently imported into this cluster's channel.
    pub fn imported_credential(&self) -> Option<Credential> {
        self.imported.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    fn apply_one(
        state: &mut TableState,
        seq: u64,
        mutation: &Mutation,
        failures: &mut Vec<RowError>,
    ) {
        let TableState {
            ref schema,
            ref mut rows,
        } = *state;
        let key = match extract_key(schema, mutation) {
            Ok(key) => key,
            Err(status) => {
                failures.push(RowError { row: seq, status });
                return;
            }
        };

        match mutation.kind() {
            MutationKind::Insert => {
                if rows.contains_key(&key) {
                    failures.push(RowError {
                        row: seq,
                        status: "key already present".to_string(),
                    });
                    return;
                }
                match materialize_row(schema, mutation) {
                    Ok(row) => {
                        rows.insert(key, row);
                    }
                    Err(status) => failures.push(RowError { row: seq, status }),
                }
            }
            MutationKind::Upsert => {
                if let Some(stored) = rows.get(&key).cloned() {
                    match apply_changes(schema, stored, mutation) {
                        Ok(row) => {
                            rows.insert(key, row);
                        }
                        Err(status) => failures.push(RowError { row: seq, status }),
                    }
                } else {
                    match materialize_row(schema, mutation) {
                        Ok(row) => {
                            rows.insert(key, row);
                        }
                        Err(status) => failures.push(RowError { row: seq, status }),
                    }
                }
            }
            MutationKind::Update => {
                let Some(stored) = rows.get(&key).cloned() else {
                    failures.push(RowError {
                        row: seq,
                        status: "no row with the given key".to_string(),
                    });
                    return;
                };
                match apply_changes(schema, stored, mutation) {
                    Ok(row) => {
                        rows.insert(key, row);
                    }
                    Err(status) => failures.push(RowError { row: seq, status }),
                }
            }
            MutationKind::Delete => {
                if rows.remove(&key).is_none() {
                    failures.push(RowError {
                        row: seq,
                        status: "no row with the given key".to_string(),
                    });
                }
            }
        }
    }
}

/// Encodes a key tuple into the map key.
fn encode_key(key: &[Value]) -> Vec<u8> {
    let mut out = Vec::new();
    for value in key {
        value.encode_key_cell(&mut out);
    }
    out
}

/// Extracts the primary-key byte tuple from a mutation's cells.
fn extract_key(schema: &TableSchema, mutation: &Mutation) -> Result<Vec<u8>, String> {
    let mut out = Vec::new();
    for idx in schema.key_indexes() {
        match &mutation.cells()[idx] {
            CellChange::Set(value) => value.encode_key_cell(&mut out),
            CellChange::Null | CellChange::Unset => {
                return Err(format!(
                    "key column '{}' not set",
                    schema.columns()[idx].name
                ));
            }
        }
    }
    Ok(out)
}

/// Builds a fresh stored row for insert-like operations.
///
/// Unset cells become stored NULLs; non-nullable columns reject both
/// explicit and implicit NULLs.
fn materialize_row(schema: &TableSchema, mutation: &Mutation) -> Result<Vec<Option<Value>>, String> {
    let mut row = Vec::with_capacity(schema.width());
    for (idx, column) in schema.columns().iter().enumerate() {
        let stored = match &mutation.cells()[idx] {
            CellChange::Set(value) => Some(value.clone()),
            CellChange::Null | CellChange::Unset => None,
        };
        if stored.is_none() && !column.nullable {
            return Err(format!(
                "null value in non-nullable column '{}'",
                column.name
            ));
        }
        row.push(stored);
    }
    Ok(row)
}

/// Applies a mutation's cells over an existing row. Unset cells keep the
/// stored value.
fn apply_changes(
    schema: &TableSchema,
    mut row: Vec<Option<Value>>,
    mutation: &Mutation,
) -> Result<Vec<Option<Value>>, String> {
    for (idx, column) in schema.columns().iter().enumerate() {
        match &mutation.cells()[idx] {
            CellChange::Unset => {}
            CellChange::Null => {
                if !column.nullable {
                    return Err(format!(
                        "null value in non-nullable column '{}'",
                        column.name
                    ));
                }
                row[idx] = None;
            }
            CellChange::Set(value) => row[idx] = Some(value.clone()),
        }
    }
    Ok(row)
}

#[async_trait]
impl ClusterRpc for InMemoryCluster {
    async fn open_table(&self, name: &str) -> Result<TableSchema, ClientError> {
        let tables = self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tables
            .get(name)
            .map(|t| t.schema.clone())
            .ok_or_else(|| ClientError::TableNotFound(name.to_string()))
    }

    async fn apply_batch(
        &self,
        table: &str,
        batch: Vec<SequencedMutation>,
    ) -> Result<ApplyOutcome, ClientError> {
        let mut tables = self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let state = tables
            .get_mut(table)
            .ok_or_else(|| ClientError::TableNotFound(table.to_string()))?;

        let mut failures = Vec::new();
        for item in &batch {
            Self::apply_one(state, item.seq, &item.mutation, &mut failures);
        }
        let watermark = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ApplyOutcome {
            row_failures: failures,
            watermark,
        })
    }

    async fn current_watermark(&self) -> Result<u64, ClientError> {
        Ok(self.clock.load(Ordering::SeqCst))
    }

    async fn read_row(
        &self,
        table: &str,
        key: Vec<Value>,
    ) -> Result<Option<Vec<Option<Value>>>, ClientError> {
        let tables = self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let state = tables
            .get(table)
            .ok_or_else(|| ClientError::TableNotFound(table.to_string()))?;
        Ok(state.rows.get(&encode_key(&key)).cloned())
    }

    async fn export_credential(&self) -> Result<Credential, ClientError> {
        Ok(Credential(self.token.clone()))
    }

    async fn import_credential(&self, credential: Credential) -> Result<(), ClientError> {
        if credential.0 != self.token {
            return Err(ClientError::CredentialRejected(
                "token does not match this cluster".to_string(),
            ));
        }
        *self.imported.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(credential);
        Ok(())
    }
}

/// Connector that resolves addresses against named in-memory clusters.
pub struct InMemoryConnector {
    clusters: Mutex<HashMap<String, Arc<InMemoryCluster>>>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self {
            clusters: Mutex::new(HashMap::new()),
        }
    }

    /// Makes `cluster` reachable at `addr`.
    pub fn register(&self, addr: impl Into<String>, cluster: Arc<InMemoryCluster>) {
        let mut clusters = self.clusters.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clusters.insert(addr.into(), cluster);
    }
}

impl Default for InMemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Connection, ClientError> {
        let clusters = self.clusters.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let cluster = config
            .addrs
            .iter()
            .find_map(|addr| clusters.get(addr))
            .ok_or_else(|| ClientError::Connect {
                addrs: config.addrs.clone(),
                reason: "no registered cluster at any address".to_string(),
            })?;
        Ok(Connection::new(
            config.clone(),
            Arc::clone(cluster) as Arc<dyn ClusterRpc>,
        ))
    }
}
