//! Connections to a Stratum cluster and the factory seam used to build them.
//!
//! A [`Connection`] is shared by every task in the process that resolved
//! the same [`ConnectionConfig`]; sharing is arranged by the caller (the
//! write pipeline keeps a process-wide cache). The connection tracks the
//! highest logical write time it has observed so that later operations on
//! any connection advanced to that watermark see all earlier writes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::cluster::ClusterRpc;
use crate::error::ClientError;
use crate::table::TableHandle;

/// Identity of a cacheable connection.
///
/// Value-equal configs must collapse to one live connection per process;
/// the derived `Eq`/`Hash` make the config usable as a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionConfig {
    /// Cluster coordinator addresses, tried in order.
    pub addrs: Vec<String>,
    /// Optional socket read timeout applied to every RPC on the connection.
    pub socket_read_timeout: Option<Duration>,
}

impl ConnectionConfig {
    /// Builds a config with no read timeout.
    pub fn new(addrs: Vec<String>) -> Self {
        Self {
            addrs,
            socket_read_timeout: None,
        }
    }

    /// Returns the same identity with a socket read timeout set.
    pub fn with_socket_read_timeout(mut self, timeout: Duration) -> Self {
        self.socket_read_timeout = Some(timeout);
        self
    }
}

/// Opaque authentication capability token.
///
/// Obtained once from an authenticated connection and imported into
/// worker connections before their first RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential(pub Vec<u8>);

/// Factory seam for building connections.
///
/// The real transport lives behind this trait; tests inject
/// [`crate::cluster::InMemoryConnector`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establishes a connection for `config`, or fails without side effects.
    async fn connect(&self, config: &ConnectionConfig) -> Result<Connection, ClientError>;
}

/// An open connection to one Stratum cluster.
pub struct Connection {
    config: ConnectionConfig,
    rpc: Arc<dyn ClusterRpc>,
    watermark: AtomicU64,
    closed: AtomicBool,
}

impl Connection {
    /// Wraps an established RPC channel. Used by [`Connector`] implementations.
    pub fn new(config: ConnectionConfig, rpc: Arc<dyn ClusterRpc>) -> Self {
        Self {
            config,
            rpc,
            watermark: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// The identity this connection was built from.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub(crate) fn rpc(&self) -> &Arc<dyn ClusterRpc> {
        &self.rpc
    }

    /// Resolves the named table's schema into a partition-scoped handle.
    pub async fn open_table(&self, name: &str) -> Result<TableHandle, ClientError> {
        let schema = self.rpc.open_table(name).await?;
        Ok(TableHandle::new(name.to_string(), schema))
    }

    /// The highest logical write time this connection has observed.
    pub fn observed_watermark(&self) -> u64 {
        self.watermark.load(Ordering::SeqCst)
    }

    /// Advances the observed watermark to `max(current, to)`.
    pub fn advance_watermark(&self, to: u64) {
        self.watermark.fetch_max(to, Ordering::SeqCst);
    }

    /// Exports the connection's authentication credential for hand-off.
    pub async fn export_credential(&self) -> Result<Credential, ClientError> {
        self.rpc.export_credential().await
    }

    /// Imports a credential exported by another connection.
    pub async fn import_credential(&self, credential: Credential) -> Result<(), ClientError> {
        self.rpc.import_credential(credential).await
    }

    /// Closes the connection. Idempotent; only the first call tears down.
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(addrs = ?self.config.addrs, "closing stratum connection");
        self.rpc.close().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("config", &self.config)
            .field("watermark", &self.watermark.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
