//! Process-wide connection cache.
//!
//! At most one live connection exists per [`ConnectionConfig`] per
//! process. Construction happens while the cache lock is held, so two
//! tasks racing on the same identity can never build two connections.
//! The cache is an owned object injected into the pipeline rather than
//! ambient global state; `shutdown_all` is the single owner of every
//! cached connection's teardown.

use std::collections::HashMap;
use std::sync::Arc;

use stratum_client::{ClientError, Connection, ConnectionConfig, Connector};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Registry mapping connection identities to shared live connections.
pub struct ConnectionCache {
    connector: Arc<dyn Connector>,
    entries: Mutex<HashMap<ConnectionConfig, Arc<Connection>>>,
}

impl ConnectionCache {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached connection for `config`, building it first if
    /// absent. A construction failure propagates and leaves no entry
    /// behind.
    pub async fn acquire(&self, config: &ConnectionConfig) -> Result<Arc<Connection>, ClientError> {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(config) {
            return Ok(Arc::clone(existing));
        }
        let conn = Arc::new(self.connector.connect(config).await?);
        entries.insert(config.clone(), Arc::clone(&conn));
        info!(addrs = ?config.addrs, timeout = ?config.socket_read_timeout, "opened stratum connection");
        Ok(conn)
    }

    /// Number of live cached connections.
    pub async fn cached(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Test hook: closes and forgets every cached connection so that the
    /// process-exit teardown has nothing left to close twice.
    pub async fn reset_for_tests(&self) {
        self.close_all().await;
    }

    /// Process-exit teardown. Closes each connection exactly once;
    /// close failures are logged and never raised, so one bad connection
    /// cannot block teardown of the rest.
    pub async fn shutdown_all(&self) {
        self.close_all().await;
    }

    async fn close_all(&self) {
        let drained: Vec<(ConnectionConfig, Arc<Connection>)> = {
            let mut entries = self.entries.lock().await;
            entries.drain().collect()
        };
        for (config, conn) in drained {
            if let Err(err) = conn.close().await {
                warn!(addrs = ?config.addrs, error = %err, "failed to close stratum connection during teardown");
            } else {
                info!(addrs = ?config.addrs, "closed stratum connection");
            }
        }
    }
}
