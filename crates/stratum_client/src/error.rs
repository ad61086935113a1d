//! Error types for the Stratum client.

use thiserror::Error;

/// Errors surfaced by connections, sessions, and cluster RPCs.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No connection could be established to any of the configured addresses.
    #[error("failed to connect to stratum cluster at {addrs:?}: {reason}")]
    Connect { addrs: Vec<String>, reason: String },

    /// The named table does not exist on the cluster.
    #[error("table '{0}' not found")]
    TableNotFound(String),

    /// A table schema failed validation.
    #[error("invalid table schema: {0}")]
    InvalidSchema(String),

    /// An RPC against the cluster failed.
    #[error("rpc failure: {0}")]
    Rpc(String),

    /// The session's background flusher is no longer running.
    #[error("write session terminated: {0}")]
    SessionClosed(String),

    /// The cluster rejected the presented authentication credential.
    #[error("authentication credential rejected: {0}")]
    CredentialRejected(String),
}

/// Convenience alias used throughout the client crate.
pub type Result<T> = std::result::Result<T, ClientError>;
