//! Error types for tern-core

use thiserror::Error;

/// Result type alias using tern-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tern-core operations
///
/// The first group is the sync taxonomy: each kind carries its own propagation
/// policy (see [`Error::is_retryable`]). The second group wraps infrastructure
/// failures from the local stores.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed local mutation; rejected before it reaches the queue
    #[error("Validation error: {0}")]
    Validation(String),

    /// Authentication failure while opening an envelope (tampering or wrong key)
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// Network or backend failure talking to the remote store
    #[error("Remote store unavailable: {0}")]
    RemoteTransient(String),

    /// The remote store refused the request outright
    #[error("Remote store rejected request: {0}")]
    RemoteRejected(String),

    /// The remote holds a tombstone the upload would revive without a restore
    #[error("Remote copy of record {0} is deleted")]
    RemoteTombstoned(String),

    /// Local and remote state disagree in a way the protocol forbids
    #[error("Consistency fault on record {record_id}: {reason}")]
    ConsistencyFault { record_id: String, reason: String },

    /// Compaction could not bring the queue under its ceiling
    #[error("Sync queue overflow: {pending} pending operations (ceiling {ceiling})")]
    QueueOverflow { pending: usize, ceiling: usize },

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Key derivation or sealing failure that is not an authentication failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the sync engine should retry the failed pass with backoff.
    ///
    /// Only remote transient failures are retried. Decryption failures cannot
    /// succeed with the same key, and validation/consistency problems need a
    /// human.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RemoteTransient(_))
    }

    pub(crate) fn consistency(record_id: impl ToString, reason: impl Into<String>) -> Self {
        Self::ConsistencyFault {
            record_id: record_id.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_remote_transient_is_retryable() {
        assert!(Error::RemoteTransient("timeout".into()).is_retryable());
        assert!(!Error::RemoteRejected("400".into()).is_retryable());
        assert!(!Error::RemoteTombstoned("rec-1".into()).is_retryable());
        assert!(!Error::Decryption("tag mismatch".into()).is_retryable());
        assert!(!Error::Validation("bad".into()).is_retryable());
        assert!(!Error::consistency("abc", "diverged").is_retryable());
        assert!(!Error::QueueOverflow {
            pending: 101,
            ceiling: 100
        }
        .is_retryable());
    }

    #[test]
    fn consistency_fault_mentions_record() {
        let error = Error::consistency("rec-1", "equal version diverged");
        assert!(error.to_string().contains("rec-1"));
        assert!(error.to_string().contains("equal version diverged"));
    }
}
