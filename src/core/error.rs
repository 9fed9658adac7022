//! Error types and retryability classification.
//!
//! Warden distinguishes three failure classes at the metadata-store boundary:
//! transient store failures (buffered and replayed), logical rejections
//! (resolved locally), and watch-registration loss (fatal: a stale watch
//! would silently violate the revision-ordering rule).

use thiserror::Error;

/// Common Warden error conditions.
#[derive(Debug, Error)]
pub enum WardenError {
    /// Transient metadata-store failure (timeout, unavailable, transaction
    /// abort). Safe to buffer in the replay buffer and retry on the next
    /// successful sync.
    #[error("metadata store unavailable: {message}")]
    StoreUnavailable { message: String },

    /// The store rejected the write because the expected version did not
    /// match. Resolved by re-reading before retrying.
    #[error("version conflict on {key}: expected {expected}, store has {actual}")]
    VersionConflict {
        key: String,
        expected: i64,
        actual: i64,
    },

    /// The store or a remote node reported the key/instance as absent.
    /// On a kill path this is treated as success plus a convergence
    /// force-delete.
    #[error("not found: {key}")]
    NotFound { key: String },

    /// Watch registration failed after bounded retry. The owning process
    /// must terminate rather than operate on a stale view.
    #[error("watch registration timed out for prefix {prefix}")]
    WatchRegistrationTimeout { prefix: String },

    /// The placement layer could not be reached within the bounded retry
    /// budget.
    #[error("placement layer unreachable: {message}")]
    PlacementUnavailable { message: String },

    /// A stored record failed to decode.
    #[error("invalid record under {key}: {source}")]
    InvalidRecord {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// The control actor has shut down and can no longer accept requests.
    #[error("control plane stopped")]
    ControlStopped,

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl WardenError {
    /// Whether the failed operation should be recorded in the replay buffer
    /// and retried on the next sync cycle.
    ///
    /// Only transport-level store failures qualify; logical rejections
    /// (version conflict, not-found) have dedicated local resolutions.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }

    /// Whether this error must take the whole process down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::WatchRegistrationTimeout { .. })
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }
}

/// Result alias for Warden operations.
pub type WardenResult<T> = Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_unavailable_is_retryable() {
        assert!(WardenError::store_unavailable("etcd timeout").is_retryable());
        assert!(!WardenError::not_found("instances/a").is_retryable());
        assert!(!WardenError::VersionConflict {
            key: "instances/a".into(),
            expected: 3,
            actual: 5,
        }
        .is_retryable());
    }

    #[test]
    fn watch_timeout_is_fatal() {
        let err = WardenError::WatchRegistrationTimeout {
            prefix: "instances/".into(),
        };
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }
}
