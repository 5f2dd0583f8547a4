//! Harvester error types.
//!
//! Run-level failures ([`HarvestError`]) abort a run. Per-key failures
//! ([`KeyFailure`]) are logged and skipped; the run carries on.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by an object store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Key does not exist in the bucket
    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// Bucket does not exist
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    /// I/O error from a filesystem-backed store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Call exceeded the configured storage timeout
    #[error("Storage call timed out after {0:?}")]
    Timeout(Duration),

    /// Any other backend failure
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Errors raised when handing a batch to the downstream notifier.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// Writing an output object failed
    #[error("Failed to write output {key}: {source}")]
    Output {
        key: String,
        #[source]
        source: StoreError,
    },

    /// Appending to the message transport failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Message could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for NotifyError {
    fn from(e: serde_json::Error) -> Self {
        NotifyError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for NotifyError {
    fn from(e: std::io::Error) -> Self {
        NotifyError::Transport(e.to_string())
    }
}

/// Per-key failures. The key is skipped and the run continues.
#[derive(Debug, Error)]
pub enum KeyFailure {
    /// Content could not be read; the ledger entry is left untouched so the
    /// key is retried on the next run.
    #[error("Fetch failed: {0}")]
    Fetch(#[from] StoreError),

    /// Content is not a valid structured record
    #[error("Invalid JSON: {0}")]
    Parse(String),

    /// Record cannot be placed (unknown type, missing id, item without parent)
    #[error("Classification failed: {0}")]
    Classification(String),

    /// Access-policy document could not be forwarded
    #[error("Access policy routing failed: {0}")]
    Policy(String),
}

impl KeyFailure {
    /// Whether the key's previous ledger entry must be kept so the key is
    /// retried next run.
    pub fn retains_ledger_entry(&self) -> bool {
        matches!(self, KeyFailure::Fetch(_) | KeyFailure::Policy(_))
    }
}

/// Run-level failures. The run aborts immediately.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// Listing call failed; no deletions are inferred
    #[error("Listing failed for {workspace}: {source}")]
    Listing {
        workspace: String,
        #[source]
        source: StoreError,
    },

    /// Ledger could not be persisted
    #[error("Ledger persist failed for {workspace}: {source}")]
    Persist {
        workspace: String,
        #[source]
        source: StoreError,
    },

    /// Batch hand-off to the notifier failed
    #[error("Batch emission failed for {workspace}: {source}")]
    Emit {
        workspace: String,
        #[source]
        source: NotifyError,
    },
}

impl HarvestError {
    /// Workspace the failed run belonged to.
    pub fn workspace(&self) -> &str {
        match self {
            HarvestError::Listing { workspace, .. }
            | HarvestError::Persist { workspace, .. }
            | HarvestError::Emit { workspace, .. } => workspace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::NotFound {
            bucket: "source".to_string(),
            key: "ws/eodh-config/a.json".to_string(),
        };
        assert!(err.to_string().contains("source/ws/eodh-config/a.json"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: StoreError = io_err.into();
        assert!(matches!(err, StoreError::Io(_)));
    }

    #[test]
    fn test_fetch_failure_retains_entry() {
        let fetch = KeyFailure::Fetch(StoreError::Backend("boom".to_string()));
        assert!(fetch.retains_ledger_entry());
        assert!(!KeyFailure::Parse("eof".to_string()).retains_ledger_entry());
        assert!(!KeyFailure::Classification("no id".to_string()).retains_ledger_entry());
    }

    #[test]
    fn test_harvest_error_workspace() {
        let err = HarvestError::Listing {
            workspace: "alice".to_string(),
            source: StoreError::BucketNotFound("source".to_string()),
        };
        assert_eq!(err.workspace(), "alice");
        assert!(err.to_string().contains("Listing failed for alice"));
    }
}
