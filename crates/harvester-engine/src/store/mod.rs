//! Object storage collaborator.
//!
//! The engine only talks to storage through [`ObjectStore`]. Two
//! implementations ship with the crate: a directory-backed store used by the
//! daemon and an in-memory store with fault injection used by tests.

mod fs;
mod memory;

pub use fs::FsObjectStore;
pub use memory::MemoryObjectStore;

use crate::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;

/// One object in a live listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    /// Full object key
    pub key: String,
    /// Cheap fingerprint supplied by storage (ETag-style)
    pub revision_tag: String,
}

impl ListingEntry {
    pub fn new(key: impl Into<String>, revision_tag: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            revision_tag: revision_tag.into(),
        }
    }

    /// Folder placeholders end with `/` and are never diffed.
    pub fn is_container_marker(&self) -> bool {
        self.key.ends_with('/')
    }
}

/// An object read unconditionally.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub tag: String,
    pub last_modified: DateTime<Utc>,
}

/// Result of a conditional read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    /// Content differs from the supplied tag
    Modified { body: Vec<u8>, tag: String },
    /// Content still matches the supplied tag
    NotModified,
}

/// Object storage operations needed by the harvester.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List objects under a prefix. `Ok(vec![])` is a genuinely empty prefix;
    /// any failure of the call itself must be an `Err`.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ListingEntry>, StoreError>;

    /// Read an object, `None` when it does not exist.
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<StoredObject>, StoreError>;

    /// Read an object unless its tag still equals `previous_tag`.
    async fn get_if_changed(
        &self,
        bucket: &str,
        key: &str,
        previous_tag: Option<&str>,
    ) -> Result<Fetched, StoreError>;

    /// Write an object, returning its new tag.
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<String, StoreError>;

    /// Delete an object. Deleting an absent key succeeds.
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError>;
}

/// Run a storage call under a timeout, mapping expiry to [`StoreError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_marker() {
        assert!(ListingEntry::new("ws/eodh-config/", "").is_container_marker());
        assert!(!ListingEntry::new("ws/eodh-config/a.json", "t1").is_container_marker());
    }

    #[tokio::test]
    async fn test_with_timeout_elapsed() {
        let result: Result<(), StoreError> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_with_timeout_passthrough() {
        let result = with_timeout(Duration::from_secs(1), async { Ok::<_, StoreError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
