//! Directory-backed object store.
//!
//! Each bucket is a directory under the store root and object keys are
//! `/`-separated paths relative to it. Revision tags are SHA-256 digests of
//! the content, so they change exactly when the content does.

use super::{Fetched, ListingEntry, ObjectStore, StoredObject};
use crate::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Object store rooted at a local directory.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Create a store rooted at `root`. Buckets are created lazily on write.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compute the revision tag for a body.
    pub fn content_tag(body: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(body);
        format!("{:x}", hasher.finalize())
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf, StoreError> {
        validate_segment(bucket)?;
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StoreError> {
        let mut path = self.bucket_dir(bucket)?;
        for segment in key.split('/').filter(|s| !s.is_empty()) {
            validate_segment(segment)?;
            path.push(segment);
        }
        Ok(path)
    }

    async fn read_object(&self, path: &Path) -> Result<Option<StoredObject>, StoreError> {
        let body = match tokio::fs::read(path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let metadata = tokio::fs::metadata(path).await?;
        let last_modified: DateTime<Utc> = metadata.modified()?.into();

        Ok(Some(StoredObject {
            tag: Self::content_tag(&body),
            body,
            last_modified,
        }))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ListingEntry>, StoreError> {
        let bucket_dir = self.bucket_dir(bucket)?;
        if !tokio::fs::try_exists(&bucket_dir).await? {
            return Err(StoreError::BucketNotFound(bucket.to_string()));
        }

        let mut entries = Vec::new();
        collect_entries(&bucket_dir, "", prefix, &mut entries).await?;
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        debug!(bucket = %bucket, prefix = %prefix, count = entries.len(), "Listed objects");

        Ok(entries)
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<StoredObject>, StoreError> {
        let path = self.object_path(bucket, key)?;
        self.read_object(&path).await
    }

    async fn get_if_changed(
        &self,
        bucket: &str,
        key: &str,
        previous_tag: Option<&str>,
    ) -> Result<Fetched, StoreError> {
        let path = self.object_path(bucket, key)?;
        let object = self
            .read_object(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;

        if previous_tag == Some(object.tag.as_str()) {
            return Ok(Fetched::NotModified);
        }

        Ok(Fetched::Modified {
            body: object.body,
            tag: object.tag,
        })
    }

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<String, StoreError> {
        let path = self.object_path(bucket, key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::Backend(format!("Invalid object key: {key}")))?;
        tokio::fs::create_dir_all(parent).await?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| StoreError::Backend(format!("Invalid object key: {key}")))?;

        // Atomic write: write to temp file, then rename
        let temp_path = parent.join(format!(".{file_name}.tmp"));
        tokio::fs::write(&temp_path, &body).await?;
        tokio::fs::rename(&temp_path, &path).await?;

        debug!(bucket = %bucket, key = %key, size = body.len(), "Stored object");

        Ok(Self::content_tag(&body))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(bucket = %bucket, key = %key, "Deleted object");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Reject path segments that would escape the bucket directory.
fn validate_segment(segment: &str) -> Result<(), StoreError> {
    if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
        return Err(StoreError::Backend(format!(
            "Invalid path segment: {segment:?}"
        )));
    }
    Ok(())
}

/// Recursively collect listing entries below `dir`.
///
/// Hidden files are in-progress atomic writes and are skipped.
async fn collect_entries(
    dir: &Path,
    relative: &str,
    prefix: &str,
    out: &mut Vec<ListingEntry>,
) -> Result<(), StoreError> {
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }

        let key = format!("{relative}{name}");

        if entry.file_type().await?.is_dir() {
            let marker = format!("{key}/");
            // Descend only where the prefix can still match
            if marker.starts_with(prefix) || prefix.starts_with(&marker) {
                if marker.starts_with(prefix) {
                    out.push(ListingEntry::new(marker.clone(), ""));
                }
                Box::pin(collect_entries(&entry.path(), &marker, prefix, out)).await?;
            }
        } else if key.starts_with(prefix) {
            let body = tokio::fs::read(entry.path()).await?;
            out.push(ListingEntry::new(key, FsObjectStore::content_tag(&body)));
        }
    }

    Ok(())
}
