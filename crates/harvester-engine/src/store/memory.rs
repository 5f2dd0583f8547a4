//! In-memory object store with call accounting and fault injection.

use super::{Fetched, ListingEntry, ObjectStore, StoredObject};
use crate::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Clone)]
struct MemoryObject {
    body: Vec<u8>,
    tag: String,
    last_modified: DateTime<Utc>,
}

/// Object store held entirely in memory.
///
/// Tags are monotonically increasing version markers (`v1`, `v2`, ...), like
/// an opaque ETag. Every call is counted so tests can assert that a run made
/// no listing call or no reads at all.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), MemoryObject>>,
    buckets: Mutex<HashSet<String>>,
    failing_reads: Mutex<HashSet<String>>,
    fail_listing: Mutex<Option<String>>,
    next_version: AtomicU64,
    list_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    put_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a bucket exist without any objects in it.
    pub fn create_bucket(&self, bucket: &str) {
        self.buckets.lock().insert(bucket.to_string());
    }

    /// Insert or replace an object directly, bypassing call accounting.
    pub fn insert(&self, bucket: &str, key: &str, body: impl Into<Vec<u8>>) -> String {
        let tag = self.next_tag();
        self.create_bucket(bucket);
        self.objects.lock().insert(
            (bucket.to_string(), key.to_string()),
            MemoryObject {
                body: body.into(),
                tag: tag.clone(),
                last_modified: Utc::now(),
            },
        );
        tag
    }

    /// Remove an object directly, bypassing call accounting.
    pub fn remove(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .lock()
            .remove(&(bucket.to_string(), key.to_string()))
            .is_some()
    }

    /// Current body of an object.
    pub fn body(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.body.clone())
    }

    /// Whether an object exists.
    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .lock()
            .contains_key(&(bucket.to_string(), key.to_string()))
    }

    /// Keys present in a bucket.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .lock()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Override the last-modified timestamp of an object.
    pub fn set_last_modified(&self, bucket: &str, key: &str, at: DateTime<Utc>) {
        if let Some(object) = self
            .objects
            .lock()
            .get_mut(&(bucket.to_string(), key.to_string()))
        {
            object.last_modified = at;
        }
    }

    /// Make every listing call fail with the given message (`None` to heal).
    pub fn fail_listing(&self, message: Option<&str>) {
        *self.fail_listing.lock() = message.map(str::to_string);
    }

    /// Make reads of a key fail.
    pub fn fail_reads_of(&self, key: &str) {
        self.failing_reads.lock().insert(key.to_string());
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn next_tag(&self) -> String {
        format!("v{}", self.next_version.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn check_read(&self, key: &str) -> Result<(), StoreError> {
        if self.failing_reads.lock().contains(key) {
            return Err(StoreError::Backend(format!("Injected read failure for {key}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ListingEntry>, StoreError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(message) = self.fail_listing.lock().clone() {
            return Err(StoreError::Backend(message));
        }
        if !self.buckets.lock().contains(bucket) {
            return Err(StoreError::BucketNotFound(bucket.to_string()));
        }

        Ok(self
            .objects
            .lock()
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((_, k), o)| ListingEntry::new(k.clone(), o.tag.clone()))
            .collect())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<StoredObject>, StoreError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.check_read(key)?;

        Ok(self
            .objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| StoredObject {
                body: o.body.clone(),
                tag: o.tag.clone(),
                last_modified: o.last_modified,
            }))
    }

    async fn get_if_changed(
        &self,
        bucket: &str,
        key: &str,
        previous_tag: Option<&str>,
    ) -> Result<Fetched, StoreError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.check_read(key)?;

        let objects = self.objects.lock();
        let object = objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;

        if previous_tag == Some(object.tag.as_str()) {
            return Ok(Fetched::NotModified);
        }

        Ok(Fetched::Modified {
            body: object.body.clone(),
            tag: object.tag.clone(),
        })
    }

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<String, StoreError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.insert(bucket, key, body))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.remove(bucket, key);
        Ok(())
    }
}
