//! Fingerprint ledger.
//!
//! The ledger records, per workspace, the fingerprint of every object key
//! seen by the last run. It is persisted as a JSON object `key -> fingerprint`
//! at a deterministic path in the target bucket, next to a sidecar holding
//! the canonical path each key resolved to.

use crate::store::{with_timeout, ObjectStore};
use crate::StoreError;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default location of ledgers inside the target bucket.
pub const DEFAULT_LEDGER_PREFIX: &str = "harvested-metadata/file-harvester";

/// Suffix of the canonical-path sidecar document.
const PATHS_SUFFIX: &str = ".paths";

/// Last-seen fingerprints for one workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLedger {
    workspace_id: String,
    entries: BTreeMap<String, String>,
    paths: BTreeMap<String, String>,
    last_persisted_at: DateTime<Utc>,
}

impl WorkspaceLedger {
    /// An empty ledger, as if the workspace had never been harvested.
    pub fn empty(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            entries: BTreeMap::new(),
            paths: BTreeMap::new(),
            last_persisted_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// Build a ledger from fingerprints alone.
    pub fn from_entries(
        workspace_id: impl Into<String>,
        entries: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        let mut ledger = Self::empty(workspace_id);
        ledger.entries = entries.into_iter().collect();
        ledger
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn last_persisted_at(&self) -> DateTime<Utc> {
        self.last_persisted_at
    }

    pub fn set_last_persisted_at(&mut self, at: DateTime<Utc>) {
        self.last_persisted_at = at;
    }

    /// Fingerprint recorded for a key.
    pub fn fingerprint(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Canonical path recorded for a key.
    pub fn path(&self, key: &str) -> Option<&str> {
        self.paths.get(key).map(String::as_str)
    }

    /// Remove and return the fingerprint of a key.
    pub fn take(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    /// Remove and return the canonical path of a key.
    pub fn take_path(&mut self, key: &str) -> Option<String> {
        self.paths.remove(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, fingerprint: impl Into<String>) {
        self.entries.insert(key.into(), fingerprint.into());
    }

    pub fn set_path(&mut self, key: impl Into<String>, path: impl Into<String>) {
        self.paths.insert(key.into(), path.into());
    }

    /// Remove a key and its path entirely.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.paths.remove(key);
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    pub fn paths(&self) -> &BTreeMap<String, String> {
        &self.paths
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Move every entry of `other` into this ledger, keeping existing ones.
    pub fn absorb(&mut self, other: WorkspaceLedger) {
        for (key, fingerprint) in other.entries {
            self.entries.entry(key).or_insert(fingerprint);
        }
        for (key, path) in other.paths {
            self.paths.entry(key).or_insert(path);
        }
    }

    /// Drop paths whose key has no fingerprint.
    fn prune_paths(&mut self) {
        let entries = &self.entries;
        self.paths.retain(|key, _| entries.contains_key(key));
    }
}

/// Loads and persists workspace ledgers through an object store.
#[derive(Clone)]
pub struct LedgerStore {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
    timeout: Duration,
}

impl LedgerStore {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            prefix: prefix.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// Object key of a workspace's ledger.
    pub fn ledger_key(&self, workspace_id: &str) -> String {
        format!("{}/{}", self.prefix, workspace_id)
    }

    fn paths_key(&self, workspace_id: &str) -> String {
        format!("{}{}", self.ledger_key(workspace_id), PATHS_SUFFIX)
    }

    /// Load a workspace ledger.
    ///
    /// Never fails: a missing or unreadable ledger yields an empty one stamped
    /// with the Unix epoch, so the first run is never blocked.
    pub async fn load(&self, workspace_id: &str) -> WorkspaceLedger {
        let mut ledger = WorkspaceLedger::empty(workspace_id);
        let key = self.ledger_key(workspace_id);

        let object = match with_timeout(self.timeout, self.store.get(&self.bucket, &key)).await {
            Ok(Some(object)) => object,
            Ok(None) => {
                debug!(workspace = %workspace_id, "No previous ledger");
                return ledger;
            }
            Err(e) => {
                warn!(workspace = %workspace_id, error = %e, "Ledger read failed, starting empty");
                return ledger;
            }
        };

        match serde_json::from_slice::<BTreeMap<String, String>>(&object.body) {
            Ok(entries) => {
                ledger.entries = entries;
                ledger.last_persisted_at = object.last_modified;
            }
            Err(e) => {
                warn!(workspace = %workspace_id, error = %e, "Ledger unparsable, starting empty");
                return ledger;
            }
        }

        ledger.paths = self.load_paths(workspace_id).await;
        ledger.prune_paths();

        debug!(
            workspace = %workspace_id,
            entries = ledger.len(),
            last_persisted_at = %ledger.last_persisted_at,
            "Loaded ledger"
        );

        ledger
    }

    async fn load_paths(&self, workspace_id: &str) -> BTreeMap<String, String> {
        let key = self.paths_key(workspace_id);
        match with_timeout(self.timeout, self.store.get(&self.bucket, &key)).await {
            Ok(Some(object)) => serde_json::from_slice(&object.body).unwrap_or_else(|e| {
                warn!(workspace = %workspace_id, error = %e, "Path index unparsable, ignoring");
                BTreeMap::new()
            }),
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                warn!(workspace = %workspace_id, error = %e, "Path index read failed, ignoring");
                BTreeMap::new()
            }
        }
    }

    /// Overwrite the persisted ledger with the complete given state.
    ///
    /// The fingerprint document is written before the path sidecar; a reader
    /// that sees new fingerprints with stale paths only loses path hints.
    pub async fn persist(&self, ledger: &WorkspaceLedger) -> Result<(), StoreError> {
        let workspace_id = ledger.workspace_id();

        let entries = serde_json::to_vec(&ledger.entries)
            .map_err(|e| StoreError::Backend(format!("Ledger serialization failed: {e}")))?;
        let paths = serde_json::to_vec(&ledger.paths)
            .map_err(|e| StoreError::Backend(format!("Path index serialization failed: {e}")))?;

        with_timeout(
            self.timeout,
            self.store
                .put(&self.bucket, &self.ledger_key(workspace_id), entries),
        )
        .await?;
        with_timeout(
            self.timeout,
            self.store.put(&self.bucket, &self.paths_key(workspace_id), paths),
        )
        .await?;

        debug!(workspace = %workspace_id, entries = ledger.len(), "Persisted ledger");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryObjectStore;

    fn ledger_store(store: Arc<MemoryObjectStore>) -> LedgerStore {
        LedgerStore::new(store, "target", DEFAULT_LEDGER_PREFIX, Duration::from_secs(5))
    }

    #[test]
    fn test_take_removes_entry() {
        let mut ledger = WorkspaceLedger::from_entries(
            "alice",
            [("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())],
        );

        assert_eq!(ledger.take("a").as_deref(), Some("1"));
        assert_eq!(ledger.take("a"), None);
        assert_eq!(ledger.keys().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn test_absorb_keeps_existing() {
        let mut ledger = WorkspaceLedger::from_entries("alice", [("a".into(), "new".into())]);
        let older = WorkspaceLedger::from_entries(
            "alice",
            [("a".into(), "old".into()), ("b".into(), "2".into())],
        );

        ledger.absorb(older);
        assert_eq!(ledger.fingerprint("a"), Some("new"));
        assert_eq!(ledger.fingerprint("b"), Some("2"));
    }

    #[tokio::test]
    async fn test_load_missing_is_empty_epoch() {
        let store = Arc::new(MemoryObjectStore::new());
        let ledgers = ledger_store(store);

        let ledger = ledgers.load("alice").await;
        assert!(ledger.is_empty());
        assert_eq!(ledger.last_persisted_at(), DateTime::<Utc>::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn test_load_unparsable_is_empty_epoch() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("target", "harvested-metadata/file-harvester/alice", "not json");
        let ledgers = ledger_store(store);

        let ledger = ledgers.load("alice").await;
        assert!(ledger.is_empty());
        assert_eq!(ledger.last_persisted_at(), DateTime::<Utc>::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn test_load_read_failure_is_empty() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("target", "harvested-metadata/file-harvester/alice", "{}");
        store.fail_reads_of("harvested-metadata/file-harvester/alice");
        let ledgers = ledger_store(store);

        assert!(ledgers.load("alice").await.is_empty());
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let store = Arc::new(MemoryObjectStore::new());
        let ledgers = ledger_store(store.clone());

        let mut ledger = WorkspaceLedger::empty("alice");
        ledger.insert("alice/eodh-config/cat.json", "v1");
        ledger.set_path("alice/eodh-config/cat.json", "catalogs/cat");
        ledgers.persist(&ledger).await.unwrap();

        let body = store
            .body("target", "harvested-metadata/file-harvester/alice")
            .unwrap();
        let raw: BTreeMap<String, String> = serde_json::from_slice(&body).unwrap();
        assert_eq!(raw.get("alice/eodh-config/cat.json").map(String::as_str), Some("v1"));

        let loaded = ledgers.load("alice").await;
        assert_eq!(loaded.entries(), ledger.entries());
        assert_eq!(loaded.path("alice/eodh-config/cat.json"), Some("catalogs/cat"));
        assert!(loaded.last_persisted_at() > DateTime::<Utc>::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn test_load_prunes_orphan_paths() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("target", "harvested-metadata/file-harvester/alice", r#"{"a":"1"}"#);
        store.insert(
            "target",
            "harvested-metadata/file-harvester/alice.paths",
            r#"{"a":"catalogs/a","gone":"catalogs/gone"}"#,
        );
        let ledgers = ledger_store(store);

        let ledger = ledgers.load("alice").await;
        assert_eq!(ledger.path("a"), Some("catalogs/a"));
        assert_eq!(ledger.path("gone"), None);
    }
}
