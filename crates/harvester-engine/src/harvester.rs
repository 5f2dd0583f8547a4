//! Run orchestration.
//!
//! A run is: throttle gate, ledger load, listing, diff, concurrent fetches
//! applied by a single writer, batching, deletion inference, cascade, final
//! flush. Listing failures abort before anything is persisted or emitted.

use crate::batch::{BatchEmitter, QueueTier};
use crate::cascade::{collection_path, CascadeResolver};
use crate::diff::{ChangeClassification, DeletedEntry, DiffOutcome, ListingDiff};
use crate::entity::{EntityResolver, EntityType};
use crate::ledger::{LedgerStore, WorkspaceLedger, DEFAULT_LEDGER_PREFIX};
use crate::notify::Notifier;
use crate::policy::AccessPolicySink;
use crate::store::{with_timeout, Fetched, ObjectStore};
use crate::throttle::{RunThrottle, ThrottleDecision};
use crate::{HarvestError, KeyFailure, StoreError};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Engine settings for harvest runs.
#[derive(Debug, Clone)]
pub struct HarvestOptions {
    /// Bucket holding workspace files
    pub source_bucket: String,
    /// Bucket holding ledgers
    pub target_bucket: String,
    /// Directory inside each workspace that holds catalogue records
    pub config_dir: String,
    pub ledger_prefix: String,
    /// Maximum upserts + deletions per batch
    pub max_entries: usize,
    pub minimum_interval: Duration,
    pub fetch_concurrency: usize,
    pub storage_timeout: Duration,
    /// Listings larger than this go to the bulk queue
    pub bulk_queue_minimum: usize,
    pub access_policy_suffix: String,
    /// Remove source objects of cascaded items
    pub delete_cascaded_sources: bool,
}

impl Default for HarvestOptions {
    fn default() -> Self {
        Self {
            source_bucket: "workspaces-source".to_string(),
            target_bucket: "workspaces-harvested".to_string(),
            config_dir: "eodh-config".to_string(),
            ledger_prefix: DEFAULT_LEDGER_PREFIX.to_string(),
            max_entries: 1000,
            minimum_interval: Duration::from_secs(10),
            fetch_concurrency: 8,
            storage_timeout: Duration::from_secs(30),
            bulk_queue_minimum: 100,
            access_policy_suffix: "/access-policy.json".to_string(),
            delete_cascaded_sources: true,
        }
    }
}

/// A run that passed the throttle and holds its loaded ledger.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    workspace_id: String,
    ledger: WorkspaceLedger,
    admitted_at: DateTime<Utc>,
}

impl PreparedRun {
    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn admitted_at(&self) -> DateTime<Utc> {
        self.admitted_at
    }
}

/// Result of the throttle gate.
#[derive(Debug)]
pub enum Admission {
    Accepted(PreparedRun),
    TooSoon { retry_after: Duration },
}

/// Result of a full run request.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(RunReport),
    Throttled { retry_after: Duration },
}

/// A key skipped during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFailureRecord {
    pub key: String,
    pub reason: String,
    /// Whether the previous ledger entry was kept so the key is retried
    pub retained: bool,
}

/// What a completed run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub workspace_id: String,
    pub queue: QueueTier,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub listed: usize,
    pub unchanged: usize,
    /// Keys fetched and emitted as upserts
    pub changed: Vec<String>,
    /// Keys inferred deleted
    pub deleted: Vec<String>,
    /// Canonical paths emitted for `deleted`
    pub deleted_paths: Vec<String>,
    /// Item paths deleted because their collection went away
    pub cascaded: Vec<String>,
    pub policies_forwarded: usize,
    pub failures: Vec<KeyFailureRecord>,
    pub batches: u32,
    pub persists: u32,
}

impl RunReport {
    fn new(workspace_id: &str, queue: QueueTier, started_at: DateTime<Utc>) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            queue,
            started_at,
            finished_at: started_at,
            listed: 0,
            unchanged: 0,
            changed: Vec::new(),
            deleted: Vec::new(),
            deleted_paths: Vec::new(),
            cascaded: Vec::new(),
            policies_forwarded: 0,
            failures: Vec::new(),
            batches: 0,
            persists: 0,
        }
    }
}

/// Incremental harvester for workspace files.
pub struct Harvester {
    store: Arc<dyn ObjectStore>,
    notifier: Arc<dyn Notifier>,
    policy: Arc<dyn AccessPolicySink>,
    options: HarvestOptions,
    ledgers: LedgerStore,
    throttle: RunThrottle,
}

impl Harvester {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        notifier: Arc<dyn Notifier>,
        policy: Arc<dyn AccessPolicySink>,
        options: HarvestOptions,
    ) -> Self {
        let ledgers = LedgerStore::new(
            store.clone(),
            options.target_bucket.clone(),
            options.ledger_prefix.clone(),
            options.storage_timeout,
        );
        let throttle = RunThrottle::new(options.minimum_interval);

        Self {
            store,
            notifier,
            policy,
            options,
            ledgers,
            throttle,
        }
    }

    pub fn options(&self) -> &HarvestOptions {
        &self.options
    }

    pub fn ledgers(&self) -> &LedgerStore {
        &self.ledgers
    }

    /// Load the ledger and apply the throttle. Never lists storage.
    pub async fn admit(&self, workspace_id: &str) -> Admission {
        let ledger = self.ledgers.load(workspace_id).await;
        let now = Utc::now();

        match self.throttle.check(ledger.last_persisted_at(), now) {
            ThrottleDecision::TooSoon { retry_after } => {
                info!(
                    workspace = %workspace_id,
                    retry_after_secs = retry_after.as_secs_f64(),
                    "Harvest rejected, previous run too recent"
                );
                Admission::TooSoon { retry_after }
            }
            ThrottleDecision::Proceed => Admission::Accepted(PreparedRun {
                workspace_id: workspace_id.to_string(),
                ledger,
                admitted_at: now,
            }),
        }
    }

    /// Admit and execute in one call.
    pub async fn run(&self, workspace_id: &str) -> Result<RunOutcome, HarvestError> {
        match self.admit(workspace_id).await {
            Admission::TooSoon { retry_after } => Ok(RunOutcome::Throttled { retry_after }),
            Admission::Accepted(prepared) => self.execute(prepared).await.map(RunOutcome::Completed),
        }
    }

    /// Execute an admitted run.
    pub async fn execute(&self, prepared: PreparedRun) -> Result<RunReport, HarvestError> {
        let span = info_span!("harvest", workspace = %prepared.workspace_id);
        self.execute_inner(prepared).instrument(span).await
    }

    async fn execute_inner(&self, prepared: PreparedRun) -> Result<RunReport, HarvestError> {
        let PreparedRun {
            workspace_id,
            ledger,
            admitted_at,
        } = prepared;
        let options = &self.options;
        let resolver = EntityResolver::new(
            &workspace_id,
            &options.config_dir,
            &options.access_policy_suffix,
        );

        let listing = with_timeout(
            options.storage_timeout,
            self.store.list(&options.source_bucket, resolver.key_prefix()),
        )
        .await
        .map_err(|source| {
            error!(workspace = %workspace_id, error = %source, "Listing failed, run aborted");
            HarvestError::Listing {
                workspace: workspace_id.clone(),
                source,
            }
        })?;

        let entries: Vec<_> = listing
            .into_iter()
            .filter(|entry| !entry.is_container_marker())
            .collect();
        let queue = QueueTier::for_listing(entries.len(), options.bulk_queue_minimum);

        info!(
            workspace = %workspace_id,
            listed = entries.len(),
            previous = ledger.len(),
            queue = ?queue,
            "Harvesting workspace"
        );

        let mut run = RunState {
            harvester: self,
            workspace_id: workspace_id.clone(),
            resolver,
            diff: ListingDiff::new(ledger.clone()),
            emitter: BatchEmitter::new(
                self.ledgers.clone(),
                self.notifier.clone(),
                queue,
                options.max_entries,
                ledger,
            ),
            report: RunReport::new(&workspace_id, queue, admitted_at),
        };
        run.report.listed = entries.len();

        let mut changed = Vec::new();
        for entry in &entries {
            match run.diff.classify(entry) {
                Some(ChangeClassification::Unchanged) => run.report.unchanged += 1,
                Some(ChangeClassification::AddedOrUpdated) => {
                    let previous = run.diff.previous_fingerprint(&entry.key).map(str::to_string);
                    changed.push((entry.key.clone(), previous));
                }
                Some(ChangeClassification::Deleted) | None => {}
            }
        }

        let store = &self.store;
        let bucket = options.source_bucket.as_str();
        let timeout = options.storage_timeout;
        let mut fetches = stream::iter(changed)
            .map(move |(key, previous)| async move {
                let result =
                    with_timeout(timeout, store.get_if_changed(bucket, &key, previous.as_deref()))
                        .await;
                (key, result)
            })
            .buffered(options.fetch_concurrency.max(1));

        while let Some((key, result)) = fetches.next().await {
            run.apply_fetch(key, result).await;
            if run.emitter.is_full() {
                let checkpoint = run.diff.checkpoint();
                run.emitter.flush(checkpoint).await?;
            }
        }

        run.finish().await
    }
}

/// Mutable state of one run. Only this writer touches the diff and batch.
struct RunState<'a> {
    harvester: &'a Harvester,
    workspace_id: String,
    resolver: EntityResolver,
    diff: ListingDiff,
    emitter: BatchEmitter,
    report: RunReport,
}

impl RunState<'_> {
    async fn apply_fetch(&mut self, key: String, result: Result<Fetched, StoreError>) {
        let (body, tag) = match result {
            Ok(Fetched::Modified { body, tag }) => (body, tag),
            Ok(Fetched::NotModified) => {
                debug!(key = %key, "Not modified since listing");
                self.diff.retain(&key);
                self.report.unchanged += 1;
                return;
            }
            Err(e) => {
                self.skip(key, KeyFailure::Fetch(e), None);
                return;
            }
        };

        if self.resolver.is_access_policy(&key) {
            match self
                .harvester
                .policy
                .apply(&self.workspace_id, &key, &body)
                .await
            {
                Ok(()) => {
                    self.diff.commit(&key, tag, None);
                    self.report.policies_forwarded += 1;
                }
                Err(e) => self.skip(key, KeyFailure::Policy(e.to_string()), None),
            }
            return;
        }

        match self.resolver.resolve(&key, &body) {
            Ok(entity) => {
                if let Some(old_path) = self.diff.previous_path(&key) {
                    if old_path != entity.canonical_path {
                        debug!(key = %key, from = %old_path, to = %entity.canonical_path, "Entity moved");
                        self.emitter.delete(old_path.to_string());
                    }
                }

                debug!(
                    key = %key,
                    entity_type = %entity.entity_type,
                    path = %entity.canonical_path,
                    "Resolved entity"
                );

                self.emitter
                    .upsert(entity.canonical_path.clone(), entity.body);
                self.diff.commit(&key, tag, Some(entity.canonical_path));
                self.report.changed.push(key);
            }
            Err(failure) => self.skip(key, failure, Some(tag)),
        }
    }

    /// Record a per-key failure. Failures that keep the ledger entry restore
    /// it; the rest record the new fingerprint so the key is not refetched
    /// until it changes again.
    fn skip(&mut self, key: String, failure: KeyFailure, tag: Option<String>) {
        warn!(workspace = %self.workspace_id, key = %key, error = %failure, "Skipping key");

        let retained = failure.retains_ledger_entry() || tag.is_none();
        match tag {
            Some(tag) if !retained => {
                let path = self.diff.previous_path(&key).map(str::to_string);
                self.diff.commit(&key, tag, path);
            }
            _ => self.diff.restore(&key),
        }

        self.report.failures.push(KeyFailureRecord {
            key,
            reason: failure.to_string(),
            retained,
        });
    }

    async fn finish(self) -> Result<RunReport, HarvestError> {
        let RunState {
            harvester,
            workspace_id,
            resolver,
            diff,
            mut emitter,
            mut report,
        } = self;

        let DiffOutcome { mut ledger, deleted } = diff.finish();

        if !deleted.is_empty() {
            info!(workspace = %workspace_id, count = deleted.len(), "Deleted keys found");
        }

        // A renamed or duplicated record keeps its path through the surviving key
        let live_paths: BTreeSet<String> = ledger.paths().values().cloned().collect();

        // Deletions not yet handed to the emitter stay in every checkpoint
        let mut unsent = WorkspaceLedger::empty(&workspace_id);
        for entry in &deleted {
            unsent.insert(entry.key.clone(), entry.fingerprint.clone());
            if let Some(path) = &entry.path {
                unsent.set_path(entry.key.clone(), path.clone());
            }
        }

        for entry in &deleted {
            unsent.remove(&entry.key);
            report.deleted.push(entry.key.clone());

            if resolver.is_access_policy(&entry.key) {
                continue;
            }

            let Some(path) = deletion_path(&resolver, entry) else {
                warn!(workspace = %workspace_id, key = %entry.key, "No canonical path for deleted key, deletion not emitted");
                continue;
            };
            if live_paths.contains(&path) {
                debug!(key = %entry.key, path = %path, "Path still held by a listed key, deletion skipped");
                continue;
            }
            emitter.delete(path.clone());
            report.deleted_paths.push(path);

            if emitter.is_full() {
                let mut checkpoint = ledger.clone();
                checkpoint.absorb(unsent.clone());
                emitter.flush(checkpoint).await?;
            }
        }

        let cascade = CascadeResolver::new(
            deleted
                .iter()
                .map(|entry| (resolver.key_stem(&entry.key), entry.path.as_deref())),
        );

        if !cascade.is_empty() {
            let candidates: Vec<String> = ledger.keys().map(str::to_string).collect();
            for key in candidates {
                let path = match ledger.path(&key) {
                    Some(path) => Some(path.to_string()),
                    None => harvester.read_item_path(&resolver, &key).await,
                };
                let Some(path) = path else {
                    continue;
                };
                if !cascade.orphans(&path) {
                    continue;
                }

                info!(workspace = %workspace_id, key = %key, path = %path, "Parent collection deleted, deleting item");
                emitter.delete(path.clone());
                report.cascaded.push(path);

                if harvester.options.delete_cascaded_sources {
                    match with_timeout(
                        harvester.options.storage_timeout,
                        harvester.store.delete(&harvester.options.source_bucket, &key),
                    )
                    .await
                    {
                        Ok(()) => {
                            ledger.remove(&key);
                        }
                        Err(e) => {
                            warn!(workspace = %workspace_id, key = %key, error = %e, "Failed to delete cascaded source object");
                        }
                    }
                }

                if emitter.is_full() {
                    emitter.flush(ledger.clone()).await?;
                }
            }
        }

        let summary = emitter.finish(ledger).await?;

        report.batches = summary.batches;
        report.persists = summary.persists;
        report.finished_at = Utc::now();

        info!(
            workspace = %workspace_id,
            changed = report.changed.len(),
            deleted = report.deleted.len(),
            cascaded = report.cascaded.len(),
            failures = report.failures.len(),
            batches = report.batches,
            "Harvest complete"
        );

        Ok(report)
    }
}

/// Canonical path to emit for a deleted key. Without a recorded path only the
/// `<catalog>_$_<collection>` naming convention can place it.
fn deletion_path(resolver: &EntityResolver, entry: &DeletedEntry) -> Option<String> {
    match &entry.path {
        Some(path) => Some(path.clone()),
        None => collection_path(resolver.key_stem(&entry.key), None),
    }
}

impl Harvester {
    /// Re-read a key without a recorded path and return its canonical path
    /// when it is an item.
    async fn read_item_path(&self, resolver: &EntityResolver, key: &str) -> Option<String> {
        if resolver.is_access_policy(key) {
            return None;
        }

        let object = match with_timeout(
            self.options.storage_timeout,
            self.store.get(&self.options.source_bucket, key),
        )
        .await
        {
            Ok(Some(object)) => object,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "Cascade candidate unreadable, skipping");
                return None;
            }
        };

        match resolver.resolve(key, &object.body) {
            Ok(entity) if entity.entity_type == EntityType::Item => Some(entity.canonical_path),
            Ok(_) => None,
            Err(e) => {
                debug!(key = %key, error = %e, "Cascade candidate unresolvable");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MemoryNotifier;
    use crate::policy::StoreAccessPolicySink;
    use crate::store::MemoryObjectStore;

    fn harvester(store: Arc<MemoryObjectStore>, notifier: Arc<MemoryNotifier>) -> Harvester {
        let policy = Arc::new(StoreAccessPolicySink::new(
            store.clone(),
            "access-control",
            Duration::from_secs(5),
        ));
        let options = HarvestOptions {
            source_bucket: "source".to_string(),
            target_bucket: "target".to_string(),
            minimum_interval: Duration::ZERO,
            ..HarvestOptions::default()
        };
        Harvester::new(store, notifier, policy, options)
    }

    #[tokio::test]
    async fn test_access_policy_is_routed_not_batched() {
        let store = Arc::new(MemoryObjectStore::new());
        store.create_bucket("target");
        store.insert("source", "alice/eodh-config/access-policy.json", r#"{"public":true}"#);
        let notifier = Arc::new(MemoryNotifier::new());

        let RunOutcome::Completed(report) = harvester(store.clone(), notifier.clone())
            .run("alice")
            .await
            .unwrap()
        else {
            panic!("run was throttled");
        };

        assert_eq!(report.policies_forwarded, 1);
        assert!(report.changed.is_empty());
        assert!(notifier.batches().is_empty());
        assert!(store.contains("access-control", "alice/access-policy.json"));
    }

    #[tokio::test]
    async fn test_parse_failure_records_fingerprint() {
        let store = Arc::new(MemoryObjectStore::new());
        store.create_bucket("target");
        let tag = store.insert("source", "alice/eodh-config/broken.json", "{not json");
        let notifier = Arc::new(MemoryNotifier::new());
        let harvester = harvester(store.clone(), notifier);

        let RunOutcome::Completed(report) = harvester.run("alice").await.unwrap() else {
            panic!("run was throttled");
        };
        assert_eq!(report.failures.len(), 1);
        assert!(!report.failures[0].retained);

        let ledger = harvester.ledgers().load("alice").await;
        assert_eq!(ledger.fingerprint("alice/eodh-config/broken.json"), Some(tag.as_str()));
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_previous_entry() {
        let store = Arc::new(MemoryObjectStore::new());
        store.create_bucket("target");
        store.insert("source", "alice/eodh-config/cat.json", r#"{"type":"Catalog","id":"cat"}"#);
        let notifier = Arc::new(MemoryNotifier::new());
        let harvester = harvester(store.clone(), notifier);

        harvester.run("alice").await.unwrap();
        let before = harvester.ledgers().load("alice").await;

        store.insert("source", "alice/eodh-config/cat.json", r#"{"type":"Catalog","id":"cat2"}"#);
        store.fail_reads_of("alice/eodh-config/cat.json");

        let RunOutcome::Completed(report) = harvester.run("alice").await.unwrap() else {
            panic!("run was throttled");
        };
        assert!(report.failures[0].retained);
        assert!(report.deleted.is_empty());

        let after = harvester.ledgers().load("alice").await;
        assert_eq!(after.entries(), before.entries());
    }

    #[tokio::test]
    async fn test_moved_entity_deletes_old_path() {
        let store = Arc::new(MemoryObjectStore::new());
        store.create_bucket("target");
        store.insert("source", "alice/eodh-config/col.json", r#"{"type":"Collection","id":"col"}"#);
        let notifier = Arc::new(MemoryNotifier::new());
        let harvester = harvester(store.clone(), notifier.clone());
        harvester.run("alice").await.unwrap();

        store.insert(
            "source",
            "alice/eodh-config/col.json",
            r#"{"type":"Collection","id":"col","links":[{"rel":"parent","href":"catalogs/cat"}]}"#,
        );
        harvester.run("alice").await.unwrap();

        let batches = notifier.batches();
        let last = batches.last().unwrap();
        assert!(last.deletions.contains("collections/col"));
        assert!(last.upserts.contains_key("catalogs/cat/collections/col"));
    }
}
