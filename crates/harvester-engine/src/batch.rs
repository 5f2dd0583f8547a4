//! Size-bounded change batches.
//!
//! The emitter persists the ledger before every hand-off, so an emitted
//! batch always reflects a ledger state that is already durable.

use crate::ledger::{LedgerStore, WorkspaceLedger};
use crate::notify::Notifier;
use crate::HarvestError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Delivery queue for a run's batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueTier {
    Standard,
    Bulk,
}

impl QueueTier {
    /// Listings larger than `bulk_minimum` go to the bulk queue.
    pub fn for_listing(listed: usize, bulk_minimum: usize) -> Self {
        if listed > bulk_minimum {
            QueueTier::Bulk
        } else {
            QueueTier::Standard
        }
    }
}

/// One unit handed to the notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub workspace_id: String,
    pub queue: QueueTier,
    /// 1-based index within the run
    pub sequence: u32,
    /// Canonical path -> serialised record
    pub upserts: BTreeMap<String, String>,
    pub deletions: BTreeSet<String>,
}

impl ChangeBatch {
    pub fn new(workspace_id: impl Into<String>, queue: QueueTier, sequence: u32) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            queue,
            sequence,
            upserts: BTreeMap::new(),
            deletions: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.upserts.len() + self.deletions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletions.is_empty()
    }
}

/// Totals reported once a run's emitter is finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitSummary {
    pub batches: u32,
    pub persists: u32,
}

/// Accumulates changes and flushes them in bounded batches.
pub struct BatchEmitter {
    ledgers: LedgerStore,
    notifier: Arc<dyn Notifier>,
    max_entries: usize,
    pending: ChangeBatch,
    committed: WorkspaceLedger,
    summary: EmitSummary,
}

impl BatchEmitter {
    /// `committed` is the ledger state already persisted when the run started.
    pub fn new(
        ledgers: LedgerStore,
        notifier: Arc<dyn Notifier>,
        queue: QueueTier,
        max_entries: usize,
        committed: WorkspaceLedger,
    ) -> Self {
        let pending = ChangeBatch::new(committed.workspace_id(), queue, 1);
        Self {
            ledgers,
            notifier,
            max_entries: max_entries.max(1),
            pending,
            committed,
            summary: EmitSummary::default(),
        }
    }

    pub fn upsert(&mut self, path: impl Into<String>, body: impl Into<String>) {
        let path = path.into();
        self.pending.deletions.remove(&path);
        self.pending.upserts.insert(path, body.into());
    }

    pub fn delete(&mut self, path: impl Into<String>) {
        let path = path.into();
        self.pending.upserts.remove(&path);
        self.pending.deletions.insert(path);
    }

    pub fn pending(&self) -> &ChangeBatch {
        &self.pending
    }

    /// Whether the pending batch reached the size bound.
    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.max_entries
    }

    /// Persist `checkpoint`, then hand the pending batch to the notifier.
    ///
    /// If the hand-off fails the previously committed ledger is written back,
    /// so the next run picks the undelivered entries up again.
    pub async fn flush(&mut self, checkpoint: WorkspaceLedger) -> Result<(), HarvestError> {
        let workspace = checkpoint.workspace_id().to_string();

        self.ledgers
            .persist(&checkpoint)
            .await
            .map_err(|source| HarvestError::Persist {
                workspace: workspace.clone(),
                source,
            })?;
        self.summary.persists += 1;

        if self.pending.is_empty() {
            self.committed = checkpoint;
            return Ok(());
        }

        if let Err(source) = self.notifier.emit(&self.pending).await {
            if let Err(e) = self.ledgers.persist(&self.committed).await {
                warn!(workspace = %workspace, error = %e, "Failed to roll back ledger after emit failure");
            }
            return Err(HarvestError::Emit { workspace, source });
        }

        info!(
            workspace = %workspace,
            sequence = self.pending.sequence,
            upserts = self.pending.upserts.len(),
            deletions = self.pending.deletions.len(),
            queue = ?self.pending.queue,
            "Emitted batch"
        );

        self.summary.batches += 1;
        let next = ChangeBatch::new(
            workspace,
            self.pending.queue,
            self.pending.sequence + 1,
        );
        self.pending = next;
        self.committed = checkpoint;

        Ok(())
    }

    /// Flush the residual batch against the final ledger, or persist the final
    /// ledger alone when nothing is pending.
    pub async fn finish(mut self, final_ledger: WorkspaceLedger) -> Result<EmitSummary, HarvestError> {
        self.flush(final_ledger).await?;
        Ok(self.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::DEFAULT_LEDGER_PREFIX;
    use crate::notify::MemoryNotifier;
    use crate::store::MemoryObjectStore;
    use std::time::Duration;

    fn emitter(
        store: Arc<MemoryObjectStore>,
        notifier: Arc<MemoryNotifier>,
        max_entries: usize,
    ) -> BatchEmitter {
        let ledgers = LedgerStore::new(store, "target", DEFAULT_LEDGER_PREFIX, Duration::from_secs(5));
        BatchEmitter::new(
            ledgers,
            notifier,
            QueueTier::Standard,
            max_entries,
            WorkspaceLedger::empty("alice"),
        )
    }

    #[test]
    fn test_queue_tier_threshold() {
        assert_eq!(QueueTier::for_listing(100, 100), QueueTier::Standard);
        assert_eq!(QueueTier::for_listing(101, 100), QueueTier::Bulk);
    }

    #[test]
    fn test_delete_overrides_pending_upsert() {
        let store = Arc::new(MemoryObjectStore::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let mut emitter = emitter(store, notifier, 10);

        emitter.upsert("catalogs/a", "{}");
        emitter.delete("catalogs/a");
        assert!(emitter.pending().upserts.is_empty());
        assert_eq!(emitter.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_flush_persists_before_emitting() {
        let store = Arc::new(MemoryObjectStore::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let mut emitter = emitter(store.clone(), notifier.clone(), 2);

        emitter.upsert("catalogs/a", "{}");
        assert!(!emitter.is_full());
        emitter.upsert("catalogs/b", "{}");
        assert!(emitter.is_full());

        let mut checkpoint = WorkspaceLedger::empty("alice");
        checkpoint.insert("alice/eodh-config/a.json", "v1");
        emitter.flush(checkpoint).await.unwrap();

        let batches = notifier.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].sequence, 1);
        assert!(store.contains("target", "harvested-metadata/file-harvester/alice"));
        assert!(emitter.pending().is_empty());
        assert_eq!(emitter.pending().sequence, 2);
    }

    #[tokio::test]
    async fn test_finish_without_pending_still_persists() {
        let store = Arc::new(MemoryObjectStore::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let emitter = emitter(store.clone(), notifier.clone(), 10);

        let summary = emitter.finish(WorkspaceLedger::empty("alice")).await.unwrap();
        assert_eq!(summary, EmitSummary { batches: 0, persists: 1 });
        assert!(notifier.batches().is_empty());
        assert!(store.contains("target", "harvested-metadata/file-harvester/alice"));
    }

    #[tokio::test]
    async fn test_emit_failure_rolls_back_ledger() {
        let store = Arc::new(MemoryObjectStore::new());
        let notifier = Arc::new(MemoryNotifier::new());
        notifier.fail_next(1);
        let mut emitter = emitter(store.clone(), notifier.clone(), 10);

        emitter.upsert("catalogs/a", "{}");
        let mut checkpoint = WorkspaceLedger::empty("alice");
        checkpoint.insert("alice/eodh-config/a.json", "v1");

        let result = emitter.flush(checkpoint).await;
        assert!(matches!(result, Err(HarvestError::Emit { .. })));

        let body = store
            .body("target", "harvested-metadata/file-harvester/alice")
            .unwrap();
        assert_eq!(body, b"{}");
    }
}
