//! Harvester Engine - incremental diff-and-reclassification of workspace files.
//!
//! This crate provides:
//! - A per-workspace fingerprint ledger persisted in object storage
//! - Listing diff with deletion by elimination
//! - Canonical path resolution for catalogue entities
//! - Size-bounded change batches with persist-before-emit ordering
//! - A minimum-interval run throttle and one-level cascade deletion

pub mod batch;
pub mod cascade;
pub mod diff;
pub mod entity;
pub mod error;
pub mod harvester;
pub mod ledger;
pub mod notify;
pub mod policy;
pub mod store;
pub mod throttle;

pub use batch::{BatchEmitter, ChangeBatch, EmitSummary, QueueTier};
pub use cascade::CascadeResolver;
pub use diff::{ChangeClassification, DeletedEntry, DiffOutcome, ListingDiff};
pub use entity::{resolve_path, EntityResolver, EntityType, ResolvedEntity};
pub use error::{HarvestError, KeyFailure, NotifyError, StoreError};
pub use harvester::{
    Admission, HarvestOptions, Harvester, KeyFailureRecord, PreparedRun, RunOutcome, RunReport,
};
pub use ledger::{LedgerStore, WorkspaceLedger, DEFAULT_LEDGER_PREFIX};
pub use notify::{HarvestMessage, MemoryNotifier, Notifier, OutboxNotifier, OutboxOptions};
pub use policy::{AccessPolicySink, StoreAccessPolicySink};
pub use store::{FsObjectStore, ListingEntry, MemoryObjectStore, ObjectStore};
pub use throttle::{RunThrottle, ThrottleDecision};
