//! Listing diff against the fingerprint ledger.
//!
//! Keys found in the listing are moved out of the loaded ledger as they are
//! scanned. Whatever is left once the listing is exhausted was deleted.

use crate::ledger::WorkspaceLedger;
use crate::store::ListingEntry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// How a key compares against the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeClassification {
    Unchanged,
    AddedOrUpdated,
    Deleted,
}

/// A ledger entry whose key no longer appears in the listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedEntry {
    pub key: String,
    pub fingerprint: String,
    /// Canonical path recorded for the key, if it ever resolved
    pub path: Option<String>,
}

/// Result of a completed scan.
#[derive(Debug, Clone)]
pub struct DiffOutcome {
    /// Ledger holding exactly the keys present in the listing
    pub ledger: WorkspaceLedger,
    pub deleted: Vec<DeletedEntry>,
}

#[derive(Debug, Clone, Default)]
struct InFlight {
    fingerprint: Option<String>,
    path: Option<String>,
}

/// Diff state for one run.
#[derive(Debug)]
pub struct ListingDiff {
    previous: WorkspaceLedger,
    in_flight: BTreeMap<String, InFlight>,
    current: WorkspaceLedger,
}

impl ListingDiff {
    /// Start a diff from the ledger loaded at run start.
    pub fn new(ledger: WorkspaceLedger) -> Self {
        let mut current = WorkspaceLedger::empty(ledger.workspace_id());
        current.set_last_persisted_at(ledger.last_persisted_at());
        Self {
            previous: ledger,
            in_flight: BTreeMap::new(),
            current,
        }
    }

    /// Classify one listing entry. Container markers yield `None`.
    pub fn classify(&mut self, entry: &ListingEntry) -> Option<ChangeClassification> {
        if entry.is_container_marker() {
            return None;
        }

        let key = entry.key.as_str();

        // A key listed twice keeps whatever the first sighting decided
        if self.current.contains(key) || self.in_flight.contains_key(key) {
            return Some(ChangeClassification::Unchanged);
        }

        let fingerprint = self.previous.take(key);
        let path = self.previous.take_path(key);

        if fingerprint.as_deref() == Some(entry.revision_tag.as_str()) {
            self.current.insert(key, entry.revision_tag.clone());
            if let Some(path) = path {
                self.current.set_path(key, path);
            }
            return Some(ChangeClassification::Unchanged);
        }

        debug!(key = %key, previous = ?fingerprint, tag = %entry.revision_tag, "Key changed");
        self.in_flight
            .insert(key.to_string(), InFlight { fingerprint, path });
        Some(ChangeClassification::AddedOrUpdated)
    }

    /// Fingerprint recorded for an in-flight key before this run.
    pub fn previous_fingerprint(&self, key: &str) -> Option<&str> {
        self.in_flight.get(key)?.fingerprint.as_deref()
    }

    /// Canonical path recorded for an in-flight key before this run.
    pub fn previous_path(&self, key: &str) -> Option<&str> {
        self.in_flight.get(key)?.path.as_deref()
    }

    /// Content was fetched: record the new fingerprint and path.
    pub fn commit(&mut self, key: &str, tag: impl Into<String>, path: Option<String>) {
        self.in_flight.remove(key);
        self.current.insert(key, tag);
        if let Some(path) = path {
            self.current.set_path(key, path);
        }
    }

    /// Storage answered "not modified": keep the previous fingerprint, since
    /// no newer tag was confirmed.
    pub fn retain(&mut self, key: &str) {
        self.restore(key);
    }

    /// Fetch failed: put the previous entry back untouched. A key that had no
    /// previous entry stays unrecorded and is retried next run.
    pub fn restore(&mut self, key: &str) {
        if let Some(InFlight { fingerprint, path }) = self.in_flight.remove(key) {
            if let Some(fingerprint) = fingerprint {
                self.current.insert(key, fingerprint);
                if let Some(path) = path {
                    self.current.set_path(key, path);
                }
            }
        }
    }

    /// Complete state to persist at a mid-run batch boundary.
    ///
    /// Unresolved and not-yet-scanned keys keep their old fingerprints, so a
    /// crash after this point never loses a deletion signal.
    pub fn checkpoint(&self) -> WorkspaceLedger {
        let mut ledger = self.current.clone();
        for (key, in_flight) in &self.in_flight {
            if let Some(fingerprint) = &in_flight.fingerprint {
                if !ledger.contains(key) {
                    ledger.insert(key.clone(), fingerprint.clone());
                    if let Some(path) = &in_flight.path {
                        ledger.set_path(key.clone(), path.clone());
                    }
                }
            }
        }
        ledger.absorb(self.previous.clone());
        ledger
    }

    /// Number of keys still waiting for their fetch to resolve.
    pub fn pending(&self) -> usize {
        self.in_flight.len()
    }

    /// End the scan. Residual ledger keys are the deleted set.
    pub fn finish(mut self) -> DiffOutcome {
        let unresolved: Vec<String> = self.in_flight.keys().cloned().collect();
        for key in unresolved {
            self.restore(&key);
        }

        let mut deleted = Vec::new();
        let keys: Vec<String> = self.previous.keys().map(str::to_string).collect();
        for key in keys {
            let path = self.previous.take_path(&key);
            if let Some(fingerprint) = self.previous.take(&key) {
                deleted.push(DeletedEntry {
                    key,
                    fingerprint,
                    path,
                });
            }
        }

        DiffOutcome {
            ledger: self.current,
            deleted,
        }
    }
}
