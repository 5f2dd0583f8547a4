//! Workspace registry with in-flight tracking and an LRU of recent runs.
//!
//! A workspace can only have one run in flight. The guard returned by
//! [`WorkspaceRegistry::try_begin`] releases the slot when dropped, so a
//! panicking run task never leaves its workspace locked.

use crate::CoreError;
use chrono::{DateTime, Utc};
use harvester_engine::RunReport;
use harvester_ipc::{RunStatus, RunSummary};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Reject ids that cannot name a single top-level workspace prefix.
pub fn validate_workspace_id(workspace_id: &str) -> Result<(), CoreError> {
    let invalid = workspace_id.trim().is_empty()
        || workspace_id.contains('/')
        || workspace_id.contains("..");
    if invalid {
        return Err(CoreError::InvalidWorkspace(workspace_id.to_string()));
    }
    Ok(())
}

/// Summarize a completed run for `last-run` queries
pub fn completed_summary(report: &RunReport) -> RunSummary {
    RunSummary {
        workspace: report.workspace_id.clone(),
        status: RunStatus::Completed,
        started_at: report.started_at.timestamp(),
        finished_at: report.finished_at.timestamp(),
        listed: report.listed,
        changed: report.changed.len(),
        deleted: report.deleted.len(),
        cascaded: report.cascaded.len(),
        failures: report.failures.len(),
        batches: report.batches,
        error: None,
    }
}

pub fn failed_summary(workspace_id: &str, started_at: DateTime<Utc>, error: String) -> RunSummary {
    RunSummary {
        workspace: workspace_id.to_string(),
        status: RunStatus::Failed,
        started_at: started_at.timestamp(),
        finished_at: Utc::now().timestamp(),
        listed: 0,
        changed: 0,
        deleted: 0,
        cascaded: 0,
        failures: 0,
        batches: 0,
        error: Some(error),
    }
}

/// Tracks running workspaces and their most recent run summaries
pub struct WorkspaceRegistry {
    active: Arc<Mutex<HashSet<String>>>,
    recent: Mutex<LruCache<String, RunSummary>>,
}

impl WorkspaceRegistry {
    /// Create a registry remembering the last run of `capacity` workspaces
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);

        Self {
            active: Arc::new(Mutex::new(HashSet::new())),
            recent: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Claim the workspace for a run. `None` while another run holds it.
    pub fn try_begin(&self, workspace_id: &str) -> Option<RunGuard> {
        let mut active = self.active.lock();
        if !active.insert(workspace_id.to_string()) {
            return None;
        }

        Some(RunGuard {
            workspace_id: workspace_id.to_string(),
            active: self.active.clone(),
        })
    }

    pub fn is_running(&self, workspace_id: &str) -> bool {
        self.active.lock().contains(workspace_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Store the summary of a finished run
    pub fn record(&self, summary: RunSummary) {
        self.recent.lock().put(summary.workspace.clone(), summary);
    }

    pub fn last_run(&self, workspace_id: &str) -> Option<RunSummary> {
        self.recent.lock().get(workspace_id).cloned()
    }
}

/// Holds a workspace's run slot until dropped
#[derive(Debug)]
pub struct RunGuard {
    workspace_id: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl RunGuard {
    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.workspace_id);
    }
}
