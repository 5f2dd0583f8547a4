//! Access-policy routing.
//!
//! Access-control documents are not catalogue entities. They are handed to a
//! separate sink and never appear in a change batch.

use crate::store::{with_timeout, ObjectStore};
use crate::StoreError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Receives access-control documents found in a workspace.
#[async_trait]
pub trait AccessPolicySink: Send + Sync {
    async fn apply(&self, workspace_id: &str, key: &str, body: &[u8]) -> Result<(), StoreError>;
}

/// Forwards documents to `<bucket>/<workspace>/access-policy.json` for the
/// policy translator.
pub struct StoreAccessPolicySink {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    timeout: Duration,
}

impl StoreAccessPolicySink {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, timeout: Duration) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            timeout,
        }
    }

    pub fn policy_key(workspace_id: &str) -> String {
        format!("{workspace_id}/access-policy.json")
    }
}

#[async_trait]
impl AccessPolicySink for StoreAccessPolicySink {
    async fn apply(&self, workspace_id: &str, key: &str, body: &[u8]) -> Result<(), StoreError> {
        let target = Self::policy_key(workspace_id);
        with_timeout(
            self.timeout,
            self.store.put(&self.bucket, &target, body.to_vec()),
        )
        .await?;

        info!(workspace = %workspace_id, key = %key, target = %target, "Forwarded access policy");

        Ok(())
    }
}
