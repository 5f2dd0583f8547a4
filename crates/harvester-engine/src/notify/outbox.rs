//! Outbox notifier.
//!
//! Each upsert is written as an output object in the target bucket and each
//! deletion removes one. A harvest message describing the batch is then
//! appended to a per-topic JSON-lines outbox that the transport relays.

use super::Notifier;
use crate::batch::{ChangeBatch, QueueTier};
use crate::store::{with_timeout, ObjectStore};
use crate::NotifyError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Message appended to the outbox for every batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestMessage {
    pub id: String,
    pub workspace: String,
    pub bucket_name: String,
    pub source: String,
    pub target: String,
    pub added_keys: Vec<String>,
    pub deleted_keys: Vec<String>,
    pub sequence: u32,
    pub queue: QueueTier,
    pub timestamp: DateTime<Utc>,
}

/// Outbox settings.
#[derive(Debug, Clone)]
pub struct OutboxOptions {
    /// Directory holding one `<topic>.jsonl` file per topic
    pub dir: PathBuf,
    pub standard_topic: String,
    pub bulk_topic: String,
    /// Bucket receiving the output objects
    pub output_bucket: String,
    /// Rotate an outbox file once it reaches this size in bytes
    pub max_size: u64,
    pub storage_timeout: Duration,
}

/// Notifier writing output objects and an append-only message outbox.
pub struct OutboxNotifier {
    store: Arc<dyn ObjectStore>,
    options: OutboxOptions,
}

impl OutboxNotifier {
    pub fn new(store: Arc<dyn ObjectStore>, options: OutboxOptions) -> Self {
        Self { store, options }
    }

    /// Prefix under which a workspace's output objects live.
    pub fn output_prefix(workspace_id: &str) -> String {
        format!("file-harvester/{workspace_id}-eodhp-config/catalogs/user/catalogs/{workspace_id}/")
    }

    /// Output object key of a canonical path.
    pub fn output_key(workspace_id: &str, canonical_path: &str) -> String {
        format!("{}{}.json", Self::output_prefix(workspace_id), canonical_path)
    }

    /// Outbox file for a queue tier.
    pub fn topic_path(&self, queue: QueueTier) -> PathBuf {
        let topic = match queue {
            QueueTier::Standard => &self.options.standard_topic,
            QueueTier::Bulk => &self.options.bulk_topic,
        };
        self.options.dir.join(format!("{topic}.jsonl"))
    }

    /// Messages currently in a topic's outbox, oldest first.
    pub async fn read_messages(&self, queue: QueueTier) -> Result<Vec<HarvestMessage>, NotifyError> {
        let path = self.topic_path(queue);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }

        let content = tokio::fs::read_to_string(&path).await?;
        let mut messages = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            messages.push(serde_json::from_str(line)?);
        }
        Ok(messages)
    }

    fn message_for(&self, batch: &ChangeBatch) -> HarvestMessage {
        let workspace = &batch.workspace_id;
        HarvestMessage {
            id: format!("harvester/workspace_file_harvester/{workspace}"),
            workspace: workspace.clone(),
            bucket_name: self.options.output_bucket.clone(),
            source: format!("{workspace}-eodhp-config/"),
            target: String::new(),
            added_keys: batch
                .upserts
                .keys()
                .map(|path| Self::output_key(workspace, path))
                .collect(),
            deleted_keys: batch
                .deletions
                .iter()
                .map(|path| Self::output_key(workspace, path))
                .collect(),
            sequence: batch.sequence,
            queue: batch.queue,
            timestamp: Utc::now(),
        }
    }

    async fn append(&self, path: &Path, message: &HarvestMessage) -> Result<(), NotifyError> {
        if self.should_rotate(path).await {
            self.rotate(path).await?;
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;

        debug!(path = ?path, sequence = message.sequence, "Appended harvest message");

        Ok(())
    }

    async fn should_rotate(&self, path: &Path) -> bool {
        match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len() >= self.options.max_size,
            Err(_) => false,
        }
    }

    async fn rotate(&self, path: &Path) -> Result<(), NotifyError> {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S%3f");
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let rotated = path.with_file_name(format!("{file_name}.{timestamp}"));

        tokio::fs::rename(path, &rotated).await?;
        debug!(from = ?path, to = ?rotated, "Rotated outbox");

        Ok(())
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn emit(&self, batch: &ChangeBatch) -> Result<(), NotifyError> {
        let bucket = &self.options.output_bucket;
        let timeout = self.options.storage_timeout;

        for (path, body) in &batch.upserts {
            let key = Self::output_key(&batch.workspace_id, path);
            with_timeout(timeout, self.store.put(bucket, &key, body.clone().into_bytes()))
                .await
                .map_err(|source| NotifyError::Output { key, source })?;
        }

        for path in &batch.deletions {
            let key = Self::output_key(&batch.workspace_id, path);
            with_timeout(timeout, self.store.delete(bucket, &key))
                .await
                .map_err(|source| NotifyError::Output { key, source })?;
        }

        let message = self.message_for(batch);
        self.append(&self.topic_path(batch.queue), &message).await
    }
}
