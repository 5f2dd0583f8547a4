//! Downstream notification collaborator.
//!
//! Delivery is at-least-once: a batch may be handed off again after a crash,
//! and consumers replace entities by canonical path.

mod memory;
mod outbox;

pub use memory::MemoryNotifier;
pub use outbox::{HarvestMessage, OutboxNotifier, OutboxOptions};

use crate::batch::ChangeBatch;
use crate::NotifyError;
use async_trait::async_trait;

/// Receives emitted change batches.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Hand a batch off. Success means accepted for delivery, not processed.
    async fn emit(&self, batch: &ChangeBatch) -> Result<(), NotifyError>;
}
