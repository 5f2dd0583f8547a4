use super::Notifier;
use crate::batch::ChangeBatch;
use crate::NotifyError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Notifier that records batches in memory.
#[derive(Default)]
pub struct MemoryNotifier {
    batches: Mutex<Vec<ChangeBatch>>,
    failures_left: AtomicUsize,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` emissions fail.
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Batches accepted so far, in emission order.
    pub fn batches(&self) -> Vec<ChangeBatch> {
        self.batches.lock().clone()
    }

    pub fn clear(&self) {
        self.batches.lock().clear();
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn emit(&self, batch: &ChangeBatch) -> Result<(), NotifyError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(NotifyError::Transport("Injected emit failure".to_string()));
        }

        self.batches.lock().push(batch.clone());
        Ok(())
    }
}
