//! Batch source replaying batches held in memory

use async_trait::async_trait;

use super::BatchSource;
use crate::error::Result;

/// Replays the same batches on every pass
#[derive(Debug, Clone)]
pub struct InMemoryBatches<B> {
    batches: Vec<B>,
    cursor: usize,
    epochs_started: Vec<usize>,
}

impl<B> InMemoryBatches<B> {
    pub fn new(batches: Vec<B>) -> Self {
        Self {
            batches,
            cursor: 0,
            epochs_started: Vec::new(),
        }
    }

    /// Epochs passed to `begin_epoch`, in call order
    pub fn epochs_started(&self) -> &[usize] {
        &self.epochs_started
    }
}

#[async_trait]
impl<B: Clone + Send + Sync> BatchSource for InMemoryBatches<B> {
    type Batch = B;

    async fn begin_epoch(&mut self, epoch: usize) -> Result<()> {
        self.cursor = 0;
        self.epochs_started.push(epoch);
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Option<B>> {
        let batch = self.batches.get(self.cursor).cloned();
        if batch.is_some() {
            self.cursor += 1;
        }
        Ok(batch)
    }

    fn num_batches(&self) -> Option<usize> {
        Some(self.batches.len())
    }
}
