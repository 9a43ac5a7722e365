//! Batch sources for motion stream training
//!
//! The epoch loop pulls batches from a [`BatchSource`]: training sources
//! yield [`FrameBatch`]es, validation sources yield [`KeyedFrameBatch`]es
//! whose keys tie every frame to its video. A source is restarted with
//! [`BatchSource::begin_epoch`] before every pass.

pub mod flow;
pub mod memory;
pub mod splits;

pub use flow::{ClipSampling, FlowClipSource, FlowLayout, TrainingFlowSource};
pub use memory::InMemoryBatches;
pub use splits::{ClassIndex, SplitLists, VideoEntry};

use async_trait::async_trait;
use candle_core::Tensor;

use crate::error::{Error, Result};

/// Lazy, finite, restartable stream of batches
#[async_trait]
pub trait BatchSource: Send {
    /// Batch type produced by the source
    type Batch: Send;

    /// Start a fresh pass over the data for `epoch`
    async fn begin_epoch(&mut self, epoch: usize) -> Result<()>;

    /// Next batch of the current pass, `None` once it is exhausted
    async fn next_batch(&mut self) -> Result<Option<Self::Batch>>;

    /// Number of batches per pass, when known up front
    fn num_batches(&self) -> Option<usize> {
        None
    }
}

/// Training batch: `[N, C, H, W]` inputs and `[N]` zero-based labels
#[derive(Debug, Clone)]
pub struct FrameBatch {
    pub inputs: Tensor,
    pub labels: Tensor,
}

impl FrameBatch {
    pub fn new(inputs: Tensor, labels: Tensor) -> Result<Self> {
        check_batch_dims(&inputs, &labels)?;
        Ok(Self { inputs, labels })
    }

    /// Number of frames in the batch
    pub fn len(&self) -> usize {
        self.labels.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Validation batch: one composite `"<video>|<clip>"` key per frame
#[derive(Debug, Clone)]
pub struct KeyedFrameBatch {
    pub keys: Vec<String>,
    pub inputs: Tensor,
    pub labels: Tensor,
}

impl KeyedFrameBatch {
    pub fn new(keys: Vec<String>, inputs: Tensor, labels: Tensor) -> Result<Self> {
        check_batch_dims(&inputs, &labels)?;
        if keys.len() != labels.dims()[0] {
            return Err(Error::shape_mismatch(format!(
                "{} keys for a batch of {} frames",
                keys.len(),
                labels.dims()[0]
            )));
        }
        Ok(Self {
            keys,
            inputs,
            labels,
        })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Drop the keys
    pub fn into_frame_batch(self) -> FrameBatch {
        FrameBatch {
            inputs: self.inputs,
            labels: self.labels,
        }
    }
}

fn check_batch_dims(inputs: &Tensor, labels: &Tensor) -> Result<()> {
    let (input_dims, label_dims) = (inputs.dims(), labels.dims());
    if label_dims.len() != 1 {
        return Err(Error::shape_mismatch(format!(
            "labels must be 1-d, got shape {:?}",
            label_dims
        )));
    }
    if input_dims.first() != Some(&label_dims[0]) {
        return Err(Error::shape_mismatch(format!(
            "inputs {:?} and labels {:?} disagree on batch size",
            input_dims, label_dims
        )));
    }
    Ok(())
}
