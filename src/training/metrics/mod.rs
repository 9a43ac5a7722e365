//! Metrics collection and export for motion stream training
//!
//! Batch-level observations are folded into [`AverageMeter`]s while an epoch
//! runs; the resulting [`PhaseMetrics`] are appended to the per-phase CSV
//! training logs by [`TrainingLog`].

pub mod collectors;
pub mod exporters;

pub use collectors::{accuracy, accuracy_from_rows, label_rank, AverageMeter};
pub use exporters::{TestRecord, TrainRecord, TrainingLog};

use serde::{Deserialize, Serialize};

/// Stream phase a set of metrics belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Parameter-updating sweep over the training stream
    Train,
    /// Forward-only sweep over the validation stream, scored per video
    Test,
}

impl Phase {
    /// Name used in log file names and records
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Test => "test",
        }
    }
}

/// Epoch-level summary of one phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseMetrics {
    /// Epoch index
    pub epoch: usize,
    /// Phase
    pub phase: Phase,
    /// Mean loss (frame-level for train, video-level for test)
    pub loss: f64,
    /// Top-1 accuracy in percent
    pub top1: f64,
    /// Top-5 accuracy in percent
    pub top5: f64,
    /// Mean seconds per batch
    pub batch_time: f64,
    /// Mean seconds spent waiting for data (train only)
    pub data_time: Option<f64>,
    /// Learning rate used during the phase (train only)
    pub learning_rate: Option<f64>,
    /// Number of scored items (frames for train, videos for test)
    pub samples: usize,
}

/// Train and test summaries of one completed epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    /// Epoch index
    pub epoch: usize,
    /// Training sweep metrics
    pub train: PhaseMetrics,
    /// Video-level validation metrics
    pub test: PhaseMetrics,
    /// Whether this epoch produced a new best top-1
    pub is_best: bool,
    /// Learning rate after the scheduler step
    pub learning_rate: f64,
}
