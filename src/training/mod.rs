//! Training infrastructure for the motion stream
//!
//! This module provides the epoch-driven training and validation machinery:
//! batch sources, the per-epoch sweeps, video-level score aggregation,
//! optimization, checkpointing and the CSV training logs.
//!
//! # Main Components
//!
//! - **Configuration**: epoch range, optimizer, scheduler and checkpoint slots
//! - **Trainer**: [`MotionTrainer`], the controller running train/validate epochs
//! - **Data**: [`BatchSource`] streams over stacked optical-flow clips
//! - **Aggregation**: per-video summing of frame scores and video-level metrics
//! - **Checkpoints**: atomic latest/best checkpoint slots and the prediction side file
//! - **Metrics**: averaging meters, top-k accuracy and the per-phase CSV logs
//! - **Optimizers**: SGD with momentum and the plateau learning-rate schedule
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use motion_stream::training::{DataStreams, ModelHandle, MotionTrainer, TrainingConfig};
//!
//! let mut trainer = MotionTrainer::new(TrainingConfig::default(), model, streams)?;
//! let result = trainer.run().await?;
//! println!("best top-1: {:.2}%", result.final_state.best_score);
//! ```

pub mod aggregation;
pub mod checkpoints;
pub mod config;
pub mod data;
pub mod metrics;
pub mod optimizers;
pub mod trainer;
pub mod trainers;

// Tests module
#[cfg(test)]
pub mod tests;

// Configuration re-exports
pub use config::{CheckpointingConfig, OptimizerConfig, SchedulerConfig, SchedulerType, TrainingConfig};

// Trainer re-exports
pub use trainer::{
    DataStreams, ModelHandle, MotionTrainer, TrainingEvent, TrainingResult, TrainingState,
    TrainingStatus,
};
pub use trainers::{EpochTrainer, EpochValidator, ValidationOutcome};

// Data re-exports
pub use data::{
    BatchSource, ClipSampling, FlowClipSource, FrameBatch, InMemoryBatches, KeyedFrameBatch,
    SplitLists, TrainingFlowSource,
};

// Aggregation re-exports
pub use aggregation::{
    derive_video_key, GroundTruthIndex, VideoKey, VideoLevelMetrics, VideoPredictionAggregator,
};

// Checkpoint re-exports
pub use checkpoints::{CheckpointManager, ParameterSnapshot, TrainingCheckpoint};

// Metrics re-exports
pub use metrics::{AverageMeter, EpochSummary, Phase, PhaseMetrics, TrainingLog};

// Optimizer re-exports
pub use optimizers::{
    create_optimizer, create_scheduler, ConstantScheduler, Optimizer, OptimizerState,
    PlateauScheduler, Scheduler, SchedulerState, SgdOptimizer,
};
