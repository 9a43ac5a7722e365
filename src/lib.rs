//! Motion stream - optical-flow CNN training for two-stream action recognition
//!
//! This crate trains the temporal (motion) stream of a two-stream action
//! recogniser: a residual CNN classifies stacks of optical-flow frames, and
//! validation sums the per-frame scores of every video before scoring it.
//!
//! The pieces, bottom up:
//!
//! - [`config`]: layered run configuration (file, environment, CLI overrides)
//! - [`model`]: the [`model::MotionNet`] classifier and pretrained weight import
//! - [`training`]: batch sources, per-epoch sweeps, video-level aggregation,
//!   SGD with plateau scheduling, checkpoints and the [`training::MotionTrainer`]
//!   controller tying them together
//! - [`logging`]: tracing subscriber setup for the runner

#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod training;

// Re-exports
pub use config::{DataConfig, DatasetKind, DeviceConfig, ModelConfig, RunConfig, RuntimeConfig};
pub use error::{Error, Result};
pub use model::{build_model, FrameClassifier, MotionNet, Pretraining};
pub use training::{
    DataStreams, GroundTruthIndex, ModelHandle, MotionTrainer, TrainingConfig, TrainingEvent,
    TrainingResult, VideoLevelMetrics, VideoPredictionAggregator,
};
