//! Error types for the motion stream trainer

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for motion stream operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (unsupported dataset, bad label, invalid value)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A video accumulated during validation has no ground-truth label
    #[error("No ground-truth label for video '{video}'")]
    MissingGroundTruth {
        /// Video key that could not be resolved
        video: String,
    },

    /// A composite frame key did not contain the video delimiter
    #[error("Malformed frame key '{key}': expected '<video>{delimiter}<frame>'")]
    MalformedKey {
        /// Offending key
        key: String,
        /// Delimiter that was expected
        delimiter: char,
    },

    /// Tensor or vector shapes disagree
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Loss became NaN or infinite
    #[error("Non-finite loss {value} at epoch {epoch}, batch {batch}")]
    NonFiniteLoss {
        /// Loss value observed
        value: f64,
        /// Epoch index
        epoch: usize,
        /// Batch index within the epoch
        batch: usize,
    },

    /// Summed validation scores of a video contain NaN or infinity
    #[error("Non-finite validation scores for video '{video}'")]
    NonFiniteScores {
        /// Video whose score sums diverged
        video: String,
    },

    /// Checkpoint path does not exist
    #[error("No checkpoint found at {0}")]
    CheckpointNotFound(PathBuf),

    /// Checkpoint exists but cannot be decoded or does not fit the model
    #[error("Corrupt checkpoint {path}: {reason}")]
    CheckpointCorrupt {
        /// Checkpoint path
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// Data loading error
    #[error("Data error: {0}")]
    Data(String),

    /// Model construction or weight import error
    #[error("Model error: {0}")]
    Model(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary encoding error
    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// Training log error
    #[error("Training log error: {0}")]
    Csv(#[from] csv::Error),

    /// Image decoding error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Layered configuration error
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for motion stream operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }

    /// Create a data loading error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    /// Create a corrupt checkpoint error
    pub fn checkpoint_corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CheckpointCorrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether a resume attempt that failed with this error may fall back to a fresh run
    pub fn is_recoverable_resume(&self) -> bool {
        matches!(self, Self::CheckpointNotFound(_) | Self::CheckpointCorrupt { .. })
    }
}
