//! Training configuration for the motion stream
//!
//! This module provides the configuration structures for the epoch loop,
//! optimisation, learning-rate scheduling and checkpointing.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Total number of epochs; the loop runs `start_epoch..nb_epochs`
    pub nb_epochs: usize,

    /// Epoch to start from when not resuming
    pub start_epoch: usize,

    /// Run a single validation pass and stop
    pub evaluate: bool,

    /// Optimization configuration
    pub optimizer: OptimizerConfig,

    /// Learning rate scheduler
    pub scheduler: SchedulerConfig,

    /// Checkpointing configuration
    pub checkpointing: CheckpointingConfig,

    /// Per-batch debug logging frequency (in batches)
    pub log_steps: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            nb_epochs: 20,
            start_epoch: 0,
            evaluate: false,
            optimizer: OptimizerConfig::default(),
            scheduler: SchedulerConfig::default(),
            checkpointing: CheckpointingConfig::default(),
            log_steps: 50,
        }
    }
}

impl TrainingConfig {
    /// Validate the training configuration
    pub fn validate(&self) -> Result<()> {
        if self.start_epoch > self.nb_epochs {
            return Err(Error::config(format!(
                "start_epoch {} is beyond nb_epochs {}",
                self.start_epoch, self.nb_epochs
            )));
        }
        if self.log_steps == 0 {
            return Err(Error::config("log_steps must be > 0"));
        }
        self.optimizer.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }
}

/// Optimizer configuration (SGD with momentum)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Base learning rate
    pub learning_rate: f64,

    /// Momentum coefficient
    pub momentum: f64,

    /// Weight decay coefficient
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-2,
            momentum: 0.9,
            weight_decay: 0.0,
        }
    }
}

impl OptimizerConfig {
    /// Validate optimizer hyper-parameters
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(Error::config(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(Error::config("momentum must be in [0, 1)"));
        }
        if self.weight_decay < 0.0 {
            return Err(Error::config("weight_decay must be >= 0"));
        }
        Ok(())
    }
}

/// Learning rate scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Scheduler type
    pub scheduler_type: SchedulerType,

    /// Minimum learning rate
    pub min_lr: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduler_type: SchedulerType::ReduceOnPlateau {
                patience: 1,
                factor: 0.1,
                threshold: 1e-4,
            },
            min_lr: 0.0,
        }
    }
}

impl SchedulerConfig {
    /// Validate scheduler parameters
    pub fn validate(&self) -> Result<()> {
        if self.min_lr < 0.0 {
            return Err(Error::config("min_lr must be >= 0"));
        }
        if let SchedulerType::ReduceOnPlateau { factor, threshold, .. } = &self.scheduler_type {
            if !(*factor > 0.0 && *factor < 1.0) {
                return Err(Error::config("plateau factor must be in (0, 1)"));
            }
            if *threshold < 0.0 {
                return Err(Error::config("plateau threshold must be >= 0"));
            }
        }
        Ok(())
    }
}

/// Learning rate scheduler types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulerType {
    /// Multiply the rate by `factor` once the validation loss has not improved
    /// for more than `patience` epochs
    ReduceOnPlateau {
        patience: usize,
        factor: f64,
        threshold: f64,
    },
    /// Keep the base rate
    Constant,
}

/// Checkpointing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointingConfig {
    /// Output directory for checkpoints, logs and prediction files
    pub output_dir: PathBuf,

    /// Checkpoint to resume from
    pub resume_from_checkpoint: Option<PathBuf>,

    /// Gzip checkpoint records
    pub compression: bool,
}

impl Default for CheckpointingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("record/motion"),
            resume_from_checkpoint: None,
            compression: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(TrainingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_negative_learning_rate_rejected() {
        let mut config = TrainingConfig::default();
        config.optimizer.learning_rate = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_start_epoch_beyond_total_rejected() {
        let mut config = TrainingConfig::default();
        config.nb_epochs = 3;
        config.start_epoch = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_scheduler_type_serialization() {
        let json = serde_json::to_string(&SchedulerType::Constant).unwrap();
        assert_eq!(json, r#"{"kind":"constant"}"#);

        let parsed: SchedulerType = serde_json::from_str(
            r#"{"kind":"reduce_on_plateau","patience":3,"factor":0.5,"threshold":0.0}"#,
        )
        .unwrap();
        assert_eq!(
            parsed,
            SchedulerType::ReduceOnPlateau { patience: 3, factor: 0.5, threshold: 0.0 }
        );
    }
}
