//! Training controller for the motion stream
//!
//! [`MotionTrainer`] owns the model, optimizer, scheduler, batch sources and
//! checkpoint slots of a run and drives the epoch loop:
//!
//! 1. train one pass, then validate one pass scored per video;
//! 2. an epoch is the new best when its video top-1 is strictly above every
//!    earlier one;
//! 3. the scheduler observes the validation loss and the optimizer picks up
//!    its rate;
//! 4. a new best rewrites the prediction side file;
//! 5. the checkpoint is written, recording the next epoch to run.
//!
//! In evaluate-only mode a single validation pass is logged as epoch 0 and
//! nothing is written besides the test log.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use candle_core::Device;
use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::model::FrameClassifier;
use crate::training::aggregation::{GroundTruthIndex, VideoLevelMetrics};
use crate::training::checkpoints::{apply_prepared, CheckpointManager, ParameterSnapshot, TrainingCheckpoint};
use crate::training::config::TrainingConfig;
use crate::training::data::{BatchSource, FrameBatch, KeyedFrameBatch};
use crate::training::metrics::{EpochSummary, TrainingLog};
use crate::training::optimizers::{create_optimizer, create_scheduler, OptimizerState, SchedulerState};
use crate::training::trainers::{EpochTrainer, EpochValidator};

/// Network being trained together with its parameters
pub struct ModelHandle {
    /// Frame classifier
    pub model: Box<dyn FrameClassifier>,
    /// Every trainable variable of `model`
    pub var_map: VarMap,
    /// Device the variables live on
    pub device: Device,
    /// Pretraining label used in output file names
    pub model_type: String,
}

/// Batch streams and validation ground truth of a run
pub struct DataStreams {
    /// Training frames
    pub train: Box<dyn BatchSource<Batch = FrameBatch>>,
    /// Validation frames keyed by video
    pub validation: Box<dyn BatchSource<Batch = KeyedFrameBatch>>,
    /// Labels of the validation videos
    pub ground_truth: GroundTruthIndex,
    /// Whether the ground-truth labels start at zero
    pub zero_indexed: bool,
}

/// Training state tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingState {
    /// Next epoch to run
    pub epoch: usize,

    /// Best video-level top-1 so far, in percent
    pub best_score: f64,

    /// Training status
    pub status: TrainingStatus,

    /// Current learning rate
    pub current_lr: f64,

    /// Run start time
    pub start_time: DateTime<Utc>,
}

impl TrainingState {
    pub fn new(start_epoch: usize, learning_rate: f64) -> Self {
        Self {
            epoch: start_epoch,
            best_score: 0.0,
            status: TrainingStatus::NotStarted,
            current_lr: learning_rate,
            start_time: Utc::now(),
        }
    }

    /// Record a validation top-1; returns whether it is a new best
    ///
    /// Only a strictly higher score counts, so the best score never
    /// decreases and ties keep the earlier epoch.
    pub fn observe_score(&mut self, top1: f64) -> bool {
        if top1 > self.best_score {
            self.best_score = top1;
            true
        } else {
            false
        }
    }
}

/// Training status enumeration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TrainingStatus {
    NotStarted,
    Running,
    Evaluating,
    Completed,
    Failed { error: String },
}

/// Training events for monitoring
#[derive(Debug, Clone)]
pub enum TrainingEvent {
    EpochStarted { epoch: usize },
    EpochCompleted { summary: EpochSummary },
    NewBest { epoch: usize, top1: f64 },
    CheckpointSaved { path: PathBuf, is_best: bool },
    LearningRateReduced { epoch: usize, old_lr: f64, new_lr: f64 },
    TrainingCompleted { epochs_run: usize },
    Error { error: String },
}

/// Training result information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingResult {
    /// Training state at completion
    pub final_state: TrainingState,

    /// Summaries of the epochs run by this invocation
    pub epochs: Vec<EpochSummary>,

    /// Scores of the last validation pass
    pub final_validation: Option<VideoLevelMetrics>,

    /// Path to best model checkpoint
    pub best_checkpoint_path: Option<PathBuf>,

    /// Wall-clock duration of the run
    pub training_duration: Duration,
}

/// Epoch-driven training and validation of a motion stream classifier
pub struct MotionTrainer {
    config: TrainingConfig,
    model: ModelHandle,
    optimizer: OptimizerState,
    scheduler: SchedulerState,
    data: DataStreams,
    epoch_trainer: EpochTrainer,
    validator: EpochValidator,
    checkpoint_manager: CheckpointManager,
    training_log: TrainingLog,
    state: TrainingState,
    event_tx: Option<mpsc::UnboundedSender<TrainingEvent>>,
}

impl MotionTrainer {
    /// Create a new trainer instance
    pub fn new(config: TrainingConfig, model: ModelHandle, data: DataStreams) -> Result<Self> {
        config.validate()?;

        let optimizer = create_optimizer(&config.optimizer, &model.var_map, &model.device)?;
        let scheduler = create_scheduler(&config.scheduler, config.optimizer.learning_rate)?;
        let checkpoint_manager = CheckpointManager::from_config(&config.checkpointing)?;
        let training_log = TrainingLog::new(checkpoint_manager.output_dir(), &model.model_type);

        let epoch_trainer = EpochTrainer::new(config.log_steps);
        let validator = EpochValidator::new(
            model.model.num_classes(),
            data.ground_truth.clone(),
            data.zero_indexed,
            config.log_steps,
        );
        let state = TrainingState::new(config.start_epoch, config.optimizer.learning_rate);

        Ok(Self {
            config,
            model,
            optimizer,
            scheduler,
            data,
            epoch_trainer,
            validator,
            checkpoint_manager,
            training_log,
            state,
            event_tx: None,
        })
    }

    /// Set up event monitoring
    pub fn with_event_monitoring(mut self, tx: mpsc::UnboundedSender<TrainingEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Get current training state
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn checkpoint_manager(&self) -> &CheckpointManager {
        &self.checkpoint_manager
    }

    pub fn optimizer(&self) -> &OptimizerState {
        &self.optimizer
    }

    /// Run the configured number of epochs, or a single evaluation pass
    ///
    /// A configured resume checkpoint that is missing or unreadable is
    /// reported and the run starts fresh. Any other error aborts the run;
    /// the epoch in progress writes no checkpoint.
    pub async fn run(&mut self) -> Result<TrainingResult> {
        let started = Instant::now();
        self.state.start_time = Utc::now();

        let outcome = match self.resume() {
            Ok(()) if self.config.evaluate => self.run_evaluation().await,
            Ok(()) => self.run_training_loop().await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok((epochs, final_validation)) => {
                self.state.status = TrainingStatus::Completed;
                self.send_event(TrainingEvent::TrainingCompleted {
                    epochs_run: epochs.len(),
                });
                let result = TrainingResult {
                    final_state: self.state.clone(),
                    epochs,
                    final_validation,
                    best_checkpoint_path: self.checkpoint_manager.best_checkpoint_path(),
                    training_duration: started.elapsed(),
                };
                info!(
                    epochs = result.epochs.len(),
                    best_score = self.state.best_score,
                    duration = ?result.training_duration,
                    "Run finished"
                );
                Ok(result)
            }
            Err(e) => {
                error!(error = %e, epoch = self.state.epoch, "Run failed");
                self.state.status = TrainingStatus::Failed {
                    error: e.to_string(),
                };
                self.send_event(TrainingEvent::Error {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_evaluation(&mut self) -> Result<(Vec<EpochSummary>, Option<VideoLevelMetrics>)> {
        info!("Evaluate-only run: one validation pass, no training");
        self.state.status = TrainingStatus::Evaluating;

        let outcome = self
            .validator
            .validate_epoch(
                0,
                self.model.model.as_ref(),
                self.data.validation.as_mut(),
                &self.training_log,
            )
            .await?;
        Ok((Vec::new(), Some(outcome.video)))
    }

    async fn run_training_loop(&mut self) -> Result<(Vec<EpochSummary>, Option<VideoLevelMetrics>)> {
        self.state.status = TrainingStatus::Running;
        let total_epochs = self.config.nb_epochs;
        let mut summaries = Vec::new();
        let mut last_validation = None;

        info!(
            start_epoch = self.state.epoch,
            total_epochs,
            best_score = self.state.best_score,
            lr = self.optimizer.learning_rate(),
            "Starting training"
        );

        for epoch in self.state.epoch..total_epochs {
            self.state.epoch = epoch;
            self.send_event(TrainingEvent::EpochStarted { epoch });

            let train = self
                .epoch_trainer
                .train_epoch(
                    epoch,
                    self.model.model.as_ref(),
                    &mut self.optimizer,
                    self.data.train.as_mut(),
                    &self.training_log,
                )
                .await?;
            let validation = self
                .validator
                .validate_epoch(
                    epoch,
                    self.model.model.as_ref(),
                    self.data.validation.as_mut(),
                    &self.training_log,
                )
                .await?;

            let is_best = self.state.observe_score(validation.top1());

            let old_lr = self.optimizer.learning_rate();
            self.scheduler.step(Some(validation.loss()));
            let new_lr = self.scheduler.get_lr();
            self.optimizer.set_learning_rate(new_lr);
            self.state.current_lr = new_lr;
            if new_lr < old_lr {
                self.send_event(TrainingEvent::LearningRateReduced {
                    epoch,
                    old_lr,
                    new_lr,
                });
            }

            if is_best {
                info!(epoch, top1 = validation.top1(), "New best video-level top-1");
                self.checkpoint_manager
                    .save_video_predictions(&self.model.model_type, self.validator.predictions())?;
                self.send_event(TrainingEvent::NewBest {
                    epoch,
                    top1: validation.top1(),
                });
            }

            let checkpoint = self.build_checkpoint(epoch + 1)?;
            let path = self.checkpoint_manager.save(&checkpoint, is_best)?;
            self.send_event(TrainingEvent::CheckpointSaved { path, is_best });
            self.state.epoch = epoch + 1;

            let summary = EpochSummary {
                epoch,
                train,
                test: validation.metrics.clone(),
                is_best,
                learning_rate: new_lr,
            };
            self.send_event(TrainingEvent::EpochCompleted {
                summary: summary.clone(),
            });
            summaries.push(summary);
            last_validation = Some(validation.video);
        }

        Ok((summaries, last_validation))
    }

    fn build_checkpoint(&self, next_epoch: usize) -> Result<TrainingCheckpoint> {
        Ok(TrainingCheckpoint {
            epoch: next_epoch,
            best_score: self.state.best_score,
            model_type: self.model.model_type.clone(),
            model_state: ParameterSnapshot::capture(&self.model.var_map)?,
            optimizer_state: Some(self.optimizer.state_dict()?),
            scheduler_state: Some(self.scheduler.state_dict()),
            timestamp: Utc::now(),
        })
    }

    /// Restore from the configured checkpoint, if any
    fn resume(&mut self) -> Result<()> {
        let Some(path) = self.config.checkpointing.resume_from_checkpoint.clone() else {
            return Ok(());
        };

        match self.restore_from(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.is_recoverable_resume() => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Cannot resume, starting from scratch"
                );
                self.state.epoch = self.config.start_epoch;
                self.state.best_score = 0.0;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Load `path` and apply it
    ///
    /// Everything that can fail is checked before the first mutation, so an
    /// error leaves model, optimizer and scheduler untouched.
    fn restore_from(&mut self, path: &Path) -> Result<()> {
        let checkpoint = self.checkpoint_manager.load(path)?;
        let corrupt = |e: Error| Error::checkpoint_corrupt(path, e.to_string());

        let prepared = checkpoint
            .model_state
            .prepare(&self.model.var_map, &self.model.device)
            .map_err(corrupt)?;

        if let Some(scheduler_state) = &checkpoint.scheduler_state {
            if scheduler_state.scheduler_type != self.scheduler.name() {
                return Err(Error::checkpoint_corrupt(
                    path,
                    format!(
                        "scheduler '{}' does not match the configured '{}'",
                        scheduler_state.scheduler_type,
                        self.scheduler.name()
                    ),
                ));
            }
        }
        if let Some(optimizer_state) = checkpoint.optimizer_state {
            self.optimizer.load_state_dict(optimizer_state).map_err(corrupt)?;
        }
        if let Some(scheduler_state) = checkpoint.scheduler_state {
            self.scheduler.load_state_dict(scheduler_state)?;
        }
        apply_prepared(&self.model.var_map, &prepared)?;

        self.state.epoch = checkpoint.epoch;
        self.state.best_score = checkpoint.best_score;
        self.state.current_lr = self.optimizer.learning_rate();

        info!(
            path = %path.display(),
            epoch = checkpoint.epoch,
            best_score = checkpoint.best_score,
            saved_at = %checkpoint.timestamp,
            "Resumed from checkpoint"
        );
        Ok(())
    }

    fn send_event(&self, event: TrainingEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}
