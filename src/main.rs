use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

use motion_stream::config::{DatasetKind, DeviceConfig, RunConfig};
use motion_stream::logging::init_logging;
use motion_stream::model::{build_model, Pretraining};
use motion_stream::training::data::{ClipSampling, FlowClipSource, SplitLists, TrainingFlowSource};
use motion_stream::training::{DataStreams, ModelHandle, MotionTrainer, TrainingEvent};

#[derive(Parser, Debug)]
#[command(name = "motion-stream")]
#[command(about = "Train and validate the optical-flow motion stream of a two-stream action recogniser", long_about = None)]
struct Cli {
    /// Configuration file (JSON, YAML or TOML); flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Total number of epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Mini-batch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Initial learning rate
    #[arg(long)]
    lr: Option<f64>,

    /// Run a single validation pass and exit
    #[arg(long)]
    evaluate: bool,

    /// Weight initialisation: no, imagenet or transfer
    #[arg(long)]
    model: Option<String>,

    /// Weights of a network trained on another task (with --model transfer)
    #[arg(long)]
    transfer_path: Option<PathBuf>,

    /// ImageNet RGB weights (with --model imagenet)
    #[arg(long)]
    imagenet_weights: Option<PathBuf>,

    /// Checkpoint to resume from
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Epoch to start from when not resuming
    #[arg(long)]
    start_epoch: Option<usize>,

    /// Dataset: UCF101 or HMDB51
    #[arg(long)]
    dataset: Option<String>,

    /// Directory for checkpoints, logs and prediction files
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Root of the u/ and v/ flow image directories
    #[arg(long)]
    flow_dir: Option<PathBuf>,

    /// Directory with classInd.txt and the split lists
    #[arg(long)]
    split_dir: Option<PathBuf>,

    /// Split identifier, e.g. 01
    #[arg(long)]
    split: Option<String>,

    /// Compute device: cpu, cuda:N or metal:N
    #[arg(long)]
    device: Option<String>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    /// Apply command-line overrides to the loaded configuration
    fn apply(&self, mut config: RunConfig) -> Result<RunConfig> {
        if let Some(epochs) = self.epochs {
            config.training.nb_epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.data.batch_size = batch_size;
        }
        if let Some(lr) = self.lr {
            config.training.optimizer.learning_rate = lr;
        }
        if self.evaluate {
            config.training.evaluate = true;
        }
        if let Some(mode) = &self.model {
            config.model.pretraining = Pretraining::resolve(
                mode,
                self.imagenet_weights.clone(),
                self.transfer_path.clone(),
            )?;
        }
        if let Some(resume) = &self.resume {
            config.training.checkpointing.resume_from_checkpoint = Some(resume.clone());
        }
        if let Some(start_epoch) = self.start_epoch {
            config.training.start_epoch = start_epoch;
        }
        if let Some(dataset) = &self.dataset {
            config.data.dataset = dataset.parse::<DatasetKind>()?;
        }
        if let Some(output_dir) = &self.output_dir {
            config.training.checkpointing.output_dir = output_dir.clone();
        }
        if let Some(flow_dir) = &self.flow_dir {
            config.data.flow_dir = flow_dir.clone();
        }
        if let Some(split_dir) = &self.split_dir {
            config.data.split_dir = split_dir.clone();
        }
        if let Some(split) = &self.split {
            config.data.split = split.clone();
        }
        if let Some(device) = &self.device {
            config.runtime.device = device.parse::<DeviceConfig>()?;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs)?;

    let config = RunConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let config = cli.apply(config).context("Invalid command-line option")?.resolve();
    config.validate().context("Configuration validation failed")?;

    info!(
        dataset = %config.data.dataset,
        split = %config.data.split,
        pretraining = %config.model.pretraining,
        device = %config.runtime.device,
        epochs = config.training.nb_epochs,
        evaluate = config.training.evaluate,
        "Starting motion stream run"
    );

    let device = config.runtime.device.to_device().context("Failed to open device")?;
    let (var_map, model) =
        build_model(&config.model, &device).context("Failed to build the motion network")?;

    let splits = SplitLists::load(&config.data.split_dir, &config.data.split, config.data.dataset)
        .context("Failed to read the split lists")?;
    let train_source = FlowClipSource::new(
        &config.data,
        &splits.train,
        ClipSampling::RandomPerVideo,
        config.runtime.seed,
        config.runtime.num_workers,
        device.clone(),
    )
    .context("Failed to index training videos")?;
    let validation_source = FlowClipSource::new(
        &config.data,
        &splits.test,
        ClipSampling::EvenlySpaced {
            clips: config.data.clips_per_video,
        },
        config.runtime.seed,
        config.runtime.num_workers,
        device.clone(),
    )
    .context("Failed to index validation videos")?;

    let handle = ModelHandle {
        model: Box::new(model),
        var_map,
        device,
        model_type: config.model.pretraining.label().to_string(),
    };
    let streams = DataStreams {
        train: Box::new(TrainingFlowSource::new(train_source)),
        validation: Box::new(validation_source),
        ground_truth: splits.ground_truth(),
        zero_indexed: config.data.dataset.zero_indexed(),
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut trainer = MotionTrainer::new(config.training.clone(), handle, streams)
        .context("Failed to set up the trainer")?
        .with_event_monitoring(tx);

    let monitor = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                TrainingEvent::EpochCompleted { summary } => info!(
                    epoch = summary.epoch,
                    train_loss = summary.train.loss,
                    train_top1 = summary.train.top1,
                    test_loss = summary.test.loss,
                    test_top1 = summary.test.top1,
                    is_best = summary.is_best,
                    lr = summary.learning_rate,
                    "Epoch complete"
                ),
                TrainingEvent::LearningRateReduced { epoch, old_lr, new_lr } => {
                    info!(epoch, old_lr, new_lr, "Learning rate reduced")
                }
                TrainingEvent::Error { error } => warn!(%error, "Run reported an error"),
                _ => {}
            }
        }
    });

    let result = trainer.run().await;
    drop(trainer);
    // the sender lives in the trainer, so the monitor ends once it is dropped
    let _ = monitor.await;
    let result = result.context("Run failed")?;

    match &result.final_validation {
        Some(video) => info!(
            top1 = video.top1,
            top5 = video.top5,
            loss = video.loss,
            videos = video.num_videos,
            best = result.final_state.best_score,
            duration = ?result.training_duration,
            "Finished"
        ),
        None => info!(best = result.final_state.best_score, "Finished without validation"),
    }
    if let Some(path) = &result.best_checkpoint_path {
        info!(path = %path.display(), "Best checkpoint");
    }
    Ok(())
}
