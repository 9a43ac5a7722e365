//! Test fixtures for setting up common test scenarios

use std::path::Path;

use async_trait::async_trait;
use candle_core::{DType, Device, ModuleT, Tensor};
use candle_nn::{Init, VarBuilder, VarMap};
use tempfile::TempDir;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::model::{build_model, FrameClassifier, MotionNet, Pretraining};
use crate::training::aggregation::GroundTruthIndex;
use crate::training::config::{SchedulerConfig, SchedulerType, TrainingConfig};
use crate::training::data::{BatchSource, FrameBatch, InMemoryBatches, KeyedFrameBatch};
use crate::training::trainer::{DataStreams, ModelHandle, MotionTrainer};

/// Classes used by every fixture model
pub const NUM_CLASSES: usize = 3;

/// Model whose logits are its input plus a trainable bias
///
/// Validation scores can be scripted exactly by choosing the inputs, while
/// the bias still gives the optimizer something to update.
pub struct BiasedPassThrough {
    bias: Tensor,
    num_classes: usize,
}

impl BiasedPassThrough {
    pub fn new(num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let bias = vb.get_with_hints(num_classes, "fc.bias", Init::Const(0.0))?;
        Ok(Self { bias, num_classes })
    }
}

impl ModuleT for BiasedPassThrough {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> candle_core::Result<Tensor> {
        xs.broadcast_add(&self.bias)
    }
}

impl FrameClassifier for BiasedPassThrough {
    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

/// Pass-through model on the CPU with its variables
pub fn pass_through() -> (VarMap, BiasedPassThrough) {
    let var_map = VarMap::new();
    let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
    let model = BiasedPassThrough::new(NUM_CLASSES, vb).unwrap();
    (var_map, model)
}

/// Smallest residual network the fixtures train: two flow channels, 8x8 frames
pub fn tiny_model_config() -> ModelConfig {
    ModelConfig {
        in_channels: 2,
        num_classes: NUM_CLASSES,
        base_width: 4,
        stage_blocks: vec![1],
        dropout: 0.0,
        pretraining: Pretraining::NoPretrain,
    }
}

pub fn tiny_motion_net() -> (VarMap, MotionNet) {
    build_model(&tiny_model_config(), &Device::Cpu).unwrap()
}

/// Random flow stacks for `labels.len()` frames
pub fn flow_batch(labels: &[u32]) -> FrameBatch {
    let inputs = Tensor::rand(0f32, 1f32, (labels.len(), 2, 8, 8), &Device::Cpu).unwrap();
    let labels = Tensor::new(labels, &Device::Cpu).unwrap();
    FrameBatch::new(inputs, labels).unwrap()
}

/// Batch of scripted logits: one `(video, label, scores)` entry per frame
pub fn scored_batch(frames: &[(&str, u32, [f32; NUM_CLASSES])]) -> KeyedFrameBatch {
    let keys = frames
        .iter()
        .enumerate()
        .map(|(idx, (video, _, _))| format!("{}|{}", video, idx))
        .collect();
    let flat: Vec<f32> = frames.iter().flat_map(|(_, _, scores)| scores.to_vec()).collect();
    let inputs = Tensor::from_vec(flat, (frames.len(), NUM_CLASSES), &Device::Cpu).unwrap();
    let labels: Vec<u32> = frames.iter().map(|(_, label, _)| *label).collect();
    let labels = Tensor::new(labels.as_slice(), &Device::Cpu).unwrap();
    KeyedFrameBatch::new(keys, inputs, labels).unwrap()
}

/// Training batch of scripted logits with the given labels
pub fn scored_train_batch(frames: &[(u32, [f32; NUM_CLASSES])]) -> FrameBatch {
    let flat: Vec<f32> = frames.iter().flat_map(|(_, scores)| scores.to_vec()).collect();
    let inputs = Tensor::from_vec(flat, (frames.len(), NUM_CLASSES), &Device::Cpu).unwrap();
    let labels: Vec<u32> = frames.iter().map(|(label, _)| *label).collect();
    let labels = Tensor::new(labels.as_slice(), &Device::Cpu).unwrap();
    FrameBatch::new(inputs, labels).unwrap()
}

/// One-indexed ground truth: `v_a` is class 1, `v_b` class 2
pub fn two_video_ground_truth() -> GroundTruthIndex {
    [("v_a", "1"), ("v_b", "2")]
        .into_iter()
        .map(|(video, label)| (video.to_string(), label.to_string()))
        .collect()
}

const RIGHT_A: [f32; NUM_CLASSES] = [6.0, 0.0, 0.0];
const RIGHT_B: [f32; NUM_CLASSES] = [0.0, 6.0, 0.0];
const WRONG_B: [f32; NUM_CLASSES] = [0.0, 0.0, 6.0];

/// Validation pass over `v_a` and `v_b`, two frames each; `v_b` is
/// classified correctly only when `b_correct`
pub fn two_video_pass(b_correct: bool) -> Vec<KeyedFrameBatch> {
    let b_scores = if b_correct { RIGHT_B } else { WRONG_B };
    vec![
        scored_batch(&[("v_a", 0, RIGHT_A), ("v_a", 0, RIGHT_A)]),
        scored_batch(&[("v_b", 1, b_scores), ("v_b", 1, b_scores)]),
    ]
}

/// Training pass for the pass-through model
pub fn pass_through_train_batches() -> Vec<FrameBatch> {
    vec![
        scored_train_batch(&[(0, [1.0, 0.0, 0.0]), (1, [0.0, 1.0, 0.0])]),
        scored_train_batch(&[(2, [0.0, 0.0, 1.0]), (0, [0.5, 0.5, 0.0])]),
    ]
}

/// Validation source replaying a different pass for each epoch
///
/// Epochs past the end of the script replay the last pass.
pub struct ScriptedValidation {
    passes: Vec<Vec<KeyedFrameBatch>>,
    current: Vec<KeyedFrameBatch>,
    cursor: usize,
}

impl ScriptedValidation {
    pub fn new(passes: Vec<Vec<KeyedFrameBatch>>) -> Self {
        Self {
            passes,
            current: Vec::new(),
            cursor: 0,
        }
    }

    /// Script whose video-level top-1 is 50% or 100% per epoch
    pub fn from_outcomes(b_correct: &[bool]) -> Self {
        Self::new(b_correct.iter().map(|&ok| two_video_pass(ok)).collect())
    }
}

#[async_trait]
impl BatchSource for ScriptedValidation {
    type Batch = KeyedFrameBatch;

    async fn begin_epoch(&mut self, epoch: usize) -> Result<()> {
        let idx = epoch.min(self.passes.len().saturating_sub(1));
        self.current = self.passes.get(idx).cloned().unwrap_or_default();
        self.cursor = 0;
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Option<KeyedFrameBatch>> {
        let batch = self.current.get(self.cursor).cloned();
        self.cursor += 1;
        Ok(batch)
    }
}

/// Training configuration writing into `output_dir`
pub fn training_config(output_dir: &Path, nb_epochs: usize) -> TrainingConfig {
    let mut config = TrainingConfig {
        nb_epochs,
        log_steps: 1,
        ..TrainingConfig::default()
    };
    config.optimizer.learning_rate = 1e-3;
    config.scheduler = SchedulerConfig {
        scheduler_type: SchedulerType::ReduceOnPlateau {
            patience: 1,
            factor: 0.1,
            threshold: 1e-4,
        },
        min_lr: 0.0,
    };
    config.checkpointing.output_dir = output_dir.to_path_buf();
    config
}

/// Controller over the pass-through model with scripted validation outcomes
pub fn scripted_trainer(config: TrainingConfig, b_correct: &[bool]) -> MotionTrainer {
    let (var_map, model) = pass_through();
    let handle = ModelHandle {
        model: Box::new(model),
        var_map,
        device: Device::Cpu,
        model_type: "No".to_string(),
    };
    let data = DataStreams {
        train: Box::new(InMemoryBatches::new(pass_through_train_batches())),
        validation: Box::new(ScriptedValidation::from_outcomes(b_correct)),
        ground_truth: two_video_ground_truth(),
        zero_indexed: false,
    };
    MotionTrainer::new(config, handle, data).unwrap()
}

pub fn temp_output_dir() -> TempDir {
    tempfile::tempdir().unwrap()
}
