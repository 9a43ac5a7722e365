//! Optimizers and learning rate schedulers for motion stream training
//!
//! The optimizer owns a handle to the model's [`VarMap`] and updates the
//! variables in place from a gradient store. Schedulers only compute a rate;
//! the controller applies it to the optimizer between epochs. Both expose a
//! serializable state dictionary that is stored in the checkpoint record.

pub mod schedulers;
pub mod sgd;

pub use schedulers::{ConstantScheduler, PlateauScheduler};
pub use sgd::SgdOptimizer;

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::training::config::{OptimizerConfig, SchedulerConfig, SchedulerType};

/// Trait for optimizers
pub trait Optimizer {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Apply one update from `gradients`
    fn step(&mut self, gradients: &GradStore) -> Result<()>;

    /// Current learning rate
    fn learning_rate(&self) -> f64;

    /// Set learning rate
    fn set_learning_rate(&mut self, lr: f64);

    /// Optimizer state for checkpointing
    fn state_dict(&self) -> Result<OptimizerStateDict>;

    /// Restore optimizer state from a checkpoint
    ///
    /// Implementations validate the whole dictionary before replacing any of
    /// their own state.
    fn load_state_dict(&mut self, state: OptimizerStateDict) -> Result<()>;

    /// Number of updates applied so far
    fn step_count(&self) -> usize;
}

/// Trait for learning rate schedulers
pub trait Scheduler {
    /// Scheduler name
    fn name(&self) -> &str;

    /// Advance by one epoch, optionally observing a metric
    fn step(&mut self, metric: Option<f64>);

    /// Current learning rate
    fn get_lr(&self) -> f64;

    /// Scheduler state for checkpointing
    fn state_dict(&self) -> SchedulerStateDict;

    /// Restore scheduler state from a checkpoint
    fn load_state_dict(&mut self, state: SchedulerStateDict) -> Result<()>;
}

/// Optimizer state dictionary for checkpointing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerStateDict {
    /// Optimizer type
    pub optimizer_type: String,

    /// Current step count
    pub step_count: usize,

    /// Current learning rate
    pub learning_rate: f64,

    /// Per-parameter buffers, keyed by variable name
    pub state: HashMap<String, TensorState>,

    /// Hyperparameters
    pub hyperparameters: HashMap<String, f64>,
}

/// Scheduler state dictionary for checkpointing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStateDict {
    /// Scheduler type
    pub scheduler_type: String,

    /// Number of epochs observed
    pub step_count: usize,

    /// Current learning rate
    pub current_lr: f64,

    /// Base learning rate
    pub base_lr: f64,

    /// Scheduler-specific state
    pub state: HashMap<String, f64>,

    /// Hyperparameters
    pub hyperparameters: HashMap<String, f64>,
}

/// Host copy of a tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorState {
    /// Tensor shape
    pub shape: Vec<usize>,

    /// Tensor data (flattened, row-major)
    pub data: Vec<f64>,

    /// Device the tensor lived on
    pub device: String,

    /// Data type
    pub dtype: String,
}

impl TensorState {
    /// Copy a tensor to the host
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let data = tensor
            .detach()
            .flatten_all()?
            .to_dtype(DType::F64)?
            .to_vec1::<f64>()?;
        Ok(Self {
            shape: tensor.dims().to_vec(),
            data,
            device: format!("{:?}", tensor.device().location()),
            dtype: tensor.dtype().as_str().to_string(),
        })
    }

    /// Rebuild the tensor on `device` with its original dtype
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let expected: usize = self.shape.iter().product();
        if expected != self.data.len() {
            return Err(Error::shape_mismatch(format!(
                "tensor state of shape {:?} holds {} values",
                self.shape,
                self.data.len()
            )));
        }
        let dtype = parse_dtype(&self.dtype)?;
        let tensor = Tensor::from_vec(self.data.clone(), self.shape.as_slice(), device)?;
        Ok(tensor.to_dtype(dtype)?)
    }
}

fn parse_dtype(name: &str) -> Result<DType> {
    match name {
        "f32" => Ok(DType::F32),
        "f64" => Ok(DType::F64),
        "f16" => Ok(DType::F16),
        "bf16" => Ok(DType::BF16),
        "u8" => Ok(DType::U8),
        "u32" => Ok(DType::U32),
        "i64" => Ok(DType::I64),
        other => Err(Error::data(format!("unsupported stored dtype '{}'", other))),
    }
}

/// Wrapper for optimizer state management
pub struct OptimizerState {
    optimizer: Box<dyn Optimizer + Send + Sync>,
}

impl OptimizerState {
    /// Create new optimizer state
    pub fn new(optimizer: Box<dyn Optimizer + Send + Sync>) -> Self {
        Self { optimizer }
    }

    /// Optimizer name
    pub fn name(&self) -> &str {
        self.optimizer.name()
    }

    /// Apply one update from already computed gradients
    pub fn step(&mut self, gradients: &GradStore) -> Result<()> {
        self.optimizer.step(gradients)
    }

    /// Compute fresh gradients of `loss` and apply one update
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let gradients = loss.backward()?;
        self.optimizer.step(&gradients)
    }

    /// Get current learning rate
    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Set learning rate
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr);
    }

    pub fn step_count(&self) -> usize {
        self.optimizer.step_count()
    }

    /// Get state dict for checkpointing
    pub fn state_dict(&self) -> Result<OptimizerStateDict> {
        self.optimizer.state_dict()
    }

    /// Load state dict from checkpoint
    pub fn load_state_dict(&mut self, state: OptimizerStateDict) -> Result<()> {
        self.optimizer.load_state_dict(state)
    }
}

/// Wrapper for scheduler state management
pub struct SchedulerState {
    scheduler: Box<dyn Scheduler + Send + Sync>,
}

impl SchedulerState {
    /// Create new scheduler state
    pub fn new(scheduler: Box<dyn Scheduler + Send + Sync>) -> Self {
        Self { scheduler }
    }

    pub fn name(&self) -> &str {
        self.scheduler.name()
    }

    /// Step the scheduler
    pub fn step(&mut self, metric: Option<f64>) {
        self.scheduler.step(metric);
    }

    /// Get current learning rate
    pub fn get_lr(&self) -> f64 {
        self.scheduler.get_lr()
    }

    /// Get state dict for checkpointing
    pub fn state_dict(&self) -> SchedulerStateDict {
        self.scheduler.state_dict()
    }

    /// Load state dict from checkpoint
    pub fn load_state_dict(&mut self, state: SchedulerStateDict) -> Result<()> {
        self.scheduler.load_state_dict(state)
    }
}

/// Create optimizer from configuration
pub fn create_optimizer(
    config: &OptimizerConfig,
    var_map: &VarMap,
    device: &Device,
) -> Result<OptimizerState> {
    config.validate()?;
    let optimizer = SgdOptimizer::new(
        var_map,
        device.clone(),
        config.learning_rate,
        config.momentum,
        config.weight_decay,
    );
    Ok(OptimizerState::new(Box::new(optimizer)))
}

/// Create scheduler from configuration
pub fn create_scheduler(config: &SchedulerConfig, base_lr: f64) -> Result<SchedulerState> {
    config.validate()?;
    let scheduler: Box<dyn Scheduler + Send + Sync> = match &config.scheduler_type {
        SchedulerType::ReduceOnPlateau {
            patience,
            factor,
            threshold,
        } => Box::new(PlateauScheduler::new(
            base_lr,
            *factor,
            *patience,
            *threshold,
            config.min_lr,
        )),
        SchedulerType::Constant => Box::new(ConstantScheduler::new(base_lr)),
    };
    Ok(SchedulerState::new(scheduler))
}
