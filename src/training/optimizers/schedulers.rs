//! Learning rate schedulers driven by epoch-level validation metrics

use std::collections::HashMap;

use tracing::{info, warn};

use super::{Scheduler, SchedulerStateDict};
use crate::error::{Error, Result};

/// Smallest change treated as an actual rate reduction
const MIN_LR_DELTA: f64 = 1e-8;

/// Reduce-on-plateau scheduler in `min` mode
///
/// A metric counts as an improvement when it is below
/// `best * (1 - threshold)`. Once more than `patience` consecutive epochs
/// fail to improve, the rate is multiplied by `factor` (never going below
/// `min_lr`) and the bad-epoch counter restarts.
pub struct PlateauScheduler {
    base_lr: f64,
    current_lr: f64,
    factor: f64,
    patience: usize,
    threshold: f64,
    min_lr: f64,
    best: f64,
    num_bad_epochs: usize,
    step_count: usize,
}

impl PlateauScheduler {
    pub fn new(base_lr: f64, factor: f64, patience: usize, threshold: f64, min_lr: f64) -> Self {
        Self {
            base_lr,
            current_lr: base_lr,
            factor,
            patience,
            threshold,
            min_lr,
            best: f64::INFINITY,
            num_bad_epochs: 0,
            step_count: 0,
        }
    }

    fn is_improvement(&self, metric: f64) -> bool {
        metric < self.best * (1.0 - self.threshold)
    }

    /// Best metric seen so far
    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn num_bad_epochs(&self) -> usize {
        self.num_bad_epochs
    }

    fn reduce(&mut self) {
        let reduced = (self.current_lr * self.factor).max(self.min_lr);
        if self.current_lr - reduced > MIN_LR_DELTA {
            info!(
                old_lr = self.current_lr,
                new_lr = reduced,
                "Validation loss plateaued, reducing learning rate"
            );
            self.current_lr = reduced;
        }
    }
}

impl Scheduler for PlateauScheduler {
    fn name(&self) -> &str {
        "reduce_on_plateau"
    }

    fn step(&mut self, metric: Option<f64>) {
        let Some(metric) = metric else {
            warn!("Plateau scheduler stepped without a validation loss, ignoring");
            return;
        };
        if !metric.is_finite() {
            warn!(metric, "Non-finite validation loss, skipping scheduler step");
            return;
        }

        self.step_count += 1;
        if self.is_improvement(metric) {
            self.best = metric;
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.num_bad_epochs > self.patience {
            self.reduce();
            self.num_bad_epochs = 0;
        }
    }

    fn get_lr(&self) -> f64 {
        self.current_lr
    }

    fn state_dict(&self) -> SchedulerStateDict {
        let mut state = HashMap::new();
        state.insert("best".to_string(), self.best);
        state.insert("num_bad_epochs".to_string(), self.num_bad_epochs as f64);

        let mut hyperparameters = HashMap::new();
        hyperparameters.insert("factor".to_string(), self.factor);
        hyperparameters.insert("patience".to_string(), self.patience as f64);
        hyperparameters.insert("threshold".to_string(), self.threshold);
        hyperparameters.insert("min_lr".to_string(), self.min_lr);

        SchedulerStateDict {
            scheduler_type: self.name().to_string(),
            step_count: self.step_count,
            current_lr: self.current_lr,
            base_lr: self.base_lr,
            state,
            hyperparameters,
        }
    }

    fn load_state_dict(&mut self, state_dict: SchedulerStateDict) -> Result<()> {
        if state_dict.scheduler_type != self.name() {
            return Err(Error::config(format!(
                "cannot load '{}' state into a {} scheduler",
                state_dict.scheduler_type,
                self.name()
            )));
        }
        let best = state_dict.state.get("best").copied().unwrap_or(f64::INFINITY);
        let bad = state_dict.state.get("num_bad_epochs").copied().unwrap_or(0.0);

        self.step_count = state_dict.step_count;
        self.current_lr = state_dict.current_lr;
        self.base_lr = state_dict.base_lr;
        self.best = best;
        self.num_bad_epochs = bad as usize;
        Ok(())
    }
}

/// Scheduler that keeps the base rate
pub struct ConstantScheduler {
    /// Base learning rate
    base_lr: f64,

    /// Current step
    current_step: usize,
}

impl ConstantScheduler {
    /// Create a new constant scheduler
    pub fn new(base_lr: f64) -> Self {
        Self {
            base_lr,
            current_step: 0,
        }
    }
}

impl Scheduler for ConstantScheduler {
    fn name(&self) -> &str {
        "constant"
    }

    fn step(&mut self, _metric: Option<f64>) {
        self.current_step += 1;
    }

    fn get_lr(&self) -> f64 {
        self.base_lr
    }

    fn state_dict(&self) -> SchedulerStateDict {
        SchedulerStateDict {
            scheduler_type: "constant".to_string(),
            step_count: self.current_step,
            current_lr: self.base_lr,
            base_lr: self.base_lr,
            state: HashMap::new(),
            hyperparameters: HashMap::new(),
        }
    }

    fn load_state_dict(&mut self, state_dict: SchedulerStateDict) -> Result<()> {
        self.current_step = state_dict.step_count;
        self.base_lr = state_dict.base_lr;
        Ok(())
    }
}
