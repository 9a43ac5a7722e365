//! SGD optimizer implementation with momentum
//!
//! Update rule, per parameter `p` with gradient `g`:
//!
//! ```text
//! g   = g + weight_decay * p
//! buf = momentum * buf + g        (buf = g on the first step)
//! p   = p - lr * buf
//! ```

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor};
use candle_nn::VarMap;

use super::{Optimizer, OptimizerStateDict, TensorState};
use crate::error::{Error, Result};

/// SGD optimizer with momentum
pub struct SgdOptimizer {
    /// Variable map containing parameters
    var_map: VarMap,

    /// Device the momentum buffers live on
    device: Device,

    /// Learning rate
    learning_rate: f64,

    /// Momentum coefficient
    momentum: f64,

    /// Weight decay coefficient
    weight_decay: f64,

    /// Current step count
    step_count: usize,

    /// Momentum buffers keyed by variable name
    momentum_buffers: HashMap<String, Tensor>,
}

impl SgdOptimizer {
    /// Create a new SGD optimizer over every variable of `var_map`
    pub fn new(
        var_map: &VarMap,
        device: Device,
        learning_rate: f64,
        momentum: f64,
        weight_decay: f64,
    ) -> Self {
        Self {
            var_map: var_map.clone(),
            device,
            learning_rate,
            momentum,
            weight_decay,
            step_count: 0,
            momentum_buffers: HashMap::new(),
        }
    }

    /// Direction to move `param` in, updating its momentum buffer
    fn update_direction(&mut self, name: &str, param: &Tensor, grad: &Tensor) -> Result<Tensor> {
        let grad = if self.weight_decay > 0.0 {
            (grad + (param.detach() * self.weight_decay)?)?.detach()
        } else {
            grad.detach()
        };

        if self.momentum == 0.0 {
            return Ok(grad);
        }

        let buffer = match self.momentum_buffers.get(name) {
            Some(previous) => ((previous * self.momentum)? + &grad)?,
            None => grad,
        }
        .detach();
        self.momentum_buffers.insert(name.to_string(), buffer.clone());
        Ok(buffer)
    }

    pub fn momentum_buffers(&self) -> &HashMap<String, Tensor> {
        &self.momentum_buffers
    }
}

impl Optimizer for SgdOptimizer {
    fn name(&self) -> &str {
        if self.momentum > 0.0 {
            "sgd_momentum"
        } else {
            "sgd"
        }
    }

    fn step(&mut self, gradients: &GradStore) -> Result<()> {
        let var_map = self.var_map.clone();
        let vars = var_map
            .data()
            .lock()
            .map_err(|_| Error::internal("parameter map lock poisoned"))?;

        let mut names: Vec<&String> = vars.keys().collect();
        names.sort();

        for name in names {
            let var = &vars[name];
            let Some(grad) = gradients.get(var.as_tensor()) else {
                continue;
            };
            let direction = self.update_direction(name, var.as_tensor(), grad)?;
            let updated = var.as_tensor().sub(&(direction * self.learning_rate)?)?;
            var.set(&updated)?;
        }

        self.step_count += 1;
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn state_dict(&self) -> Result<OptimizerStateDict> {
        let mut state = HashMap::new();
        for (name, tensor) in &self.momentum_buffers {
            state.insert(name.clone(), TensorState::from_tensor(tensor)?);
        }

        let mut hyperparameters = HashMap::new();
        hyperparameters.insert("momentum".to_string(), self.momentum);
        hyperparameters.insert("weight_decay".to_string(), self.weight_decay);

        Ok(OptimizerStateDict {
            optimizer_type: self.name().to_string(),
            step_count: self.step_count,
            learning_rate: self.learning_rate,
            state,
            hyperparameters,
        })
    }

    fn load_state_dict(&mut self, state_dict: OptimizerStateDict) -> Result<()> {
        if !state_dict.optimizer_type.starts_with("sgd") {
            return Err(Error::config(format!(
                "cannot load '{}' state into an SGD optimizer",
                state_dict.optimizer_type
            )));
        }

        let mut buffers = HashMap::with_capacity(state_dict.state.len());
        {
            let vars = self
                .var_map
                .data()
                .lock()
                .map_err(|_| Error::internal("parameter map lock poisoned"))?;
            for (name, tensor_state) in &state_dict.state {
                let var = vars.get(name).ok_or_else(|| {
                    Error::shape_mismatch(format!("momentum buffer for unknown parameter '{}'", name))
                })?;
                if var.dims() != tensor_state.shape.as_slice() {
                    return Err(Error::shape_mismatch(format!(
                        "momentum buffer '{}' has shape {:?}, parameter has {:?}",
                        name,
                        tensor_state.shape,
                        var.dims()
                    )));
                }
                buffers.insert(name.clone(), tensor_state.to_tensor(&self.device)?);
            }
        }

        self.step_count = state_dict.step_count;
        self.learning_rate = state_dict.learning_rate;
        if let Some(&momentum) = state_dict.hyperparameters.get("momentum") {
            self.momentum = momentum;
        }
        if let Some(&weight_decay) = state_dict.hyperparameters.get("weight_decay") {
            self.weight_decay = weight_decay;
        }
        self.momentum_buffers = buffers;
        Ok(())
    }

    fn step_count(&self) -> usize {
        self.step_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::DType;
    use candle_nn::Init;

    fn single_weight(value: f64) -> (VarMap, Tensor) {
        let var_map = VarMap::new();
        let w = var_map
            .get(2, "w", Init::Const(value), DType::F32, &Device::Cpu)
            .unwrap();
        (var_map, w)
    }

    fn weight_values(var_map: &VarMap) -> Vec<f32> {
        let vars = var_map.data().lock().unwrap();
        vars["w"].as_tensor().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_sgd_optimizer_creation() {
        let var_map = VarMap::new();
        let opt = SgdOptimizer::new(&var_map, Device::Cpu, 0.01, 0.9, 0.0001);

        assert_eq!(opt.name(), "sgd_momentum");
        assert_eq!(opt.learning_rate(), 0.01);
        assert_eq!(opt.step_count(), 0);
    }

    #[test]
    fn test_sgd_without_momentum() {
        let var_map = VarMap::new();
        let optimizer = SgdOptimizer::new(&var_map, Device::Cpu, 0.01, 0.0, 0.0001);
        assert_eq!(optimizer.name(), "sgd");
    }

    #[test]
    fn test_momentum_update_matches_reference() {
        let (var_map, w) = single_weight(1.0);
        let mut opt = SgdOptimizer::new(&var_map, Device::Cpu, 0.1, 0.9, 0.0);

        // loss = sum(w^2), grad = 2w
        let loss = w.sqr().unwrap().sum_all().unwrap();
        opt.step(&loss.backward().unwrap()).unwrap();
        assert_relative_eq!(weight_values(&var_map)[0], 0.8, epsilon = 1e-6);

        let w = var_map.data().lock().unwrap()["w"].as_tensor().clone();
        let loss = w.sqr().unwrap().sum_all().unwrap();
        opt.step(&loss.backward().unwrap()).unwrap();
        // buf = 0.9 * 2.0 + 1.6 = 3.4
        assert_relative_eq!(weight_values(&var_map)[0], 0.46, epsilon = 1e-6);
        assert_eq!(opt.step_count(), 2);
    }

    #[test]
    fn test_weight_decay_adds_to_gradient() {
        let (var_map, w) = single_weight(1.0);
        let mut opt = SgdOptimizer::new(&var_map, Device::Cpu, 0.1, 0.0, 0.5);

        let loss = w.sum_all().unwrap();
        opt.step(&loss.backward().unwrap()).unwrap();
        // grad = 1 + 0.5 * 1
        assert_relative_eq!(weight_values(&var_map)[1], 0.85, epsilon = 1e-6);
    }

    #[test]
    fn test_weight_decay_buffers_hold_no_graph() {
        let (var_map, _) = single_weight(1.0);
        let mut opt = SgdOptimizer::new(&var_map, Device::Cpu, 0.1, 0.9, 0.01);

        for _ in 0..3 {
            let w = var_map.data().lock().unwrap()["w"].as_tensor().clone();
            let loss = w.sqr().unwrap().sum_all().unwrap();
            opt.step(&loss.backward().unwrap()).unwrap();
        }

        let buffer = &opt.momentum_buffers()["w"];
        assert!(!buffer.track_op());
        let w = var_map.data().lock().unwrap()["w"].as_tensor().clone();
        assert!(w.is_variable());
    }

    #[test]
    fn test_state_dict_round_trip_restores_momentum() {
        let (var_map, w) = single_weight(1.0);
        let mut opt = SgdOptimizer::new(&var_map, Device::Cpu, 0.1, 0.9, 0.0);
        let loss = w.sqr().unwrap().sum_all().unwrap();
        opt.step(&loss.backward().unwrap()).unwrap();

        let state_dict = opt.state_dict().unwrap();
        assert_eq!(state_dict.state["w"].data, vec![2.0, 2.0]);

        let mut restored = SgdOptimizer::new(&var_map, Device::Cpu, 0.5, 0.9, 0.0);
        restored.load_state_dict(state_dict).unwrap();
        assert_eq!(restored.learning_rate(), 0.1);
        assert_eq!(restored.step_count(), 1);
        let buffer = restored.momentum_buffers()["w"].to_vec1::<f32>().unwrap();
        assert_eq!(buffer, vec![2.0, 2.0]);
    }

    #[test]
    fn test_load_rejects_mismatched_buffer_without_mutating() {
        let (var_map, _) = single_weight(1.0);
        let mut opt = SgdOptimizer::new(&var_map, Device::Cpu, 0.1, 0.9, 0.0);
        let mut state = HashMap::new();
        state.insert(
            "w".to_string(),
            TensorState {
                shape: vec![3],
                data: vec![0.0; 3],
                device: "Cpu".to_string(),
                dtype: "f32".to_string(),
            },
        );
        let state_dict = OptimizerStateDict {
            optimizer_type: "sgd_momentum".to_string(),
            step_count: 9,
            learning_rate: 0.5,
            state,
            hyperparameters: HashMap::new(),
        };

        assert!(opt.load_state_dict(state_dict).is_err());
        assert_eq!(opt.step_count(), 0);
        assert_eq!(opt.learning_rate(), 0.1);
    }
}
