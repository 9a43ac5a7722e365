//! Frame classifier for the motion stream
//!
//! [`MotionNet`] is a compact residual network over stacked optical-flow
//! frames. Variable names follow the usual ResNet layout (`conv1`, `bn1`,
//! `layer<N>.<block>.…`, `fc`) so weights exported from an RGB ResNet can be
//! imported by name; see [`pretrained`].

pub mod pretrained;

pub use pretrained::{import_tensors, import_weights, ImportReport};

use std::fmt;
use std::path::PathBuf;

use candle_core::{DType, Device, Module, ModuleT, Tensor};
use candle_nn::{
    batch_norm, conv2d_no_bias, linear, BatchNorm, Conv2d, Conv2dConfig, Dropout, Linear,
    VarBuilder, VarMap,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ModelConfig;
use crate::error::{Error, Result};

const BN_EPS: f64 = 1e-5;

/// A network mapping a `[N, C, H, W]` batch of frames to `[N, num_classes]` scores
pub trait FrameClassifier: ModuleT + Send {
    fn num_classes(&self) -> usize;
}

/// Source of the initial weights
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum Pretraining {
    /// Random initialisation
    #[default]
    NoPretrain,
    /// RGB ImageNet weights, adapted to the flow input
    ImageNetPretrain(PathBuf),
    /// Weights of a network trained on another task
    TransferPretrain(PathBuf),
}

impl Pretraining {
    /// Resolve the command-line mode flag (`no`, `imagenet`, `transfer`, any case)
    pub fn resolve(
        mode: &str,
        imagenet_weights: Option<PathBuf>,
        transfer_path: Option<PathBuf>,
    ) -> Result<Self> {
        match mode.to_ascii_lowercase().as_str() {
            "no" | "none" => Ok(Self::NoPretrain),
            "imagenet" | "pretrained" => imagenet_weights.map(Self::ImageNetPretrain).ok_or_else(|| {
                Error::config("ImageNet pretraining requires a weights file (--imagenet-weights)")
            }),
            "transfer" => transfer_path.map(Self::TransferPretrain).ok_or_else(|| {
                Error::config("transfer pretraining requires a model path (--transfer-path)")
            }),
            other => Err(Error::config(format!(
                "unknown pretraining mode '{}', expected no, imagenet or transfer",
                other
            ))),
        }
    }

    /// Label used in output file names
    pub fn label(&self) -> &'static str {
        match self {
            Self::NoPretrain => "No",
            Self::ImageNetPretrain(_) => "ImageNet",
            Self::TransferPretrain(_) => "Transfer",
        }
    }

    /// Weights file to import, if any
    pub fn weights_path(&self) -> Option<&PathBuf> {
        match self {
            Self::NoPretrain => None,
            Self::ImageNetPretrain(path) | Self::TransferPretrain(path) => Some(path),
        }
    }
}

impl fmt::Display for Pretraining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Two 3x3 convolutions with a residual connection
struct BasicBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    downsample: Option<(Conv2d, BatchNorm)>,
}

impl BasicBlock {
    fn new(in_channels: usize, out_channels: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let conv3x3 = |stride| Conv2dConfig {
            padding: 1,
            stride,
            ..Default::default()
        };

        let conv1 = conv2d_no_bias(in_channels, out_channels, 3, conv3x3(stride), vb.pp("conv1"))?;
        let bn1 = batch_norm(out_channels, BN_EPS, vb.pp("bn1"))?;
        let conv2 = conv2d_no_bias(out_channels, out_channels, 3, conv3x3(1), vb.pp("conv2"))?;
        let bn2 = batch_norm(out_channels, BN_EPS, vb.pp("bn2"))?;

        let downsample = if stride != 1 || in_channels != out_channels {
            let vb = vb.pp("downsample");
            let conv = conv2d_no_bias(
                in_channels,
                out_channels,
                1,
                Conv2dConfig {
                    stride,
                    ..Default::default()
                },
                vb.pp("0"),
            )?;
            let bn = batch_norm(out_channels, BN_EPS, vb.pp("1"))?;
            Some((conv, bn))
        } else {
            None
        };

        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
            downsample,
        })
    }
}

impl ModuleT for BasicBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let out = self.conv1.forward(xs)?;
        let out = self.bn1.forward_t(&out, train)?.relu()?;
        let out = self.conv2.forward(&out)?;
        let out = self.bn2.forward_t(&out, train)?;

        let shortcut = match &self.downsample {
            Some((conv, bn)) => bn.forward_t(&conv.forward(xs)?, train)?,
            None => xs.clone(),
        };
        (out + shortcut)?.relu()
    }
}

/// Residual CNN over stacked flow frames
pub struct MotionNet {
    conv1: Conv2d,
    bn1: BatchNorm,
    stages: Vec<Vec<BasicBlock>>,
    dropout: Dropout,
    fc: Linear,
    num_classes: usize,
}

impl MotionNet {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let stem = Conv2dConfig {
            padding: 3,
            stride: 2,
            ..Default::default()
        };
        let conv1 = conv2d_no_bias(config.in_channels, config.base_width, 7, stem, vb.pp("conv1"))?;
        let bn1 = batch_norm(config.base_width, BN_EPS, vb.pp("bn1"))?;

        let mut stages = Vec::with_capacity(config.stage_blocks.len());
        let mut in_channels = config.base_width;
        for (idx, &blocks) in config.stage_blocks.iter().enumerate() {
            let out_channels = config.base_width << idx;
            let stage_vb = vb.pp(format!("layer{}", idx + 1));
            let mut stage = Vec::with_capacity(blocks);
            for block in 0..blocks {
                let stride = if idx > 0 && block == 0 { 2 } else { 1 };
                stage.push(BasicBlock::new(
                    in_channels,
                    out_channels,
                    stride,
                    stage_vb.pp(block.to_string()),
                )?);
                in_channels = out_channels;
            }
            stages.push(stage);
        }

        let fc = linear(in_channels, config.num_classes, vb.pp("fc"))?;

        Ok(Self {
            conv1,
            bn1,
            stages,
            dropout: Dropout::new(config.dropout),
            fc,
            num_classes: config.num_classes,
        })
    }
}

impl ModuleT for MotionNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut xs = self.conv1.forward(xs)?;
        xs = self.bn1.forward_t(&xs, train)?.relu()?;
        xs = xs.max_pool2d_with_stride(2, 2)?;

        for stage in &self.stages {
            for block in stage {
                xs = block.forward_t(&xs, train)?;
            }
        }

        // global average pool over H and W
        let xs = xs.mean((2, 3))?;
        let xs = self.dropout.forward_t(&xs, train)?;
        self.fc.forward(&xs)
    }
}

impl FrameClassifier for MotionNet {
    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

/// Build a [`MotionNet`] on `device` and import its initial weights
///
/// Returns the variable map holding every trainable parameter along with the
/// network.
pub fn build_model(config: &ModelConfig, device: &Device) -> Result<(VarMap, MotionNet)> {
    let var_map = VarMap::new();
    let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
    let model = MotionNet::new(config, vb)?;

    if let Some(report) = import_weights(&var_map, &config.pretraining, device)? {
        info!(
            source = %config.pretraining,
            copied = report.copied.len(),
            adapted = report.adapted.len(),
            skipped = report.skipped.len(),
            "Imported pretrained weights"
        );
    }

    info!(
        in_channels = config.in_channels,
        num_classes = config.num_classes,
        parameters = var_map.all_vars().len(),
        "Built motion network"
    );
    Ok((var_map, model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            in_channels: 4,
            num_classes: 5,
            base_width: 4,
            stage_blocks: vec![1, 1],
            dropout: 0.0,
            pretraining: Pretraining::NoPretrain,
        }
    }

    #[test_case("no", Pretraining::NoPretrain ; "lowercase no")]
    #[test_case("No", Pretraining::NoPretrain ; "capitalised no")]
    #[test_case("IMAGENET", Pretraining::ImageNetPretrain(PathBuf::from("rgb.safetensors")) ; "upper imagenet")]
    #[test_case("Transfer", Pretraining::TransferPretrain(PathBuf::from("deeplab.safetensors")) ; "transfer")]
    fn test_resolve_pretraining(mode: &str, expected: Pretraining) {
        let resolved = Pretraining::resolve(
            mode,
            Some(PathBuf::from("rgb.safetensors")),
            Some(PathBuf::from("deeplab.safetensors")),
        )
        .unwrap();
        assert_eq!(resolved, expected);
    }

    #[test]
    fn test_resolve_requires_paths() {
        assert!(matches!(
            Pretraining::resolve("imagenet", None, None),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Pretraining::resolve("transfer", None, None),
            Err(Error::Config(_))
        ));
        assert!(Pretraining::resolve("scratch", None, None).is_err());
    }

    #[test]
    fn test_labels() {
        assert_eq!(Pretraining::NoPretrain.label(), "No");
        assert_eq!(Pretraining::ImageNetPretrain(PathBuf::new()).to_string(), "ImageNet");
    }

    #[test]
    fn test_forward_shape() {
        let (_, model) = build_model(&tiny_config(), &Device::Cpu).unwrap();
        let xs = Tensor::rand(0f32, 1f32, (2, 4, 32, 32), &Device::Cpu).unwrap();

        let train_out = model.forward_t(&xs, true).unwrap();
        let eval_out = model.forward_t(&xs, false).unwrap();
        assert_eq!(train_out.dims(), &[2, 5]);
        assert_eq!(eval_out.dims(), &[2, 5]);
        assert_eq!(model.num_classes(), 5);
    }

    #[test]
    fn test_variable_names_follow_resnet_layout() {
        let (var_map, _) = build_model(&tiny_config(), &Device::Cpu).unwrap();
        let vars = var_map.data().lock().unwrap();

        assert_eq!(vars["conv1.weight"].dims(), &[4, 4, 7, 7]);
        assert!(vars.contains_key("layer1.0.conv1.weight"));
        assert!(vars.contains_key("layer2.0.downsample.0.weight"));
        assert!(vars.contains_key("bn1.running_mean"));
        assert_eq!(vars["fc.weight"].dims(), &[5, 8]);
    }
}
