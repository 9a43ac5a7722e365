//! Configuration structures for a motion stream run
//!
//! A run is described by [`RunConfig`]; it can be read from a JSON, YAML or
//! TOML file layered with `MOTION_`-prefixed environment variables, and the
//! command line overrides individual values on top of that.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::Pretraining;
use crate::training::config::TrainingConfig;

/// Complete configuration of one training or evaluation run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Network configuration
    pub model: ModelConfig,
    /// Optimisation, scheduling and checkpointing
    pub training: TrainingConfig,
    /// Dataset layout and batching
    pub data: DataConfig,
    /// Device and worker settings
    pub runtime: RuntimeConfig,
}

impl RunConfig {
    /// Load configuration from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::config(format!(
                    "configuration file {} does not exist",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("MOTION")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Align derived fields with the selected dataset and stacking depth
    pub fn resolve(mut self) -> Self {
        self.model.num_classes = self.data.dataset.num_classes();
        self.model.in_channels = 2 * self.data.stack_len;
        self
    }

    /// Validate the whole configuration
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.training.validate()?;
        self.data.validate()?;

        if self.model.num_classes != self.data.dataset.num_classes() {
            return Err(Error::config(format!(
                "model has {} classes but {} has {}",
                self.model.num_classes,
                self.data.dataset,
                self.data.dataset.num_classes()
            )));
        }
        if self.model.in_channels != 2 * self.data.stack_len {
            return Err(Error::config(format!(
                "model expects {} input channels but a stack of {} flow frames yields {}",
                self.model.in_channels,
                self.data.stack_len,
                2 * self.data.stack_len
            )));
        }
        Ok(())
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Input channels (two per stacked flow frame)
    pub in_channels: usize,
    /// Number of action classes
    pub num_classes: usize,
    /// Width of the stem and first residual stage
    pub base_width: usize,
    /// Residual blocks per stage; the width doubles after each stage
    pub stage_blocks: Vec<usize>,
    /// Dropout before the classifier head
    pub dropout: f32,
    /// Weight initialisation source
    pub pretraining: Pretraining,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            in_channels: 20,
            num_classes: 101,
            base_width: 64,
            stage_blocks: vec![2, 2, 2, 2],
            dropout: 0.5,
            pretraining: Pretraining::NoPretrain,
        }
    }
}

impl ModelConfig {
    /// Validate the network configuration
    pub fn validate(&self) -> Result<()> {
        if self.in_channels == 0 {
            return Err(Error::config("in_channels must be > 0"));
        }
        if self.num_classes < 2 {
            return Err(Error::config("num_classes must be at least 2"));
        }
        if self.base_width == 0 {
            return Err(Error::config("base_width must be > 0"));
        }
        if self.stage_blocks.is_empty() || self.stage_blocks.contains(&0) {
            return Err(Error::config("every stage needs at least one residual block"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::config("dropout must be in [0, 1)"));
        }
        Ok(())
    }
}

/// Dataset layout and batching
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Which dataset the split files describe
    pub dataset: DatasetKind,
    /// Root of the `u/` and `v/` flow image directories
    pub flow_dir: PathBuf,
    /// Directory holding `classInd.txt`, `trainlistXX.txt` and `testlistXX.txt`
    pub split_dir: PathBuf,
    /// Split identifier, e.g. `01`
    pub split: String,
    /// Consecutive flow frames stacked into one input
    pub stack_len: usize,
    /// Side length the flow images are resized to
    pub image_size: usize,
    /// Evenly spaced clips sampled per validation video
    pub clips_per_video: usize,
    /// Mini-batch size
    pub batch_size: usize,
    /// Batches decoded ahead of the consumer
    pub prefetch_batches: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetKind::Ucf101,
            flow_dir: PathBuf::from("data/ucf101_flow"),
            split_dir: PathBuf::from("data/ucf101_splits"),
            split: "01".to_string(),
            stack_len: 10,
            image_size: 224,
            clips_per_video: 19,
            batch_size: 8,
            prefetch_batches: 4,
        }
    }
}

impl DataConfig {
    /// Validate the data configuration
    pub fn validate(&self) -> Result<()> {
        if self.stack_len == 0 {
            return Err(Error::config("stack_len must be > 0"));
        }
        if self.image_size == 0 {
            return Err(Error::config("image_size must be > 0"));
        }
        if self.clips_per_video == 0 {
            return Err(Error::config("clips_per_video must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be > 0"));
        }
        if self.prefetch_batches == 0 {
            return Err(Error::config("prefetch_batches must be > 0"));
        }
        Ok(())
    }
}

/// Device and worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Compute device
    pub device: DeviceConfig,
    /// Seed for clip sampling
    pub seed: u64,
    /// Decoder threads used by the batch producer
    pub num_workers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::Cpu,
            seed: 42,
            num_workers: num_cpus::get(),
        }
    }
}

/// Supported datasets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DatasetKind {
    /// UCF101: 101 classes, labels are 1-based
    Ucf101,
    /// HMDB51: 51 classes, labels are 0-based
    Hmdb51,
}

impl DatasetKind {
    /// Number of action classes
    pub fn num_classes(&self) -> usize {
        match self {
            Self::Ucf101 => 101,
            Self::Hmdb51 => 51,
        }
    }

    /// Whether ground-truth labels already start at zero
    pub fn zero_indexed(&self) -> bool {
        matches!(self, Self::Hmdb51)
    }

    /// Canonical dataset name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ucf101 => "UCF101",
            Self::Hmdb51 => "HMDB51",
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DatasetKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "UCF101" => Ok(Self::Ucf101),
            "HMDB51" => Ok(Self::Hmdb51),
            _ => Err(Error::config(format!(
                "unsupported dataset '{}': only UCF101 and HMDB51 are supported",
                s
            ))),
        }
    }
}

impl TryFrom<String> for DatasetKind {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DatasetKind> for String {
    fn from(kind: DatasetKind) -> Self {
        kind.name().to_string()
    }
}

/// Compute device selection, passed explicitly to model construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceConfig {
    /// Host CPU
    Cpu,
    /// CUDA device by ordinal
    Cuda(usize),
    /// Metal device by ordinal
    Metal(usize),
}

impl DeviceConfig {
    /// Open the configured device
    pub fn to_device(&self) -> Result<Device> {
        let device = match self {
            Self::Cpu => Device::Cpu,
            Self::Cuda(ordinal) => Device::new_cuda(*ordinal)?,
            Self::Metal(ordinal) => Device::new_metal(*ordinal)?,
        };
        Ok(device)
    }
}

impl fmt::Display for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda(ordinal) => write!(f, "cuda:{}", ordinal),
            Self::Metal(ordinal) => write!(f, "metal:{}", ordinal),
        }
    }
}

impl FromStr for DeviceConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let (kind, ordinal) = match lower.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal
                    .parse::<usize>()
                    .map_err(|_| Error::config(format!("invalid device ordinal in '{}'", s)))?;
                (kind.to_string(), ordinal)
            }
            None => (lower.clone(), 0),
        };
        match kind.as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda(ordinal)),
            "metal" => Ok(Self::Metal(ordinal)),
            _ => Err(Error::config(format!(
                "unknown device '{}': expected cpu, cuda:N or metal:N",
                s
            ))),
        }
    }
}

impl TryFrom<String> for DeviceConfig {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DeviceConfig> for String {
    fn from(device: DeviceConfig) -> Self {
        device.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("UCF101", DatasetKind::Ucf101 ; "upper ucf")]
    #[test_case("hmdb51", DatasetKind::Hmdb51 ; "lower hmdb")]
    fn test_dataset_parsing(input: &str, expected: DatasetKind) {
        assert_eq!(input.parse::<DatasetKind>().unwrap(), expected);
    }

    #[test]
    fn test_unsupported_dataset_is_config_error() {
        let err = "Kinetics400".parse::<DatasetKind>().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_dataset_conventions() {
        assert_eq!(DatasetKind::Ucf101.num_classes(), 101);
        assert!(!DatasetKind::Ucf101.zero_indexed());
        assert_eq!(DatasetKind::Hmdb51.num_classes(), 51);
        assert!(DatasetKind::Hmdb51.zero_indexed());
    }

    #[test_case("cpu", DeviceConfig::Cpu ; "cpu")]
    #[test_case("cuda:1", DeviceConfig::Cuda(1) ; "cuda with ordinal")]
    #[test_case("CUDA", DeviceConfig::Cuda(0) ; "cuda default ordinal")]
    #[test_case("metal:0", DeviceConfig::Metal(0) ; "metal")]
    fn test_device_parsing(input: &str, expected: DeviceConfig) {
        assert_eq!(input.parse::<DeviceConfig>().unwrap(), expected);
    }

    #[test]
    fn test_resolve_aligns_with_dataset() {
        let mut config = RunConfig::default();
        config.data.dataset = DatasetKind::Hmdb51;
        config.data.stack_len = 5;
        let config = config.resolve();

        assert_eq!(config.model.num_classes, 51);
        assert_eq!(config.model.in_channels, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_class_mismatch() {
        let mut config = RunConfig::default();
        config.model.num_classes = 51;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(
            &path,
            r#"{ "data": { "dataset": "HMDB51", "batch_size": 4 }, "runtime": { "device": "cpu" } }"#,
        )
        .unwrap();

        let config = RunConfig::load(Some(&path)).unwrap().resolve();
        assert_eq!(config.data.dataset, DatasetKind::Hmdb51);
        assert_eq!(config.data.batch_size, 4);
        assert_eq!(config.data.stack_len, 10);
        assert_eq!(config.model.num_classes, 51);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = RunConfig::load(Some(Path::new("/nonexistent/run.json"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
