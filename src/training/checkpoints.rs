//! Checkpoint persistence for motion stream training
//!
//! A run keeps two checkpoint slots in its output directory: `checkpoint.bin`
//! is overwritten after every epoch, `model_best.bin` only after an epoch that
//! improved the best video-level top-1. Records are bincode-encoded and
//! optionally gzip-compressed; compressed records are recognised by their
//! magic bytes on load, so the setting can change between runs.
//!
//! Every file is written to a sibling temp file, synced and renamed into
//! place, so a crash mid-write leaves the previous record intact.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::training::config::CheckpointingConfig;
use crate::training::optimizers::{OptimizerStateDict, SchedulerStateDict, TensorState};

/// File name of the checkpoint written every epoch
pub const LATEST_CHECKPOINT: &str = "checkpoint.bin";

/// File name of the checkpoint of the best epoch
pub const BEST_CHECKPOINT: &str = "model_best.bin";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Name-sorted host copy of every variable of a model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSnapshot {
    pub tensors: BTreeMap<String, TensorState>,
}

impl ParameterSnapshot {
    /// Copy every variable of `var_map` to the host
    pub fn capture(var_map: &VarMap) -> Result<Self> {
        let vars = var_map
            .data()
            .lock()
            .map_err(|_| Error::internal("parameter map lock poisoned"))?;
        let mut tensors = BTreeMap::new();
        for (name, var) in vars.iter() {
            tensors.insert(name.clone(), TensorState::from_tensor(var.as_tensor())?);
        }
        Ok(Self { tensors })
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Rebuild every tensor on `device`, checking names and shapes against
    /// `var_map` without modifying it
    pub fn prepare(&self, var_map: &VarMap, device: &Device) -> Result<Vec<(String, Tensor)>> {
        let vars = var_map
            .data()
            .lock()
            .map_err(|_| Error::internal("parameter map lock poisoned"))?;

        if let Some(missing) = vars.keys().find(|name| !self.tensors.contains_key(*name)) {
            return Err(Error::shape_mismatch(format!(
                "snapshot has no value for parameter '{}'",
                missing
            )));
        }

        let mut prepared = Vec::with_capacity(self.tensors.len());
        for (name, state) in &self.tensors {
            let var = vars.get(name).ok_or_else(|| {
                Error::shape_mismatch(format!("snapshot parameter '{}' is not in the model", name))
            })?;
            if var.dims() != state.shape.as_slice() {
                return Err(Error::shape_mismatch(format!(
                    "parameter '{}' has shape {:?} in the snapshot but {:?} in the model",
                    name,
                    state.shape,
                    var.dims()
                )));
            }
            let tensor = state.to_tensor(device)?.to_dtype(var.dtype())?;
            prepared.push((name.clone(), tensor));
        }
        Ok(prepared)
    }

    /// Overwrite the variables of `var_map`; nothing is written unless every
    /// tensor fits
    pub fn restore(&self, var_map: &VarMap, device: &Device) -> Result<()> {
        let prepared = self.prepare(var_map, device)?;
        apply_prepared(var_map, &prepared)
    }
}

/// Write tensors produced by [`ParameterSnapshot::prepare`] into `var_map`
pub fn apply_prepared(var_map: &VarMap, prepared: &[(String, Tensor)]) -> Result<()> {
    let vars = var_map
        .data()
        .lock()
        .map_err(|_| Error::internal("parameter map lock poisoned"))?;
    for (name, tensor) in prepared {
        if let Some(var) = vars.get(name) {
            var.set(tensor)?;
        }
    }
    Ok(())
}

/// Everything needed to resume a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingCheckpoint {
    /// Next epoch to run
    pub epoch: usize,

    /// Best video-level top-1 so far, in percent
    pub best_score: f64,

    /// Pretraining label of the run ("No", "ImageNet", "Transfer")
    pub model_type: String,

    /// Model parameters
    pub model_state: ParameterSnapshot,

    /// Optimizer state
    pub optimizer_state: Option<OptimizerStateDict>,

    /// Scheduler state
    pub scheduler_state: Option<SchedulerStateDict>,

    /// Time the record was created
    pub timestamp: DateTime<Utc>,
}

/// Reads and writes the checkpoint slots and prediction side file of a run
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    output_dir: PathBuf,
    compression: bool,
}

impl CheckpointManager {
    /// Create a manager writing to `output_dir`, creating it if needed
    pub fn new<P: AsRef<Path>>(output_dir: P, compression: bool) -> Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        fs::create_dir_all(&output_dir)?;
        Ok(Self {
            output_dir,
            compression,
        })
    }

    pub fn from_config(config: &CheckpointingConfig) -> Result<Self> {
        Self::new(&config.output_dir, config.compression)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn latest_path(&self) -> PathBuf {
        self.output_dir.join(LATEST_CHECKPOINT)
    }

    pub fn best_path(&self) -> PathBuf {
        self.output_dir.join(BEST_CHECKPOINT)
    }

    /// Path of the best checkpoint, if one has been written
    pub fn best_checkpoint_path(&self) -> Option<PathBuf> {
        let path = self.best_path();
        path.is_file().then_some(path)
    }

    /// Path of the per-video prediction file for `model_type`
    pub fn predictions_path(&self, model_type: &str) -> PathBuf {
        self.output_dir
            .join(format!("motion_video_preds_{}.json", model_type))
    }

    /// Write `checkpoint` to the latest slot, and to the best slot as well
    /// when `is_best`
    pub fn save(&self, checkpoint: &TrainingCheckpoint, is_best: bool) -> Result<PathBuf> {
        let bytes = self.encode(checkpoint)?;

        let latest = self.latest_path();
        write_atomic(&latest, &bytes)?;
        debug!(path = %latest.display(), bytes = bytes.len(), "Wrote latest checkpoint");

        if is_best {
            let best = self.best_path();
            write_atomic(&best, &bytes)?;
            info!(
                path = %best.display(),
                epoch = checkpoint.epoch,
                best_score = checkpoint.best_score,
                "Wrote best checkpoint"
            );
        }
        Ok(latest)
    }

    /// Read a checkpoint record
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<TrainingCheckpoint> {
        load_checkpoint(path)
    }

    /// Write the accumulated per-video score sums as a JSON object
    pub fn save_video_predictions(
        &self,
        model_type: &str,
        predictions: &BTreeMap<String, Vec<f64>>,
    ) -> Result<PathBuf> {
        let path = self.predictions_path(model_type);
        let bytes = serde_json::to_vec(predictions)?;
        write_atomic(&path, &bytes)?;
        debug!(path = %path.display(), videos = predictions.len(), "Wrote video predictions");
        Ok(path)
    }

    fn encode(&self, checkpoint: &TrainingCheckpoint) -> Result<Vec<u8>> {
        let raw = bincode::serialize(checkpoint)?;
        if !self.compression {
            return Ok(raw);
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        Ok(encoder.finish()?)
    }
}

/// Read a checkpoint record from `path`
///
/// A missing file is [`Error::CheckpointNotFound`]; a file that cannot be
/// decompressed or decoded is [`Error::CheckpointCorrupt`].
pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<TrainingCheckpoint> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(Error::CheckpointNotFound(path.to_path_buf()));
    }

    let bytes = fs::read(path)?;
    if bytes.is_empty() {
        return Err(Error::checkpoint_corrupt(path, "file is empty"));
    }

    let raw = if bytes.starts_with(&GZIP_MAGIC) {
        let mut decoded = Vec::new();
        GzDecoder::new(bytes.as_slice())
            .read_to_end(&mut decoded)
            .map_err(|e| Error::checkpoint_corrupt(path, format!("gzip: {}", e)))?;
        decoded
    } else {
        bytes
    };

    bincode::deserialize(&raw).map_err(|e| Error::checkpoint_corrupt(path, e.to_string()))
}

/// Write `bytes` to `path` through a synced temp file and a rename
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::config(format!("'{}' has no file name", path.display())))?;
    let mut temp_name = file_name.to_os_string();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}
