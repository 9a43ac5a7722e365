//! Frame-to-video prediction aggregation
//!
//! Validation frames arrive in arbitrary order and batch composition. Each
//! frame's class-score vector is added to the running sum of its video, and
//! the sums are scored against video-level ground truth once the stream has
//! been drained.
//!
//! Scores are summed, not averaged: a frame votes in proportion to the
//! magnitude of its scores. Averaging would leave the arg-max unchanged but
//! alter the loss, so the sum is what the loss is computed on. The resulting
//! loss grows with the number of clips per video.

use std::collections::{BTreeMap, HashMap};

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::training::metrics::accuracy_from_rows;

/// Separator between the video id and the frame info of a composite key
pub const KEY_DELIMITER: char = '|';

/// Identifier of a video, shared by all of its frames
pub type VideoKey = String;

/// Extract the video key from a `"<video_id>|<frame_info>"` composite key
///
/// Only the first delimiter splits; a key without one, or with an empty video
/// id, is rejected.
pub fn derive_video_key(composite_key: &str) -> Result<VideoKey> {
    match composite_key.split_once(KEY_DELIMITER) {
        Some((video, _)) if !video.is_empty() => Ok(video.to_string()),
        _ => Err(Error::MalformedKey {
            key: composite_key.to_string(),
            delimiter: KEY_DELIMITER,
        }),
    }
}

/// Video id to label lookup for the validation set
///
/// Labels are kept as the string-encoded integers supplied with the split
/// metadata and adjusted for the dataset's indexing convention on lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundTruthIndex {
    labels: HashMap<VideoKey, String>,
}

impl GroundTruthIndex {
    pub fn new(labels: HashMap<VideoKey, String>) -> Self {
        Self { labels }
    }

    pub fn insert(&mut self, video: impl Into<VideoKey>, label: impl Into<String>) {
        self.labels.insert(video.into(), label.into());
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn contains(&self, video: &str) -> bool {
        self.labels.contains_key(video)
    }

    /// Zero-based class index of `video`
    ///
    /// One is subtracted from the stored label unless the labels are already
    /// zero-indexed.
    pub fn resolve(&self, video: &str, zero_indexed: bool, num_classes: usize) -> Result<usize> {
        let raw = self.labels.get(video).ok_or_else(|| Error::MissingGroundTruth {
            video: video.to_string(),
        })?;
        let parsed: i64 = raw.trim().parse().map_err(|_| {
            Error::config(format!("label '{}' of video '{}' is not an integer", raw, video))
        })?;

        let label = if zero_indexed { parsed } else { parsed - 1 };
        if label < 0 || label as usize >= num_classes {
            return Err(Error::config(format!(
                "label {} of video '{}' is outside 0..{} after {} indexing adjustment",
                label,
                video,
                num_classes,
                if zero_indexed { "zero-based" } else { "one-based" }
            )));
        }
        Ok(label as usize)
    }
}

impl FromIterator<(VideoKey, String)> for GroundTruthIndex {
    fn from_iter<I: IntoIterator<Item = (VideoKey, String)>>(iter: I) -> Self {
        Self {
            labels: iter.into_iter().collect(),
        }
    }
}

/// Video-level scores of one validation pass
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoLevelMetrics {
    /// Top-1 accuracy in percent
    pub top1: f64,
    /// Top-5 accuracy in percent
    pub top5: f64,
    /// Mean cross-entropy over the summed per-video scores
    pub loss: f64,
    /// Number of videos scored
    pub num_videos: usize,
}

/// Accumulates per-frame class scores into per-video sums
#[derive(Debug, Clone)]
pub struct VideoPredictionAggregator {
    num_classes: usize,
    predictions: BTreeMap<VideoKey, Vec<f64>>,
}

impl VideoPredictionAggregator {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            predictions: BTreeMap::new(),
        }
    }

    /// Forget every accumulated video
    pub fn reset(&mut self) {
        self.predictions.clear();
    }

    /// Add one frame's score vector to its video
    pub fn add_frame(&mut self, video: &str, scores: &[f64]) -> Result<()> {
        if scores.len() != self.num_classes {
            return Err(Error::shape_mismatch(format!(
                "frame of video '{}' has {} scores, expected {}",
                video,
                scores.len(),
                self.num_classes
            )));
        }

        match self.predictions.get_mut(video) {
            Some(sum) => {
                for (acc, score) in sum.iter_mut().zip(scores) {
                    *acc += score;
                }
            }
            None => {
                self.predictions.insert(video.to_string(), scores.to_vec());
            }
        }
        Ok(())
    }

    /// Add every row of a `[N, C]` score tensor, keyed by composite frame keys
    pub fn add_batch(&mut self, composite_keys: &[String], scores: &Tensor) -> Result<()> {
        let rows = scores
            .detach()
            .to_dtype(candle_core::DType::F64)?
            .to_vec2::<f64>()?;
        if rows.len() != composite_keys.len() {
            return Err(Error::shape_mismatch(format!(
                "{} score rows for {} frame keys",
                rows.len(),
                composite_keys.len()
            )));
        }
        for (key, row) in composite_keys.iter().zip(&rows) {
            let video = derive_video_key(key)?;
            self.add_frame(&video, row)?;
        }
        Ok(())
    }

    /// Accumulated score sums, ordered by video key
    pub fn predictions(&self) -> &BTreeMap<VideoKey, Vec<f64>> {
        &self.predictions
    }

    pub fn num_videos(&self) -> usize {
        self.predictions.len()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Score the accumulated videos against `ground_truth`
    ///
    /// Videos are visited in lexicographic key order so the stacked
    /// prediction matrix, and therefore the loss, is reproducible. A video
    /// whose sums are not finite is rejected before any scoring. Does not
    /// modify the accumulator.
    pub fn finalize(
        &self,
        ground_truth: &GroundTruthIndex,
        zero_indexed: bool,
        num_classes: usize,
    ) -> Result<VideoLevelMetrics> {
        if num_classes != self.num_classes {
            return Err(Error::shape_mismatch(format!(
                "finalize asked for {} classes, aggregator holds {}",
                num_classes, self.num_classes
            )));
        }
        if self.predictions.is_empty() {
            return Err(Error::config(
                "no video predictions accumulated; the validation stream was empty",
            ));
        }

        let mut rows = Vec::with_capacity(self.predictions.len());
        let mut labels = Vec::with_capacity(self.predictions.len());
        for (video, scores) in &self.predictions {
            if scores.iter().any(|score| !score.is_finite()) {
                return Err(Error::NonFiniteScores {
                    video: video.clone(),
                });
            }
            labels.push(ground_truth.resolve(video, zero_indexed, num_classes)?);
            rows.push(scores.clone());
        }

        let accuracies = accuracy_from_rows(&rows, &labels, &[1, 5])?;
        let loss = video_cross_entropy(&rows, &labels, num_classes)?;

        Ok(VideoLevelMetrics {
            top1: accuracies[0],
            top5: accuracies[1],
            loss,
            num_videos: rows.len(),
        })
    }
}

/// Mean cross-entropy of stacked score rows, computed with candle's loss
fn video_cross_entropy(rows: &[Vec<f64>], labels: &[usize], num_classes: usize) -> Result<f64> {
    let device = Device::Cpu;
    let flat: Vec<f32> = rows.iter().flatten().map(|&v| v as f32).collect();
    let preds = Tensor::from_vec(flat, (rows.len(), num_classes), &device)?;
    let targets = Tensor::from_vec(
        labels.iter().map(|&l| l as u32).collect::<Vec<u32>>(),
        labels.len(),
        &device,
    )?;
    let loss = candle_nn::loss::cross_entropy(&preds, &targets)?;
    Ok(loss.to_scalar::<f32>()? as f64)
}
