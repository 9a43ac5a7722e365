//! Batch-level metric collectors
//!
//! [`AverageMeter`] keeps a running weighted mean of a scalar; [`accuracy`]
//! scores a batch of class scores against integer labels.

use candle_core::{DType, Tensor};

use crate::error::{Error, Result};

/// Running mean and count of a scalar metric
///
/// Holds only scalars, so no per-batch tensor outlives its iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AverageMeter {
    val: f64,
    sum: f64,
    count: f64,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one observation
    pub fn update(&mut self, value: f64) {
        self.update_weighted(value, 1.0);
    }

    /// Fold in an observation that stands for `weight` samples
    pub fn update_weighted(&mut self, value: f64, weight: f64) {
        self.val = value;
        self.sum += value * weight;
        self.count += weight;
    }

    /// Weighted mean; NaN before the first update
    pub fn avg(&self) -> f64 {
        if self.count == 0.0 {
            f64::NAN
        } else {
            self.sum / self.count
        }
    }

    /// Last observed value
    pub fn val(&self) -> f64 {
        self.val
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn count(&self) -> f64 {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Position of `label` when `scores` are sorted in descending order
///
/// Ties keep index order, so an equal score at a smaller index ranks first.
pub fn label_rank(scores: &[f64], label: usize) -> usize {
    let target = scores[label];
    scores
        .iter()
        .enumerate()
        .filter(|(idx, &score)| score > target || (score == target && *idx < label))
        .count()
}

/// Top-k accuracy, in percent, for rows of class scores
///
/// `k` is capped at the number of classes.
pub fn accuracy_from_rows(rows: &[Vec<f64>], labels: &[usize], topk: &[usize]) -> Result<Vec<f64>> {
    if rows.len() != labels.len() {
        return Err(Error::shape_mismatch(format!(
            "{} score rows but {} labels",
            rows.len(),
            labels.len()
        )));
    }
    if rows.is_empty() {
        return Ok(vec![0.0; topk.len()]);
    }

    let mut correct = vec![0usize; topk.len()];
    for (row, &label) in rows.iter().zip(labels) {
        if label >= row.len() {
            return Err(Error::shape_mismatch(format!(
                "label {} out of range for {} classes",
                label,
                row.len()
            )));
        }
        let rank = label_rank(row, label);
        for (hits, &k) in correct.iter_mut().zip(topk) {
            if rank < k.min(row.len()) {
                *hits += 1;
            }
        }
    }

    let total = rows.len() as f64;
    Ok(correct.into_iter().map(|hits| hits as f64 * 100.0 / total).collect())
}

/// Top-k accuracy, in percent, for `[N, C]` logits and `[N]` labels
pub fn accuracy(logits: &Tensor, labels: &Tensor, topk: &[usize]) -> Result<Vec<f64>> {
    let rows = logits
        .detach()
        .to_dtype(DType::F64)?
        .to_vec2::<f64>()?;
    let labels: Vec<usize> = labels
        .to_dtype(DType::U32)?
        .to_vec1::<u32>()?
        .into_iter()
        .map(|label| label as usize)
        .collect();
    accuracy_from_rows(&rows, &labels, topk)
}
