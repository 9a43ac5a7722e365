//! One training pass over the frame stream

use std::time::Instant;

use candle_core::DType;
use tracing::{debug, info, instrument};

use super::check_logits;
use crate::error::{Error, Result};
use crate::model::FrameClassifier;
use crate::training::data::{BatchSource, FrameBatch};
use crate::training::metrics::{accuracy, AverageMeter, Phase, PhaseMetrics, TrainingLog};
use crate::training::optimizers::OptimizerState;

/// Runs the parameter-updating sweep of an epoch
#[derive(Debug, Clone)]
pub struct EpochTrainer {
    log_steps: usize,
}

impl EpochTrainer {
    /// `log_steps` is the interval, in batches, of per-batch debug logging
    pub fn new(log_steps: usize) -> Self {
        Self {
            log_steps: log_steps.max(1),
        }
    }

    /// Train `model` for one pass over `source`
    ///
    /// Every batch is classified in training mode, scored with cross-entropy
    /// and followed by one optimizer update. The epoch summary is appended to
    /// `log`. The first error aborts the pass.
    #[instrument(skip_all, fields(epoch = epoch))]
    pub async fn train_epoch(
        &self,
        epoch: usize,
        model: &dyn FrameClassifier,
        optimizer: &mut OptimizerState,
        source: &mut dyn BatchSource<Batch = FrameBatch>,
        log: &TrainingLog,
    ) -> Result<PhaseMetrics> {
        let num_classes = model.num_classes();
        let learning_rate = optimizer.learning_rate();
        info!(
            epoch,
            lr = learning_rate,
            batches = ?source.num_batches(),
            "Training epoch"
        );

        let mut batch_time = AverageMeter::new();
        let mut data_time = AverageMeter::new();
        let mut losses = AverageMeter::new();
        let mut top1 = AverageMeter::new();
        let mut top5 = AverageMeter::new();

        source.begin_epoch(epoch).await?;
        let mut batch_idx = 0;
        let mut fetch_start = Instant::now();

        while let Some(batch) = source.next_batch().await? {
            data_time.update(fetch_start.elapsed().as_secs_f64());
            let step_start = Instant::now();
            let n = batch.len() as f64;

            let logits = model.forward_t(&batch.inputs, true)?;
            check_logits(&logits, &batch.labels, num_classes)?;

            let loss = candle_nn::loss::cross_entropy(&logits, &batch.labels)?;
            let loss_value = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
            if !loss_value.is_finite() {
                return Err(Error::NonFiniteLoss {
                    value: loss_value,
                    epoch,
                    batch: batch_idx,
                });
            }

            let acc = accuracy(&logits, &batch.labels, &[1, 5])?;
            losses.update_weighted(loss_value, n);
            top1.update_weighted(acc[0], n);
            top5.update_weighted(acc[1], n);

            optimizer.backward_step(&loss)?;

            batch_time.update(step_start.elapsed().as_secs_f64() + data_time.val());
            if batch_idx % self.log_steps == 0 {
                debug!(
                    epoch,
                    batch = batch_idx,
                    loss = loss_value,
                    top1 = acc[0],
                    avg_loss = losses.avg(),
                    "Training batch"
                );
            }

            batch_idx += 1;
            fetch_start = Instant::now();
        }

        if batch_idx == 0 {
            return Err(Error::data(format!(
                "training stream produced no batches in epoch {}",
                epoch
            )));
        }

        let metrics = PhaseMetrics {
            epoch,
            phase: Phase::Train,
            loss: losses.avg(),
            top1: top1.avg(),
            top5: top5.avg(),
            batch_time: batch_time.avg(),
            data_time: Some(data_time.avg()),
            learning_rate: Some(learning_rate),
            samples: losses.count() as usize,
        };
        log.record(&metrics)?;

        info!(
            epoch,
            loss = metrics.loss,
            top1 = metrics.top1,
            top5 = metrics.top5,
            batches = batch_idx,
            "Training epoch finished"
        );
        Ok(metrics)
    }
}
