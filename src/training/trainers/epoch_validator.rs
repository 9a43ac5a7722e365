//! One validation pass, scored per video

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{debug, info, instrument};

use super::check_logits;
use crate::error::{Error, Result};
use crate::model::FrameClassifier;
use crate::training::aggregation::{
    GroundTruthIndex, VideoKey, VideoLevelMetrics, VideoPredictionAggregator,
};
use crate::training::data::{BatchSource, KeyedFrameBatch};
use crate::training::metrics::{AverageMeter, Phase, PhaseMetrics, TrainingLog};

/// Result of a validation pass
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    /// Row written to the test log
    pub metrics: PhaseMetrics,
    /// Video-level scores
    pub video: VideoLevelMetrics,
}

impl ValidationOutcome {
    /// Video-level top-1 in percent
    pub fn top1(&self) -> f64 {
        self.video.top1
    }

    /// Video-level loss
    pub fn loss(&self) -> f64 {
        self.video.loss
    }
}

/// Runs the forward-only sweep of an epoch
pub struct EpochValidator {
    aggregator: VideoPredictionAggregator,
    ground_truth: GroundTruthIndex,
    zero_indexed: bool,
    log_steps: usize,
}

impl EpochValidator {
    pub fn new(
        num_classes: usize,
        ground_truth: GroundTruthIndex,
        zero_indexed: bool,
        log_steps: usize,
    ) -> Self {
        Self {
            aggregator: VideoPredictionAggregator::new(num_classes),
            ground_truth,
            zero_indexed,
            log_steps: log_steps.max(1),
        }
    }

    /// Score sums of the last pass, for the prediction side file
    pub fn predictions(&self) -> &BTreeMap<VideoKey, Vec<f64>> {
        self.aggregator.predictions()
    }

    pub fn ground_truth(&self) -> &GroundTruthIndex {
        &self.ground_truth
    }

    /// Classify every frame of `source` in evaluation mode and score the
    /// summed per-video predictions
    ///
    /// The accumulator is cleared first, so predictions never leak between
    /// passes. The stream is drained completely before finalizing.
    #[instrument(skip_all, fields(epoch = epoch))]
    pub async fn validate_epoch(
        &mut self,
        epoch: usize,
        model: &dyn FrameClassifier,
        source: &mut dyn BatchSource<Batch = KeyedFrameBatch>,
        log: &TrainingLog,
    ) -> Result<ValidationOutcome> {
        let num_classes = self.aggregator.num_classes();
        info!(epoch, batches = ?source.num_batches(), "Validating epoch");

        self.aggregator.reset();
        let mut batch_time = AverageMeter::new();

        source.begin_epoch(epoch).await?;
        let mut batch_idx = 0;
        let mut start = Instant::now();

        while let Some(batch) = source.next_batch().await? {
            let scores = model.forward_t(&batch.inputs, false)?.detach();
            check_logits(&scores, &batch.labels, num_classes)?;
            self.aggregator.add_batch(&batch.keys, &scores)?;

            batch_time.update(start.elapsed().as_secs_f64());
            if batch_idx % self.log_steps == 0 {
                debug!(
                    epoch,
                    batch = batch_idx,
                    videos = self.aggregator.num_videos(),
                    "Validation batch"
                );
            }
            batch_idx += 1;
            start = Instant::now();
        }

        let video = self
            .aggregator
            .finalize(&self.ground_truth, self.zero_indexed, num_classes)?;
        if !video.loss.is_finite() {
            return Err(Error::NonFiniteLoss {
                value: video.loss,
                epoch,
                batch: batch_idx,
            });
        }

        let metrics = PhaseMetrics {
            epoch,
            phase: Phase::Test,
            loss: video.loss,
            top1: video.top1,
            top5: video.top5,
            batch_time: batch_time.avg(),
            data_time: None,
            learning_rate: None,
            samples: video.num_videos,
        };
        log.record(&metrics)?;

        info!(
            epoch,
            videos = video.num_videos,
            top1 = video.top1,
            top5 = video.top5,
            loss = video.loss,
            "Video-level validation"
        );
        Ok(ValidationOutcome { metrics, video })
    }
}
