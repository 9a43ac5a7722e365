//! Tests for the per-epoch sweeps

use approx::assert_relative_eq;
use candle_core::{Device, Tensor};

use super::*;
use crate::error::Error;
use crate::training::checkpoints::ParameterSnapshot;
use crate::training::config::OptimizerConfig;
use crate::training::data::{FrameBatch, InMemoryBatches, KeyedFrameBatch};
use crate::training::metrics::{Phase, TrainingLog};
use crate::training::optimizers::create_optimizer;
use crate::training::tests::fixtures::{
    flow_batch, pass_through, scored_batch, temp_output_dir, tiny_motion_net,
    two_video_ground_truth, two_video_pass, NUM_CLASSES,
};

fn sgd(var_map: &candle_nn::VarMap) -> crate::training::optimizers::OptimizerState {
    let config = OptimizerConfig {
        learning_rate: 0.05,
        momentum: 0.9,
        weight_decay: 0.0,
    };
    create_optimizer(&config, var_map, &Device::Cpu).unwrap()
}

#[tokio::test]
async fn test_train_epoch_updates_parameters_and_logs() {
    let dir = temp_output_dir();
    let log = TrainingLog::new(dir.path(), "No");
    let (var_map, model) = tiny_motion_net();
    let mut optimizer = sgd(&var_map);
    let mut source = InMemoryBatches::new(vec![flow_batch(&[0, 1, 2]), flow_batch(&[2, 1])]);

    let before = ParameterSnapshot::capture(&var_map).unwrap();
    let metrics = EpochTrainer::new(1)
        .train_epoch(3, &model, &mut optimizer, &mut source, &log)
        .await
        .unwrap();
    let after = ParameterSnapshot::capture(&var_map).unwrap();

    assert_eq!(metrics.epoch, 3);
    assert_eq!(metrics.phase, Phase::Train);
    assert_eq!(metrics.samples, 5);
    assert!(metrics.loss.is_finite() && metrics.loss > 0.0);
    assert!((0.0..=100.0).contains(&metrics.top1));
    assert!(metrics.top5 >= metrics.top1);
    assert_eq!(metrics.learning_rate, Some(0.05));
    assert_eq!(optimizer.step_count(), 2);
    assert_eq!(source.epochs_started(), &[3]);

    let fc_before = &before.tensors["fc.weight"].data;
    let fc_after = &after.tensors["fc.weight"].data;
    assert!(fc_before.iter().zip(fc_after).any(|(a, b)| a != b));

    let contents = std::fs::read_to_string(log.path(Phase::Train)).unwrap();
    assert_eq!(contents.lines().count(), 2);
}

#[tokio::test]
async fn test_train_epoch_rejects_empty_stream() {
    let dir = temp_output_dir();
    let log = TrainingLog::new(dir.path(), "No");
    let (var_map, model) = pass_through();
    let mut optimizer = sgd(&var_map);
    let mut source = InMemoryBatches::<FrameBatch>::new(Vec::new());

    let err = EpochTrainer::new(10)
        .train_epoch(0, &model, &mut optimizer, &mut source, &log)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Data(_)));
    assert!(!log.path(Phase::Train).exists());
}

#[tokio::test]
async fn test_train_epoch_stops_on_non_finite_loss() {
    let dir = temp_output_dir();
    let log = TrainingLog::new(dir.path(), "No");
    let (var_map, model) = pass_through();
    let mut optimizer = sgd(&var_map);

    let good = scored_batch(&[("v_a", 0, [1.0, 0.0, 0.0])]).into_frame_batch();
    let inputs = Tensor::new(&[[f32::NAN, 0.0, 0.0]], &Device::Cpu).unwrap();
    let labels = Tensor::new(&[0u32], &Device::Cpu).unwrap();
    let bad = FrameBatch::new(inputs, labels).unwrap();
    let mut source = InMemoryBatches::new(vec![good, bad]);

    let err = EpochTrainer::new(1)
        .train_epoch(4, &model, &mut optimizer, &mut source, &log)
        .await
        .unwrap_err();
    match err {
        Error::NonFiniteLoss { epoch, batch, value } => {
            assert_eq!(epoch, 4);
            assert_eq!(batch, 1);
            assert!(value.is_nan());
        }
        other => panic!("unexpected error: {other}"),
    }
    // the first batch was applied, the poisoned one was not
    assert_eq!(optimizer.step_count(), 1);
}

#[tokio::test]
async fn test_train_epoch_rejects_out_of_range_labels() {
    let dir = temp_output_dir();
    let log = TrainingLog::new(dir.path(), "No");
    let (var_map, model) = pass_through();
    let mut optimizer = sgd(&var_map);
    let inputs = Tensor::zeros((1, NUM_CLASSES), candle_core::DType::F32, &Device::Cpu).unwrap();
    let labels = Tensor::new(&[NUM_CLASSES as u32], &Device::Cpu).unwrap();
    let mut source = InMemoryBatches::new(vec![FrameBatch::new(inputs, labels).unwrap()]);

    let err = EpochTrainer::new(1)
        .train_epoch(0, &model, &mut optimizer, &mut source, &log)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch(_)));
    assert_eq!(optimizer.step_count(), 0);
}

#[tokio::test]
async fn test_validate_epoch_scores_per_video() {
    let dir = temp_output_dir();
    let log = TrainingLog::new(dir.path(), "No");
    let (_, model) = pass_through();
    let mut validator = EpochValidator::new(NUM_CLASSES, two_video_ground_truth(), false, 1);
    let mut source = InMemoryBatches::new(two_video_pass(false));

    let outcome = validator
        .validate_epoch(2, &model, &mut source, &log)
        .await
        .unwrap();

    assert_eq!(outcome.video.num_videos, 2);
    assert_relative_eq!(outcome.top1(), 50.0);
    assert_relative_eq!(outcome.video.top5, 100.0);
    assert!(outcome.loss() > 0.0);
    assert_eq!(outcome.metrics.phase, Phase::Test);
    assert_eq!(outcome.metrics.samples, 2);
    assert_eq!(outcome.metrics.data_time, None);

    let predictions = validator.predictions();
    assert_eq!(predictions.keys().collect::<Vec<_>>(), vec!["v_a", "v_b"]);
    assert_relative_eq!(predictions["v_a"][0], 12.0);
    assert_relative_eq!(predictions["v_b"][2], 12.0);
}

#[tokio::test]
async fn test_validate_epoch_resets_between_passes() {
    let dir = temp_output_dir();
    let log = TrainingLog::new(dir.path(), "No");
    let (_, model) = pass_through();
    let mut validator = EpochValidator::new(NUM_CLASSES, two_video_ground_truth(), false, 1);
    let mut source = InMemoryBatches::new(two_video_pass(true));

    let first = validator.validate_epoch(0, &model, &mut source, &log).await.unwrap();
    let second = validator.validate_epoch(1, &model, &mut source, &log).await.unwrap();

    assert_eq!(first.video, second.video);
    assert_relative_eq!(second.top1(), 100.0);
    assert_relative_eq!(validator.predictions()["v_a"][0], 12.0);

    let contents = std::fs::read_to_string(log.path(Phase::Test)).unwrap();
    assert_eq!(contents.lines().count(), 3);
}

#[tokio::test]
async fn test_validate_epoch_missing_ground_truth() {
    let dir = temp_output_dir();
    let log = TrainingLog::new(dir.path(), "No");
    let (_, model) = pass_through();
    let mut validator = EpochValidator::new(NUM_CLASSES, two_video_ground_truth(), false, 1);
    let mut source = InMemoryBatches::new(vec![scored_batch(&[("v_unknown", 0, [1.0, 0.0, 0.0])])]);

    let err = validator
        .validate_epoch(0, &model, &mut source, &log)
        .await
        .unwrap_err();
    match err {
        Error::MissingGroundTruth { video } => assert_eq!(video, "v_unknown"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!log.path(Phase::Test).exists());
}

#[tokio::test]
async fn test_validate_epoch_malformed_key() {
    let dir = temp_output_dir();
    let log = TrainingLog::new(dir.path(), "No");
    let (_, model) = pass_through();
    let mut validator = EpochValidator::new(NUM_CLASSES, two_video_ground_truth(), false, 1);

    let inputs = Tensor::zeros((1, NUM_CLASSES), candle_core::DType::F32, &Device::Cpu).unwrap();
    let labels = Tensor::new(&[0u32], &Device::Cpu).unwrap();
    let batch = KeyedFrameBatch::new(vec!["v_a-no-delimiter".to_string()], inputs, labels).unwrap();
    let mut source = InMemoryBatches::new(vec![batch]);

    let err = validator
        .validate_epoch(0, &model, &mut source, &log)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MalformedKey { .. }));
}

#[tokio::test]
async fn test_validate_epoch_empty_stream() {
    let dir = temp_output_dir();
    let log = TrainingLog::new(dir.path(), "No");
    let (_, model) = pass_through();
    let mut validator = EpochValidator::new(NUM_CLASSES, two_video_ground_truth(), false, 1);
    let mut source = InMemoryBatches::<KeyedFrameBatch>::new(Vec::new());

    let err = validator
        .validate_epoch(0, &model, &mut source, &log)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_check_logits_shapes() {
    let logits = Tensor::zeros((2, NUM_CLASSES), candle_core::DType::F32, &Device::Cpu).unwrap();
    let labels = Tensor::new(&[0u32, 2], &Device::Cpu).unwrap();
    assert!(check_logits(&logits, &labels, NUM_CLASSES).is_ok());

    let short = Tensor::new(&[0u32], &Device::Cpu).unwrap();
    assert!(matches!(
        check_logits(&logits, &short, NUM_CLASSES),
        Err(Error::ShapeMismatch(_))
    ));
    assert!(matches!(
        check_logits(&logits, &labels, NUM_CLASSES + 1),
        Err(Error::ShapeMismatch(_))
    ));
}
