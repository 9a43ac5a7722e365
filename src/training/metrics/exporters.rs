//! Append-only CSV training logs, one file per phase

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{Phase, PhaseMetrics};
use crate::error::Result;

/// One row of the training-phase log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainRecord {
    #[serde(rename = "Epoch")]
    pub epoch: usize,
    #[serde(rename = "Batch Time")]
    pub batch_time: f64,
    #[serde(rename = "Data Time")]
    pub data_time: f64,
    #[serde(rename = "Loss")]
    pub loss: f64,
    #[serde(rename = "Prec@1")]
    pub prec1: f64,
    #[serde(rename = "Prec@5")]
    pub prec5: f64,
    #[serde(rename = "lr")]
    pub lr: f64,
}

impl From<&PhaseMetrics> for TrainRecord {
    fn from(metrics: &PhaseMetrics) -> Self {
        Self {
            epoch: metrics.epoch,
            batch_time: round_to(metrics.batch_time, 3),
            data_time: round_to(metrics.data_time.unwrap_or(0.0), 3),
            loss: round_to(metrics.loss, 5),
            prec1: round_to(metrics.top1, 4),
            prec5: round_to(metrics.top5, 4),
            lr: metrics.learning_rate.unwrap_or(0.0),
        }
    }
}

/// One row of the validation-phase log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    #[serde(rename = "Epoch")]
    pub epoch: usize,
    #[serde(rename = "Batch Time")]
    pub batch_time: f64,
    #[serde(rename = "Loss")]
    pub loss: f64,
    #[serde(rename = "Prec@1")]
    pub prec1: f64,
    #[serde(rename = "Prec@5")]
    pub prec5: f64,
}

impl From<&PhaseMetrics> for TestRecord {
    fn from(metrics: &PhaseMetrics) -> Self {
        Self {
            epoch: metrics.epoch,
            batch_time: round_to(metrics.batch_time, 3),
            loss: round_to(metrics.loss, 5),
            prec1: round_to(metrics.top1, 3),
            prec5: round_to(metrics.top5, 3),
        }
    }
}

/// Append-only training log for both phases of a run
#[derive(Debug, Clone)]
pub struct TrainingLog {
    train_path: PathBuf,
    test_path: PathBuf,
}

impl TrainingLog {
    /// Log files `opf_train_<model>.csv` and `opf_test_<model>.csv` under `output_dir`
    pub fn new(output_dir: &Path, model_type: &str) -> Self {
        Self {
            train_path: output_dir.join(format!("opf_train_{}.csv", model_type)),
            test_path: output_dir.join(format!("opf_test_{}.csv", model_type)),
        }
    }

    /// Path of the log for `phase`
    pub fn path(&self, phase: Phase) -> &Path {
        match phase {
            Phase::Train => &self.train_path,
            Phase::Test => &self.test_path,
        }
    }

    /// Append the epoch summary of one phase
    pub fn record(&self, metrics: &PhaseMetrics) -> Result<()> {
        match metrics.phase {
            Phase::Train => append_row(&self.train_path, &TrainRecord::from(metrics)),
            Phase::Test => append_row(&self.test_path, &TestRecord::from(metrics)),
        }
    }
}

fn append_row<R: Serialize>(path: &Path, record: &R) -> Result<()> {
    let needs_header = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let file = OpenOptions::new().create(true).append(true).open(path)?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_header)
        .from_writer(file);
    writer.serialize(record)?;
    writer.flush()?;
    Ok(())
}

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;

    fn train_metrics(epoch: usize) -> PhaseMetrics {
        PhaseMetrics {
            epoch,
            phase: Phase::Train,
            loss: 1.234567,
            top1: 42.123456,
            top5: 80.0,
            batch_time: 0.12345,
            data_time: Some(0.0101),
            learning_rate: Some(0.01),
            samples: 16,
        }
    }

    #[test]
    fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let log = TrainingLog::new(dir.path(), "No");

        log.record(&train_metrics(0)).unwrap();
        log.record(&train_metrics(1)).unwrap();

        let contents = std::fs::read_to_string(log.path(Phase::Train)).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Epoch,Batch Time,Data Time,Loss,Prec@1,Prec@5,lr");
        assert!(lines[1].starts_with("0,0.123,0.01,1.23457,42.1235,80"));
        assert!(lines[2].starts_with("1,"));
    }

    #[test]
    fn test_test_phase_goes_to_its_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = TrainingLog::new(dir.path(), "ImageNet");
        let metrics = PhaseMetrics {
            phase: Phase::Test,
            data_time: None,
            learning_rate: None,
            ..train_metrics(3)
        };

        log.record(&metrics).unwrap();

        assert!(!log.path(Phase::Train).exists());
        let mut reader = csv::Reader::from_path(log.path(Phase::Test)).unwrap();
        let rows: Vec<TestRecord> = reader.deserialize().collect::<std::result::Result<_, _>>().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].epoch, 3);
        assert_eq!(rows[0].prec1, 42.123);
        assert!(log.path(Phase::Test).ends_with("opf_test_ImageNet.csv"));
    }
}
