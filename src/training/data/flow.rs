//! Optical-flow clip source
//!
//! Flow images live under `<flow_dir>/u/v_<Video>/frame000001.jpg` and the
//! matching `v/` directory. A clip is `stack_len` consecutive frames; each
//! frame contributes its horizontal and vertical component as two adjacent
//! channels, so a clip has `2 * stack_len` channels.
//!
//! Decoding runs on a dedicated rayon pool inside `spawn_blocking`; decoded
//! batches reach the consumer through a bounded channel so at most
//! `prefetch_batches` batches are held ahead of it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use super::{BatchSource, FrameBatch, KeyedFrameBatch, VideoEntry};
use crate::config::DataConfig;
use crate::error::{Error, Result};
use crate::training::aggregation::KEY_DELIMITER;

/// On-disk layout of a flow dataset
#[derive(Debug, Clone)]
pub struct FlowLayout {
    pub flow_dir: PathBuf,
    pub stack_len: usize,
    pub image_size: usize,
}

impl FlowLayout {
    pub fn from_config(config: &DataConfig) -> Self {
        Self {
            flow_dir: config.flow_dir.clone(),
            stack_len: config.stack_len,
            image_size: config.image_size,
        }
    }

    fn video_dir(&self, component: &str, video: &str) -> PathBuf {
        self.flow_dir.join(component).join(format!("v_{}", video))
    }

    /// Path of a 1-based flow frame of one component (`u` or `v`)
    pub fn frame_path(&self, component: &str, video: &str, frame: usize) -> PathBuf {
        self.video_dir(component, video)
            .join(format!("frame{:06}.jpg", frame))
    }

    /// Number of flow frames available for `video`
    pub fn count_frames(&self, video: &str) -> Result<usize> {
        let dir = self.video_dir("u", video);
        let entries = fs::read_dir(&dir)
            .map_err(|e| Error::data(format!("cannot list {}: {}", dir.display(), e)))?;
        let mut count = 0;
        for entry in entries {
            if entry?.path().extension().is_some_and(|ext| ext == "jpg") {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Decode the clip of `video` starting at 1-based frame `start`
    ///
    /// Returns `2 * stack_len * image_size * image_size` values in `[0, 1]`,
    /// channel-major.
    pub fn load_clip(&self, video: &str, start: usize) -> Result<Vec<f32>> {
        let side = self.image_size as u32;
        let plane = self.image_size * self.image_size;
        let mut data = Vec::with_capacity(2 * self.stack_len * plane);

        for offset in 0..self.stack_len {
            for component in ["u", "v"] {
                let path = self.frame_path(component, video, start + offset);
                let image = image::open(&path)
                    .map_err(|e| Error::data(format!("cannot decode {}: {}", path.display(), e)))?
                    .to_luma8();
                let image = if image.dimensions() == (side, side) {
                    image
                } else {
                    image::imageops::resize(&image, side, side, FilterType::Triangle)
                };
                data.extend(image.into_raw().into_iter().map(|v| v as f32 / 255.0));
            }
        }
        Ok(data)
    }
}

/// How clips are drawn from each video
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipSampling {
    /// One clip per video at a random start frame, videos shuffled
    RandomPerVideo,
    /// `clips` evenly spaced clips per video, in list order
    EvenlySpaced { clips: usize },
}

#[derive(Debug, Clone)]
struct VideoClips {
    video: String,
    label: u32,
    num_frames: usize,
}

#[derive(Debug, Clone)]
struct ClipRequest {
    key: String,
    video: String,
    start: usize,
    label: u32,
}

/// Batch source decoding flow clips from disk
pub struct FlowClipSource {
    layout: Arc<FlowLayout>,
    videos: Arc<Vec<VideoClips>>,
    sampling: ClipSampling,
    batch_size: usize,
    prefetch_batches: usize,
    seed: u64,
    device: Device,
    pool: Arc<rayon::ThreadPool>,
    receiver: Option<mpsc::Receiver<Result<KeyedFrameBatch>>>,
    producer: Option<JoinHandle<()>>,
}

impl FlowClipSource {
    /// Index the videos of `entries`, counting their flow frames
    ///
    /// Labels are converted to zero-based class indices; a label outside
    /// `0..num_classes` is a configuration error.
    pub fn new(
        config: &DataConfig,
        entries: &[VideoEntry],
        sampling: ClipSampling,
        seed: u64,
        num_workers: usize,
        device: Device,
    ) -> Result<Self> {
        let layout = FlowLayout::from_config(config);
        let zero_indexed = config.dataset.zero_indexed();
        let num_classes = config.dataset.num_classes() as i64;

        let mut videos = Vec::with_capacity(entries.len());
        for entry in entries {
            let label = entry.label(zero_indexed);
            if !(0..num_classes).contains(&label) {
                return Err(Error::config(format!(
                    "video '{}' has label {} outside 0..{}",
                    entry.video, label, num_classes
                )));
            }
            let num_frames = layout.count_frames(&entry.video)?;
            if num_frames < layout.stack_len {
                return Err(Error::data(format!(
                    "video '{}' has {} flow frames, fewer than the stack length {}",
                    entry.video, num_frames, layout.stack_len
                )));
            }
            videos.push(VideoClips {
                video: entry.video.clone(),
                label: label as u32,
                num_frames,
            });
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers.max(1))
            .thread_name(|idx| format!("flow-decoder-{}", idx))
            .build()
            .map_err(|e| Error::internal(format!("cannot start decoder pool: {}", e)))?;

        info!(
            videos = videos.len(),
            ?sampling,
            batch_size = config.batch_size,
            workers = num_workers.max(1),
            "Indexed flow videos"
        );

        Ok(Self {
            layout: Arc::new(layout),
            videos: Arc::new(videos),
            sampling,
            batch_size: config.batch_size,
            prefetch_batches: config.prefetch_batches,
            seed,
            device,
            pool: Arc::new(pool),
            receiver: None,
            producer: None,
        })
    }

    /// Number of clips drawn per pass
    pub fn num_clips(&self) -> usize {
        match self.sampling {
            ClipSampling::RandomPerVideo => self.videos.len(),
            ClipSampling::EvenlySpaced { clips } => self.videos.len() * clips,
        }
    }

    fn plan_epoch(&self, epoch: usize) -> Vec<ClipRequest> {
        let stack_len = self.layout.stack_len;
        match self.sampling {
            ClipSampling::RandomPerVideo => {
                let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
                let mut requests: Vec<ClipRequest> = self
                    .videos
                    .iter()
                    .map(|clips| {
                        let last_start = clips.num_frames - stack_len + 1;
                        ClipRequest {
                            key: format!("{}{}0", clips.video, KEY_DELIMITER),
                            video: clips.video.clone(),
                            start: rng.random_range(1..=last_start),
                            label: clips.label,
                        }
                    })
                    .collect();
                requests.shuffle(&mut rng);
                requests
            }
            ClipSampling::EvenlySpaced { clips } => self
                .videos
                .iter()
                .flat_map(|video| {
                    evenly_spaced_starts(video.num_frames, stack_len, clips)
                        .into_iter()
                        .enumerate()
                        .map(move |(idx, start)| ClipRequest {
                            key: format!("{}{}{}", video.video, KEY_DELIMITER, idx),
                            video: video.video.clone(),
                            start,
                            label: video.label,
                        })
                })
                .collect(),
        }
    }

    fn stop_producer(&mut self) {
        if let Some(handle) = self.producer.take() {
            handle.abort();
        }
        self.receiver = None;
    }
}

/// 1-based start frames of `clips` clips spread over the video
pub fn evenly_spaced_starts(num_frames: usize, stack_len: usize, clips: usize) -> Vec<usize> {
    let last_start = num_frames.saturating_sub(stack_len) + 1;
    if clips <= 1 {
        return vec![1];
    }
    (0..clips)
        .map(|idx| 1 + idx * (last_start - 1) / (clips - 1))
        .collect()
}

fn decode_batch(
    layout: &FlowLayout,
    pool: &rayon::ThreadPool,
    requests: Vec<ClipRequest>,
    device: &Device,
) -> Result<KeyedFrameBatch> {
    let clips: Vec<Vec<f32>> = pool.install(|| {
        requests
            .par_iter()
            .map(|request| layout.load_clip(&request.video, request.start))
            .collect::<Result<Vec<_>>>()
    })?;

    let n = requests.len();
    let channels = 2 * layout.stack_len;
    let data: Vec<f32> = clips.into_iter().flatten().collect();
    let inputs = Tensor::from_vec(
        data,
        (n, channels, layout.image_size, layout.image_size),
        device,
    )?;
    let labels = Tensor::from_vec(
        requests.iter().map(|r| r.label).collect::<Vec<u32>>(),
        n,
        device,
    )?;
    let keys = requests.into_iter().map(|r| r.key).collect();
    KeyedFrameBatch::new(keys, inputs, labels)
}

#[async_trait]
impl BatchSource for FlowClipSource {
    type Batch = KeyedFrameBatch;

    #[instrument(skip(self))]
    async fn begin_epoch(&mut self, epoch: usize) -> Result<()> {
        self.stop_producer();

        let plan = self.plan_epoch(epoch);
        let batches: Vec<Vec<ClipRequest>> = plan
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        debug!(epoch, clips = plan.len(), batches = batches.len(), "Planned flow pass");

        let (sender, receiver) = mpsc::channel(self.prefetch_batches.max(1));
        let layout = self.layout.clone();
        let pool = self.pool.clone();
        let device = self.device.clone();

        let producer = tokio::spawn(async move {
            for (batch_idx, requests) in batches.into_iter().enumerate() {
                let decoded = tokio::task::spawn_blocking({
                    let layout = layout.clone();
                    let pool = pool.clone();
                    let device = device.clone();
                    move || decode_batch(&layout, &pool, requests, &device)
                })
                .await;

                let item = match decoded {
                    Ok(result) => result,
                    Err(e) => Err(Error::internal(format!("decoder task failed: {}", e))),
                };
                let failed = item.is_err();
                if let Err(e) = &item {
                    error!(batch = batch_idx, error = %e, "Failed to decode flow batch");
                }
                if sender.send(item).await.is_err() || failed {
                    break;
                }
            }
        });

        self.receiver = Some(receiver);
        self.producer = Some(producer);
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Option<KeyedFrameBatch>> {
        let receiver = self
            .receiver
            .as_mut()
            .ok_or_else(|| Error::data("next_batch called before begin_epoch"))?;
        match receiver.recv().await {
            Some(item) => item.map(Some),
            None => Ok(None),
        }
    }

    fn num_batches(&self) -> Option<usize> {
        Some(self.num_clips().div_ceil(self.batch_size))
    }
}

impl Drop for FlowClipSource {
    fn drop(&mut self) {
        self.stop_producer();
    }
}

/// Training view of a [`FlowClipSource`] that drops the frame keys
pub struct TrainingFlowSource {
    inner: FlowClipSource,
}

impl TrainingFlowSource {
    pub fn new(inner: FlowClipSource) -> Self {
        Self { inner }
    }

    pub fn flow_dir(&self) -> &Path {
        &self.inner.layout.flow_dir
    }
}

#[async_trait]
impl BatchSource for TrainingFlowSource {
    type Batch = FrameBatch;

    async fn begin_epoch(&mut self, epoch: usize) -> Result<()> {
        self.inner.begin_epoch(epoch).await
    }

    async fn next_batch(&mut self) -> Result<Option<FrameBatch>> {
        Ok(self
            .inner
            .next_batch()
            .await?
            .map(KeyedFrameBatch::into_frame_batch))
    }

    fn num_batches(&self) -> Option<usize> {
        self.inner.num_batches()
    }
}
