//! Secondary effect worker.
//!
//! Heavier per-clip effects run here instead of on the realtime path. The
//! worker is one task fed by a bounded channel; pixel work runs on the
//! blocking pool and each job answers through its own oneshot channel.

use std::sync::Arc;

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use cutline_common::error::{CutlineError, CutlineResult};

use crate::decoder::DecoderFactory;

const EFFECT_QUEUE_DEPTH: usize = 16;

/// Pixel rectangle to keep when cropping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A unit of effect work.
#[derive(Debug, Clone)]
pub enum EffectJob {
    /// Gaussian blur with the given sigma in pixels.
    Blur { image: Arc<RgbaImage>, radius: f32 },
    Crop { image: Arc<RgbaImage>, rect: CropRect },
    /// Decode a single frame from a URL without touching the frame cache.
    ExtractFrame { url: String, time: f64 },
}

impl EffectJob {
    fn kind(&self) -> &'static str {
        match self {
            EffectJob::Blur { .. } => "blur",
            EffectJob::Crop { .. } => "crop",
            EffectJob::ExtractFrame { .. } => "extract_frame",
        }
    }
}

struct EffectMessage {
    job: EffectJob,
    reply: oneshot::Sender<CutlineResult<RgbaImage>>,
}

/// Handle to the running effect task.
pub struct EffectWorker {
    jobs: mpsc::Sender<EffectMessage>,
    task: JoinHandle<()>,
}

impl EffectWorker {
    pub fn spawn(factory: Arc<dyn DecoderFactory>) -> Self {
        let (jobs, rx) = mpsc::channel(EFFECT_QUEUE_DEPTH);
        let task = tokio::spawn(run_effects(factory, rx));
        info!("Effect worker started");
        Self { jobs, task }
    }

    /// Queue `job` and wait for its result.
    pub async fn run(&self, job: EffectJob) -> CutlineResult<RgbaImage> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(EffectMessage { job, reply })
            .await
            .map_err(|_| CutlineError::render("Effect worker stopped"))?;
        rx.await
            .map_err(|_| CutlineError::render("Effect worker dropped the job"))?
    }

    pub async fn blur(&self, image: Arc<RgbaImage>, radius: f32) -> CutlineResult<RgbaImage> {
        self.run(EffectJob::Blur { image, radius }).await
    }

    pub async fn crop(&self, image: Arc<RgbaImage>, rect: CropRect) -> CutlineResult<RgbaImage> {
        self.run(EffectJob::Crop { image, rect }).await
    }

    pub async fn extract_frame(&self, url: impl Into<String>, time: f64) -> CutlineResult<RgbaImage> {
        self.run(EffectJob::ExtractFrame {
            url: url.into(),
            time,
        })
        .await
    }

    pub fn shutdown(&self) {
        self.task.abort();
        debug!("Effect worker shut down");
    }
}

impl Drop for EffectWorker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_effects(factory: Arc<dyn DecoderFactory>, mut rx: mpsc::Receiver<EffectMessage>) {
    while let Some(EffectMessage { job, reply }) = rx.recv().await {
        let kind = job.kind();
        let result = process(&factory, job).await;
        if let Err(e) = &result {
            debug!(kind, error = %e, "Effect job failed");
        }
        let _ = reply.send(result);
    }
}

async fn process(factory: &Arc<dyn DecoderFactory>, job: EffectJob) -> CutlineResult<RgbaImage> {
    match job {
        EffectJob::Blur { image, radius } => {
            if !(radius.is_finite() && radius >= 0.0) {
                return Err(CutlineError::render(format!("Invalid blur radius {radius}")));
            }
            if radius == 0.0 {
                return Ok((*image).clone());
            }
            tokio::task::spawn_blocking(move || image::imageops::blur(&*image, radius))
                .await
                .map_err(|e| CutlineError::render(format!("Blur task failed: {e}")))
        }
        EffectJob::Crop { image, rect } => {
            let (width, height) = image.dimensions();
            if rect.width == 0
                || rect.height == 0
                || rect.x.saturating_add(rect.width) > width
                || rect.y.saturating_add(rect.height) > height
            {
                return Err(CutlineError::render(format!(
                    "Crop {rect:?} outside {width}x{height} image"
                )));
            }
            tokio::task::spawn_blocking(move || {
                image::imageops::crop_imm(&*image, rect.x, rect.y, rect.width, rect.height).to_image()
            })
            .await
            .map_err(|e| CutlineError::render(format!("Crop task failed: {e}")))
        }
        EffectJob::ExtractFrame { url, time } => {
            let mut decoder = factory.open("effect", &url)?;
            let result: CutlineResult<RgbaImage> = async {
                decoder.probe().await?;
                decoder.decode_frame_at(time).await
            }
            .await;
            decoder.close().await;
            result
        }
    }
}
