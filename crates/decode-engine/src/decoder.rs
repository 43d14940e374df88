//! Decoder backends.
//!
//! The worker talks to sources through [`MediaDecoder`]. Backends:
//! - [`crate::ffmpeg::FfmpegDecoder`]: ffprobe/ffmpeg subprocesses
//! - [`SyntheticDecoder`]: deterministic frames for tests and self-checks

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::{Rgba, RgbaImage};

use cutline_common::error::{CutlineError, CutlineResult};
use cutline_project_model::VideoMetadata;

/// A single opened source.
///
/// The worker task holds decoders across awaits, so backends must be
/// `Send + Sync`.
#[async_trait]
pub trait MediaDecoder: Send + Sync {
    /// Read stream metadata. Called once per load.
    async fn probe(&mut self) -> CutlineResult<VideoMetadata>;

    /// Decode the frame presented at `time` (source seconds).
    async fn decode_frame_at(&mut self, time: f64) -> CutlineResult<RgbaImage>;

    /// Write the source's audio to `dest` as WAV.
    ///
    /// Returns `Ok(false)` when the source has no audio.
    async fn extract_audio(&mut self, _dest: &Path) -> CutlineResult<bool> {
        Ok(false)
    }

    /// Release backend resources.
    async fn close(&mut self) {}
}

/// Opens decoders for URLs.
pub trait DecoderFactory: Send + Sync {
    fn open(&self, source_id: &str, url: &str) -> CutlineResult<Box<dyn MediaDecoder>>;
}

/// Parameters of a synthetic source.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    pub metadata: VideoMetadata,

    /// Fail `probe` with this message.
    pub probe_error: Option<String>,

    /// Artificial latency per decoded frame.
    pub frame_delay: Option<Duration>,

    /// Artificial latency for `probe`.
    pub probe_delay: Option<Duration>,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, frame_rate: f64, duration: f64) -> Self {
        Self {
            metadata: VideoMetadata {
                duration,
                width,
                height,
                frame_rate,
                has_video: true,
                has_audio: false,
            },
            probe_error: None,
            frame_delay: None,
            probe_delay: None,
        }
    }

    pub fn with_audio(mut self) -> Self {
        self.metadata.has_audio = true;
        self
    }

    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.probe_error = Some(message.into());
        self
    }

    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = Some(delay);
        self
    }

    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = Some(delay);
        self
    }

    /// Parse `synthetic://WxH@FPS/DURATION`, e.g. `synthetic://640x360@30/5`.
    pub fn parse_url(url: &str) -> Option<Self> {
        let rest = url.strip_prefix("synthetic://")?;
        let (size, rest) = rest.split_once('@')?;
        let (width, height) = size.split_once('x')?;
        let (fps, duration) = rest.split_once('/')?;
        let source = Self::new(
            width.parse().ok()?,
            height.parse().ok()?,
            fps.parse().ok()?,
            duration.parse().ok()?,
        );
        (source.metadata.width > 0 && source.metadata.height > 0 && source.metadata.frame_rate > 0.0)
            .then_some(source)
    }
}

/// Decoder producing a solid color per source frame index.
#[derive(Debug)]
pub struct SyntheticDecoder {
    source: SyntheticSource,
}

impl SyntheticDecoder {
    pub fn new(source: SyntheticSource) -> Self {
        Self { source }
    }

    /// Color of source frame `index`.
    pub fn color_at(index: u64) -> Rgba<u8> {
        Rgba([
            (index % 256) as u8,
            ((index / 256) % 256) as u8,
            (index.wrapping_mul(37) % 256) as u8,
            255,
        ])
    }

    /// Source frame index shown at `time`.
    pub fn frame_index(&self, time: f64) -> u64 {
        let metadata = &self.source.metadata;
        let last = metadata.frame_count().saturating_sub(1);
        ((metadata.clamp_time(time) * metadata.frame_rate).floor().max(0.0) as u64).min(last)
    }
}

#[async_trait]
impl MediaDecoder for SyntheticDecoder {
    async fn probe(&mut self) -> CutlineResult<VideoMetadata> {
        if let Some(delay) = self.source.probe_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.source.probe_error {
            return Err(CutlineError::decode(message.clone()));
        }
        Ok(self.source.metadata.clone())
    }

    async fn decode_frame_at(&mut self, time: f64) -> CutlineResult<RgbaImage> {
        if let Some(delay) = self.source.frame_delay {
            tokio::time::sleep(delay).await;
        }
        let metadata = &self.source.metadata;
        if !metadata.has_video {
            return Err(CutlineError::decode("Source has no video stream"));
        }
        let color = Self::color_at(self.frame_index(time));
        Ok(RgbaImage::from_pixel(metadata.width, metadata.height, color))
    }

    async fn extract_audio(&mut self, dest: &Path) -> CutlineResult<bool> {
        if !self.source.metadata.has_audio {
            return Ok(false);
        }
        let samples = (self.source.metadata.duration * 8_000.0).ceil() as usize;
        tokio::fs::write(dest, silent_wav(8_000, 1, samples)).await?;
        Ok(true)
    }
}

/// 16-bit PCM WAV of silence.
fn silent_wav(sample_rate: u32, channels: u16, frames: usize) -> Vec<u8> {
    let data_len = (frames * channels as usize * 2) as u32;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVEfmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * channels as u32 * 2).to_le_bytes());
    out.extend_from_slice(&(channels * 2).to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.resize(44 + data_len as usize, 0);
    out
}

/// Factory for synthetic sources, registered by URL or parsed from
/// `synthetic://` URLs.
#[derive(Debug, Default)]
pub struct SyntheticDecoderFactory {
    sources: HashMap<String, SyntheticSource>,
    opens: Arc<AtomicUsize>,
}

impl SyntheticDecoderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, url: impl Into<String>, source: SyntheticSource) -> Self {
        self.sources.insert(url.into(), source);
        self
    }

    /// Number of decoders opened so far.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Shared handle to the open counter.
    pub fn open_counter(&self) -> Arc<AtomicUsize> {
        self.opens.clone()
    }
}

impl DecoderFactory for SyntheticDecoderFactory {
    fn open(&self, _source_id: &str, url: &str) -> CutlineResult<Box<dyn MediaDecoder>> {
        let source = self
            .sources
            .get(url)
            .cloned()
            .or_else(|| SyntheticSource::parse_url(url))
            .ok_or_else(|| CutlineError::decode(format!("Unknown synthetic source: {url}")))?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SyntheticDecoder::new(source)))
    }
}
