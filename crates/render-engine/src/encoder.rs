//! Video and audio encoders.
//!
//! The export pipeline talks to encoders through [`VideoEncoder`] and
//! [`AudioEncoder`] and obtains them from an [`EncoderFactory`], which must
//! be asked whether a configuration is supported before creating one.
//! Timestamps are in microseconds.

use async_trait::async_trait;
use image::buffer::ConvertBuffer;
use image::codecs::jpeg::JpegEncoder;
use image::{RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use cutline_common::error::{CutlineError, CutlineResult};

/// Codec string for motion JPEG.
pub const CODEC_MJPEG: &str = "mjpeg";

/// Codec string for 16-bit little-endian PCM.
pub const CODEC_PCM_S16: &str = "pcm-s16";

const DEFAULT_JPEG_QUALITY: u8 = 85;

/// One unit of encoded output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub data: Vec<u8>,
    pub timestamp_us: i64,
    pub duration_us: i64,
    /// Decodable without earlier chunks.
    pub is_key: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoEncoderConfig {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioEncoderConfig {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Encodes rendered frames.
#[async_trait]
pub trait VideoEncoder: Send {
    fn config(&self) -> &VideoEncoderConfig;

    /// Encode one frame. Returns whatever output became available.
    fn encode(
        &mut self,
        frame: &RgbaImage,
        timestamp_us: i64,
        duration_us: i64,
        key_frame: bool,
    ) -> CutlineResult<Vec<EncodedChunk>>;

    /// Drain any buffered output.
    async fn flush(&mut self) -> CutlineResult<Vec<EncodedChunk>>;

    fn close(&mut self) {}
}

/// Encodes interleaved f32 samples.
#[async_trait]
pub trait AudioEncoder: Send {
    fn config(&self) -> &AudioEncoderConfig;

    /// Encode interleaved samples starting at `timestamp_us`.
    fn encode(&mut self, samples: &[f32], timestamp_us: i64) -> CutlineResult<Vec<EncodedChunk>>;

    async fn flush(&mut self) -> CutlineResult<Vec<EncodedChunk>>;

    fn close(&mut self) {}
}

/// Creates encoders and answers capability queries.
#[async_trait]
pub trait EncoderFactory: Send + Sync {
    async fn is_video_supported(&self, config: &VideoEncoderConfig) -> bool;

    async fn is_audio_supported(&self, config: &AudioEncoderConfig) -> bool;

    fn create_video(&self, config: &VideoEncoderConfig) -> CutlineResult<Box<dyn VideoEncoder>>;

    fn create_audio(&self, config: &AudioEncoderConfig) -> CutlineResult<Box<dyn AudioEncoder>>;
}

/// Per-frame JPEG encoder. Every chunk is a key chunk.
#[derive(Debug)]
pub struct MjpegEncoder {
    config: VideoEncoderConfig,
    quality: u8,
    frames: u64,
}

impl MjpegEncoder {
    pub fn new(config: VideoEncoderConfig) -> CutlineResult<Self> {
        if config.width == 0 || config.height == 0 {
            return Err(CutlineError::encode(format!(
                "Invalid frame size {}x{}",
                config.width, config.height
            )));
        }
        Ok(Self {
            config,
            quality: DEFAULT_JPEG_QUALITY,
            frames: 0,
        })
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality.clamp(1, 100);
        self
    }
}

#[async_trait]
impl VideoEncoder for MjpegEncoder {
    fn config(&self) -> &VideoEncoderConfig {
        &self.config
    }

    fn encode(
        &mut self,
        frame: &RgbaImage,
        timestamp_us: i64,
        duration_us: i64,
        _key_frame: bool,
    ) -> CutlineResult<Vec<EncodedChunk>> {
        if frame.dimensions() != (self.config.width, self.config.height) {
            return Err(CutlineError::encode(format!(
                "Frame is {}x{}, encoder expects {}x{}",
                frame.width(),
                frame.height(),
                self.config.width,
                self.config.height
            )));
        }
        let rgb: RgbImage = frame.convert();
        let mut data = Vec::new();
        JpegEncoder::new_with_quality(&mut data, self.quality)
            .encode_image(&rgb)
            .map_err(|e| CutlineError::encode(format!("JPEG encode failed: {e}")))?;
        self.frames += 1;
        Ok(vec![EncodedChunk {
            data,
            timestamp_us,
            duration_us,
            is_key: true,
        }])
    }

    async fn flush(&mut self) -> CutlineResult<Vec<EncodedChunk>> {
        debug!(frames = self.frames, "MJPEG encoder flushed");
        Ok(Vec::new())
    }
}

/// Interleaved signed 16-bit little-endian PCM.
#[derive(Debug)]
pub struct PcmEncoder {
    config: AudioEncoderConfig,
}

impl PcmEncoder {
    pub fn new(config: AudioEncoderConfig) -> CutlineResult<Self> {
        if config.sample_rate == 0 || config.channels == 0 {
            return Err(CutlineError::encode("PCM needs a sample rate and channels"));
        }
        Ok(Self { config })
    }
}

#[async_trait]
impl AudioEncoder for PcmEncoder {
    fn config(&self) -> &AudioEncoderConfig {
        &self.config
    }

    fn encode(&mut self, samples: &[f32], timestamp_us: i64) -> CutlineResult<Vec<EncodedChunk>> {
        let channels = self.config.channels as usize;
        if samples.len() % channels != 0 {
            return Err(CutlineError::encode(format!(
                "{} samples do not divide into {channels} channels",
                samples.len()
            )));
        }
        if samples.is_empty() {
            return Ok(Vec::new());
        }
        let mut data = Vec::with_capacity(samples.len() * 2);
        for &sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
            data.extend_from_slice(&value.to_le_bytes());
        }
        let frames = (samples.len() / channels) as i64;
        Ok(vec![EncodedChunk {
            data,
            timestamp_us,
            duration_us: frames * 1_000_000 / self.config.sample_rate as i64,
            is_key: true,
        }])
    }

    async fn flush(&mut self) -> CutlineResult<Vec<EncodedChunk>> {
        Ok(Vec::new())
    }
}

/// Factory for the in-process software encoders.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareEncoderFactory;

impl SoftwareEncoderFactory {
    fn video_codec_known(codec: &str) -> bool {
        matches!(codec.to_ascii_lowercase().as_str(), CODEC_MJPEG | "jpeg")
    }

    fn audio_codec_known(codec: &str) -> bool {
        matches!(codec.to_ascii_lowercase().as_str(), CODEC_PCM_S16 | "sowt")
    }
}

#[async_trait]
impl EncoderFactory for SoftwareEncoderFactory {
    async fn is_video_supported(&self, config: &VideoEncoderConfig) -> bool {
        Self::video_codec_known(&config.codec)
            && config.width > 0
            && config.height > 0
            && config.width <= u16::MAX as u32
            && config.height <= u16::MAX as u32
            && config.fps > 0
    }

    async fn is_audio_supported(&self, config: &AudioEncoderConfig) -> bool {
        Self::audio_codec_known(&config.codec)
            && config.channels > 0
            && config.sample_rate > 0
            && config.sample_rate <= u16::MAX as u32
    }

    fn create_video(&self, config: &VideoEncoderConfig) -> CutlineResult<Box<dyn VideoEncoder>> {
        if !Self::video_codec_known(&config.codec) {
            return Err(CutlineError::unsupported(format!("Video codec {}", config.codec)));
        }
        Ok(Box::new(MjpegEncoder::new(config.clone())?))
    }

    fn create_audio(&self, config: &AudioEncoderConfig) -> CutlineResult<Box<dyn AudioEncoder>> {
        if !Self::audio_codec_known(&config.codec) {
            return Err(CutlineError::unsupported(format!("Audio codec {}", config.codec)));
        }
        Ok(Box::new(PcmEncoder::new(config.clone())?))
    }
}
