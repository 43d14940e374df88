//! Process-backed decoder using ffprobe and ffmpeg.
//!
//! Metadata comes from `ffprobe -print_format json`. Frames are read as raw
//! RGBA from an `ffmpeg -ss <t> ... -f rawvideo -pix_fmt rgba -` process.
//! Sequential requests keep reading the same process; a request that jumps
//! backwards or far ahead restarts it at the new position.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use image::RgbaImage;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, trace};

use cutline_common::config::DecodeConfig;
use cutline_common::error::{CutlineError, CutlineResult};
use cutline_project_model::VideoMetadata;

use crate::decoder::{DecoderFactory, MediaDecoder};
use crate::frame::image_from_rgba;

/// Furthest a forward request may skip by reading through frames instead of
/// restarting the process.
const MAX_READ_AHEAD_SECS: f64 = 1.0;

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Parse an ffprobe rate such as `30000/1001` or `25`.
fn parse_rate(rate: &str) -> Option<f64> {
    let value = match rate.split_once('/') {
        Some((num, den)) => {
            let den: f64 = den.parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num.parse::<f64>().ok()? / den
        }
        None => rate.parse().ok()?,
    };
    (value.is_finite() && value > 0.0).then_some(value)
}

fn metadata_from_probe(output: ProbeOutput) -> CutlineResult<VideoMetadata> {
    let video = output
        .streams
        .iter()
        .find(|stream| stream.codec_type.as_deref() == Some("video"));
    let has_audio = output
        .streams
        .iter()
        .any(|stream| stream.codec_type.as_deref() == Some("audio"));

    let duration = output
        .format
        .as_ref()
        .and_then(|format| format.duration.as_deref())
        .or_else(|| video.and_then(|stream| stream.duration.as_deref()))
        .and_then(|duration| duration.parse::<f64>().ok())
        .filter(|duration| duration.is_finite() && *duration >= 0.0)
        .ok_or_else(|| CutlineError::decode("ffprobe reported no duration"))?;

    let (width, height, frame_rate) = match video {
        Some(stream) => {
            let frame_rate = stream
                .avg_frame_rate
                .as_deref()
                .and_then(parse_rate)
                .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate))
                .unwrap_or(30.0);
            (stream.width.unwrap_or(0), stream.height.unwrap_or(0), frame_rate)
        }
        None => (0, 0, 0.0),
    };

    Ok(VideoMetadata {
        duration,
        width,
        height,
        frame_rate,
        has_video: video.is_some() && width > 0 && height > 0,
        has_audio,
    })
}

/// Filesystem path of `url`, or `None` for network and other schemes.
fn local_path(url: &str) -> Option<&Path> {
    match url.strip_prefix("file://") {
        Some(path) => Some(Path::new(path)),
        None if url.contains("://") => None,
        None => Some(Path::new(url)),
    }
}

struct FrameStream {
    child: Child,
    stdout: ChildStdout,
    /// Source time of the next frame the process will emit.
    next_time: f64,
}

/// Decoder driving ffmpeg subprocesses for one URL.
pub struct FfmpegDecoder {
    ffmpeg_path: String,
    ffprobe_path: String,
    url: String,
    metadata: Option<VideoMetadata>,
    stream: Option<FrameStream>,
}

impl FfmpegDecoder {
    pub fn new(config: &DecodeConfig, url: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            ffprobe_path: config.ffprobe_path.clone(),
            url: url.into(),
            metadata: None,
            stream: None,
        }
    }

    async fn metadata(&mut self) -> CutlineResult<VideoMetadata> {
        match &self.metadata {
            Some(metadata) => Ok(metadata.clone()),
            None => self.probe().await,
        }
    }

    fn spawn_stream(&self, time: f64) -> CutlineResult<FrameStream> {
        debug!(url = %self.url, time, "Starting ffmpeg frame stream");
        let mut child = Command::new(&self.ffmpeg_path)
            .args(["-v", "error", "-ss", &format!("{time:.3}"), "-i", &self.url])
            .args(["-an", "-f", "rawvideo", "-pix_fmt", "rgba", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CutlineError::decode(format!("Failed to start ffmpeg: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CutlineError::decode("ffmpeg stdout unavailable"))?;
        Ok(FrameStream {
            child,
            stdout,
            next_time: time,
        })
    }

    async fn stop_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.child.kill().await;
            let _ = stream.child.wait().await;
        }
    }
}

#[async_trait]
impl MediaDecoder for FfmpegDecoder {
    async fn probe(&mut self) -> CutlineResult<VideoMetadata> {
        if let Some(path) = local_path(&self.url) {
            if !path.exists() {
                return Err(CutlineError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
        }
        let output = Command::new(&self.ffprobe_path)
            .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(&self.url)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| CutlineError::decode(format!("Failed to run ffprobe: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CutlineError::decode(format!(
                "ffprobe failed for {}: {}",
                self.url,
                stderr.trim()
            )));
        }

        let parsed: ProbeOutput = serde_json::from_slice(&output.stdout)?;
        let metadata = metadata_from_probe(parsed)?;
        self.metadata = Some(metadata.clone());
        Ok(metadata)
    }

    async fn decode_frame_at(&mut self, time: f64) -> CutlineResult<RgbaImage> {
        let metadata = self.metadata().await?;
        if !metadata.has_video {
            return Err(CutlineError::decode(format!("{} has no video stream", self.url)));
        }
        let interval = 1.0 / metadata.frame_rate;
        let frame_size = metadata.width as usize * metadata.height as usize * 4;
        let time = metadata.clamp_time(time);

        let reusable = self.stream.as_ref().is_some_and(|stream| {
            time >= stream.next_time - interval / 2.0
                && time <= stream.next_time + MAX_READ_AHEAD_SECS
        });
        if !reusable {
            self.stop_stream().await;
            self.stream = Some(self.spawn_stream(time)?);
        }

        let Some(stream) = self.stream.as_mut() else {
            return Err(CutlineError::decode("ffmpeg stream unavailable"));
        };

        let mut buffer = vec![0u8; frame_size];
        loop {
            let shown_at = stream.next_time;
            match stream.stdout.read_exact(&mut buffer).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    self.stop_stream().await;
                    return Err(CutlineError::decode(format!(
                        "No frame at {time:.3}s in {}",
                        self.url
                    )));
                }
                Err(e) => {
                    self.stop_stream().await;
                    return Err(e.into());
                }
            }
            stream.next_time += interval;
            if shown_at + interval / 2.0 >= time {
                trace!(url = %self.url, time, shown_at, "Decoded frame");
                break;
            }
        }

        image_from_rgba(metadata.width, metadata.height, buffer)
    }

    async fn extract_audio(&mut self, dest: &Path) -> CutlineResult<bool> {
        let metadata = self.metadata().await?;
        if !metadata.has_audio {
            return Ok(false);
        }
        let status = Command::new(&self.ffmpeg_path)
            .args(["-v", "error", "-y", "-i", &self.url, "-vn", "-f", "wav"])
            .arg(dest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| CutlineError::audio(format!("Failed to run ffmpeg: {e}")))?;
        if !status.success() {
            return Err(CutlineError::audio(format!(
                "Audio extraction failed for {}",
                self.url
            )));
        }
        Ok(true)
    }

    async fn close(&mut self) {
        self.stop_stream().await;
    }
}

/// Opens an [`FfmpegDecoder`] per URL.
#[derive(Debug, Clone, Default)]
pub struct FfmpegDecoderFactory {
    config: DecodeConfig,
}

impl FfmpegDecoderFactory {
    pub fn new(config: DecodeConfig) -> Self {
        Self { config }
    }
}

impl DecoderFactory for FfmpegDecoderFactory {
    fn open(&self, _source_id: &str, url: &str) -> CutlineResult<Box<dyn MediaDecoder>> {
        Ok(Box::new(FfmpegDecoder::new(&self.config, url)))
    }
}

/// Whether `binary -version` runs successfully.
pub async fn binary_available(binary: &str) -> bool {
    Command::new(binary)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}
