//! Offline audio rendering for export.
//!
//! Every audio-bearing timeline item is decoded to interleaved f32 at the mix
//! rate, then scheduled into an [`OfflineMixer`] at its timeline offset with
//! its gain, fade-out, trim and speed. A clip whose audio cannot be loaded is
//! skipped; the rest of the mix is unaffected.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use cutline_common::config::DecodeConfig;
use cutline_common::error::{CutlineError, CutlineResult};
use cutline_common::signal::AbortSignal;
use cutline_project_model::{Timeline, TimelineItem};

/// Decoded interleaved f32 audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioBuffer {
    pub fn silence(sample_rate: u32, channels: u16, frames: usize) -> Self {
        Self {
            sample_rate,
            channels,
            samples: vec![0.0; frames * channels as usize],
        }
    }

    /// Sample frames (one sample per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate.max(1) as f64
    }

    /// Peak absolute sample value.
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
    }
}

/// Fetches and decodes a source's audio track.
#[async_trait]
pub trait AudioLoader: Send + Sync {
    /// Decode `url` to interleaved f32 at `sample_rate` with `channels`.
    async fn load(&self, url: &str, sample_rate: u32, channels: u16) -> CutlineResult<AudioBuffer>;
}

/// Decodes audio through `ffmpeg -f f32le`.
#[derive(Debug, Clone)]
pub struct FfmpegAudioLoader {
    ffmpeg_path: String,
}

impl FfmpegAudioLoader {
    pub fn new(config: &DecodeConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
        }
    }
}

impl Default for FfmpegAudioLoader {
    fn default() -> Self {
        Self::new(&DecodeConfig::default())
    }
}

#[async_trait]
impl AudioLoader for FfmpegAudioLoader {
    async fn load(&self, url: &str, sample_rate: u32, channels: u16) -> CutlineResult<AudioBuffer> {
        let output = Command::new(&self.ffmpeg_path)
            .args(["-v", "error", "-i", url, "-vn", "-f", "f32le"])
            .args(["-ac", &channels.to_string(), "-ar", &sample_rate.to_string(), "-"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CutlineError::audio(format!("Failed to run ffmpeg: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CutlineError::audio(format!(
                "Audio decode failed for {url}: {}",
                stderr.trim()
            )));
        }

        let samples: Vec<f32> = output
            .stdout
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        debug!(url, samples = samples.len(), "Decoded source audio");
        Ok(AudioBuffer {
            sample_rate,
            channels,
            samples,
        })
    }
}

/// A clip scheduled into the mix.
#[derive(Debug, Clone)]
pub struct AudioClip {
    /// Timeline offset in seconds.
    pub start_time: f64,
    /// Timeline span in seconds.
    pub duration: f64,
    /// Source seconds skipped at the start.
    pub trim_start: f64,
    /// Source time at which the clip stops, if trimmed.
    pub trim_end: Option<f64>,
    pub speed: f64,
    pub gain: f32,
    /// Linear fade-out over the clip's final seconds.
    pub fade_out: f64,
    pub source: Arc<AudioBuffer>,
}

impl AudioClip {
    /// Clip settings taken from a timeline item.
    pub fn from_item(item: &TimelineItem, source: Arc<AudioBuffer>) -> Self {
        Self {
            start_time: item.start_time,
            duration: item.duration,
            trim_start: item.trim_start(),
            trim_end: item.trim.and_then(|trim| trim.end),
            speed: item.effective_speed(),
            gain: item.settings.gain(),
            fade_out: item.settings.fade_out.max(0.0),
            source,
        }
    }

    fn fade_gain(&self, rel_secs: f64) -> f32 {
        if self.fade_out <= 0.0 {
            return 1.0;
        }
        let remaining = (self.duration - rel_secs).max(0.0);
        (remaining / self.fade_out).clamp(0.0, 1.0) as f32
    }
}

/// Mixes scheduled clips into a fixed-length buffer.
#[derive(Debug)]
pub struct OfflineMixer {
    sample_rate: u32,
    channels: u16,
    total_frames: usize,
    clips: Vec<AudioClip>,
}

impl OfflineMixer {
    pub fn new(sample_rate: u32, channels: u16, duration_secs: f64) -> Self {
        let total_frames = (duration_secs.max(0.0) * sample_rate as f64).ceil() as usize;
        Self {
            sample_rate,
            channels: channels.max(1),
            total_frames,
            clips: Vec::new(),
        }
    }

    pub fn schedule(&mut self, clip: AudioClip) {
        self.clips.push(clip);
    }

    pub fn clip_count(&self) -> usize {
        self.clips.len()
    }

    /// Mix every scheduled clip. Overlapping clips are summed and the result
    /// is clamped to `[-1, 1]`.
    pub fn render(&self) -> AudioBuffer {
        let channels = self.channels as usize;
        let rate = self.sample_rate as f64;
        let mut out = vec![0.0f32; self.total_frames * channels];

        for clip in &self.clips {
            let src = &clip.source;
            let src_channels = src.channels.max(1) as usize;
            let src_frames = src.frames();
            if src_frames == 0 || clip.gain <= 0.0 {
                continue;
            }
            let src_rate = src.sample_rate.max(1) as f64;
            let first = (clip.start_time.max(0.0) * rate).round() as usize;
            let last = (((clip.start_time + clip.duration) * rate).round() as usize).min(self.total_frames);

            for dst_frame in first..last {
                let rel_secs = (dst_frame - first) as f64 / rate;
                let src_secs = clip.trim_start + rel_secs * clip.speed;
                if clip.trim_end.is_some_and(|end| src_secs >= end) {
                    break;
                }
                let src_pos = src_secs * src_rate;
                if !src_pos.is_finite() || src_pos < 0.0 {
                    break;
                }
                let frame0 = src_pos.floor() as usize;
                if frame0 >= src_frames {
                    break;
                }
                let frame1 = (frame0 + 1).min(src_frames - 1);
                let frac = (src_pos - frame0 as f64) as f32;
                let gain = clip.gain * clip.fade_gain(rel_secs);

                for channel in 0..channels {
                    let c = channel.min(src_channels - 1);
                    let v0 = src.samples[frame0 * src_channels + c];
                    let v1 = src.samples[frame1 * src_channels + c];
                    out[dst_frame * channels + channel] += (v0 + (v1 - v0) * frac) * gain;
                }
            }
        }

        for sample in &mut out {
            *sample = sample.clamp(-1.0, 1.0);
        }
        AudioBuffer {
            sample_rate: self.sample_rate,
            channels: self.channels,
            samples: out,
        }
    }
}

/// Result of mixing a timeline.
#[derive(Debug, Clone)]
pub struct TimelineAudio {
    pub buffer: AudioBuffer,
    pub mixed: usize,
    pub skipped: usize,
}

/// Load and mix every audio-bearing item of `timeline`.
///
/// Each source URL is decoded once. Per-clip failures are logged and the
/// clip is left out. The abort signal is checked before every fetch.
pub async fn render_timeline_audio(
    timeline: &Timeline,
    loader: &dyn AudioLoader,
    sample_rate: u32,
    channels: u16,
    abort: &AbortSignal,
) -> CutlineResult<TimelineAudio> {
    let mut mixer = OfflineMixer::new(sample_rate, channels, timeline.total_duration());
    let mut sources: HashMap<String, Arc<AudioBuffer>> = HashMap::new();
    let mut skipped = 0;

    for item in timeline.audio_items() {
        abort.check()?;
        let Some(url) = item.url.as_deref() else {
            continue;
        };
        let source = match sources.get(url) {
            Some(source) => source.clone(),
            None => match loader.load(url, sample_rate, channels).await {
                Ok(buffer) => {
                    let buffer = Arc::new(buffer);
                    sources.insert(url.to_string(), buffer.clone());
                    buffer
                }
                Err(e) => {
                    warn!(item_id = %item.id, url, error = %e, "Skipping clip audio");
                    skipped += 1;
                    continue;
                }
            },
        };
        mixer.schedule(AudioClip::from_item(item, source));
    }
    abort.check()?;

    let mixed = mixer.clip_count();
    let buffer = mixer.render();
    info!(mixed, skipped, frames = buffer.frames(), "Timeline audio rendered");
    Ok(TimelineAudio {
        buffer,
        mixed,
        skipped,
    })
}
