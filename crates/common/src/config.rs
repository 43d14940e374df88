//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Global engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Frame cache sizing and matching.
    pub cache: CacheConfig,

    /// Decode worker settings.
    pub decode: DecodeConfig,

    /// Real-time compositor settings.
    pub compositor: CompositorConfig,

    /// Offline export defaults.
    pub export: ExportSettings,

    /// Remote API settings.
    pub api: ApiConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Frame cache parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum cached frames per source (300 ≈ 10s at 30fps).
    pub max_frames_per_video: usize,

    /// Quantization units per second used for time keys.
    pub time_resolution: u32,

    /// Symmetric neighborhood (in units) tried after an exact miss.
    pub neighbor_radius: i64,

    /// Widest distance (in units) the closest-key scan accepts.
    pub search_window: i64,

    /// Frames this far behind playback become eviction candidates.
    pub behind_margin_secs: f64,
}

/// Decode worker parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    /// Decoder-owned frames that may be outstanding at once.
    pub frame_pool_depth: usize,

    /// Bounded capacity of the coordinator → worker request channel.
    pub request_capacity: usize,

    /// Bounded capacity of the worker → coordinator event channel.
    pub event_capacity: usize,

    /// Seconds to pre-decode ahead of the playhead.
    pub buffer_ahead_secs: f64,

    /// Seconds to keep decoded behind the playhead.
    pub buffer_behind_secs: f64,

    /// ffmpeg binary used by the process-backed decoder.
    pub ffmpeg_path: String,

    /// ffprobe binary used for metadata probing.
    pub ffprobe_path: String,
}

/// Real-time compositor parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorConfig {
    /// Surface width in pixels.
    pub width: u32,

    /// Surface height in pixels.
    pub height: u32,

    /// Target render rate.
    pub fps: u32,

    /// Background fill as hex (`#000000`).
    pub background: String,

    /// How often media elements are checked for drift.
    pub media_sync_interval_ms: u64,

    /// Drift above which a media element is re-seeked.
    pub drift_threshold_secs: f64,
}

/// Offline export defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,

    /// Video codec string (`mjpeg`, `avc1.42001f`, ...).
    pub video_codec: String,

    /// Audio codec string (`pcm-s16`, `mp4a.40.2`, ...).
    pub audio_codec: String,

    /// Target video bitrate in kbps.
    pub video_bitrate_kbps: u32,

    /// Every Nth frame is requested as a keyframe.
    pub keyframe_interval: u64,

    /// Mix sample rate.
    pub sample_rate: u32,

    /// Mix channel count.
    pub channels: u16,

    /// Container writing strategy.
    pub mux_mode: MuxMode,
}

/// How the container is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MuxMode {
    /// Collect every chunk, serialize `moov` + `mdat` at finalize.
    #[default]
    Buffered,
    /// Write an init segment, then `moof`/`mdat` fragments as chunks arrive.
    Fragmented,
}

/// Remote API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the generation/export API.
    pub base_url: String,

    /// Poll interval for job status.
    pub poll_interval_ms: u64,

    /// Per-request timeout.
    pub request_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "cutline=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,

    /// Optional log file path.
    pub file: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_frames_per_video: 300,
            time_resolution: 30,
            neighbor_radius: 3,
            search_window: 30,
            behind_margin_secs: 1.0,
        }
    }
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            frame_pool_depth: 10,
            request_capacity: 64,
            event_capacity: 64,
            buffer_ahead_secs: 2.0,
            buffer_behind_secs: 0.5,
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
        }
    }
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            background: "#000000".to_string(),
            media_sync_interval_ms: 100,
            drift_threshold_secs: 0.5,
        }
    }
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            video_codec: "mjpeg".to_string(),
            audio_codec: "pcm-s16".to_string(),
            video_bitrate_kbps: 8000,
            keyframe_interval: 30,
            sample_rate: 48000,
            channels: 2,
            mux_mode: MuxMode::Buffered,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            poll_interval_ms: 2500,
            request_timeout_secs: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl EngineConfig {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        Self::load_from(&config_file_path())
    }

    /// Load config from an explicit path, falling back to defaults.
    pub fn load_from(config_path: &std::path::Path) -> Self {
        if config_path.exists() {
            match std::fs::read_to_string(config_path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Failed to parse config at {:?}: {}", config_path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read config at {:?}: {}", config_path, e);
                }
            }
        }
        Self::default()
    }

    /// Save config to the standard location.
    pub fn save(&self) -> Result<(), std::io::Error> {
        let config_path = config_file_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(config_path, json)
    }

    /// Reject values that would make the engine misbehave.
    pub fn validate(&self) -> crate::error::CutlineResult<()> {
        use crate::error::CutlineError;

        if self.cache.max_frames_per_video == 0 {
            return Err(CutlineError::config("cache.max_frames_per_video must be > 0"));
        }
        if self.cache.time_resolution == 0 {
            return Err(CutlineError::config("cache.time_resolution must be > 0"));
        }
        if self.decode.frame_pool_depth == 0 {
            return Err(CutlineError::config("decode.frame_pool_depth must be > 0"));
        }
        if self.compositor.fps == 0 || self.export.fps == 0 {
            return Err(CutlineError::config("fps must be > 0"));
        }
        if self.export.keyframe_interval == 0 {
            return Err(CutlineError::config("export.keyframe_interval must be > 0"));
        }
        Ok(())
    }
}

/// Standard config file location.
fn config_file_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("cutline").join("config.json")
}
