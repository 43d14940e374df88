//! Cutline Render Engine
//!
//! Composes timeline layers into frames for live preview and offline export.
//!
//! # Pipeline Architecture
//!
//! ```text
//! DecodeCoordinator ──┐ FrameSource
//! image files ────────┼──▶ LayerCompositor ──▶ Surface (RgbaCanvas)
//! text styles ────────┘         │    ▲
//!                               │    └── RenderLoop (throttled, preview)
//!                               ▼
//!                       FrameProvider ──▶ ExportPipeline
//!                                              │
//!                     OfflineMixer ──▶ AudioEncoder
//!                                              │
//!                             VideoEncoder ────┤
//!                                              ▼
//!                                      Mp4Muxer ──▶ output.mp4
//! ```

pub mod audio;
pub mod compositor;
pub mod encoder;
pub mod export;
pub mod media_sync;
pub mod mux;
pub mod render_loop;
pub mod surface;

pub use audio::{
    render_timeline_audio, AudioBuffer, AudioClip, AudioLoader, FfmpegAudioLoader, OfflineMixer, TimelineAudio,
};
pub use compositor::{is_layer_active, transition_opacity, wipe_clip, LayerCompositor, RenderStats};
pub use encoder::*;
pub use export::*;
pub use media_sync::{DecodeSourceElement, MediaElement};
pub use mux::{AudioCodec, AudioTrackConfig, Mp4Muxer, VideoCodec, VideoTrackConfig};
pub use render_loop::{LoopStats, RenderLoop, DISPLAY_REFRESH};
pub use surface::{parse_hex_color, DrawCommand, Rect, RecordingSurface, RgbaCanvas, Surface};
