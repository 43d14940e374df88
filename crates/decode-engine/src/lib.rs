//! Cutline Decode Engine
//!
//! Turns media URLs into decoded frames the compositor and exporter can read.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐  WorkerRequest   ┌───────────────────────┐
//! │      DecodeCoordinator       │ ───────────────▶ │     DecodeWorker      │
//! │  load / seek / buffer / get  │                  │  MediaDecoder per src │
//! │  ┌────────────┐ ┌──────────┐ │ ◀─────────────── │  FramePool (depth 10) │
//! │  │ FrameCache │ │ Handles  │ │   WorkerEvent    └───────────────────────┘
//! │  └────────────┘ └──────────┘ │
//! └──────────────┬───────────────┘
//!                │ lazy
//!                ▼
//!          EffectWorker (blur / crop / extract)
//! ```
//!
//! Both channels are bounded. Decoded frames hold a pool slot until the
//! coordinator has converted them, which keeps decoding in step with intake.

pub mod cache;
pub mod coordinator;
pub mod decoder;
pub mod effects;
pub mod ffmpeg;
pub mod frame;
pub mod object_url;
pub mod protocol;
pub mod worker;

pub use cache::{time_key, CacheStats, FrameCache, TimeKey};
pub use coordinator::*;
pub use decoder::*;
pub use effects::{CropRect, EffectJob, EffectWorker};
pub use ffmpeg::{binary_available, FfmpegDecoder, FfmpegDecoderFactory};
pub use frame::*;
pub use object_url::{ObjectHandle, ObjectHandleRegistry};
pub use protocol::{WorkerEvent, WorkerRequest};
pub use worker::{spawn_decode_worker, WorkerChannels, WorkerConfig};
