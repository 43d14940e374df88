//! Source media metadata.

use serde::{Deserialize, Serialize};

/// Identifier of a decodable source (a timeline item id in practice).
pub type SourceId = String;

/// Metadata of a decoded source.
///
/// Created once on the first successful load and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    /// Duration in seconds.
    pub duration: f64,

    /// Coded width in pixels.
    pub width: u32,

    /// Coded height in pixels.
    pub height: u32,

    /// Average frame rate.
    pub frame_rate: f64,

    /// Whether the source carries a video stream.
    pub has_video: bool,

    /// Whether the source carries an audio stream.
    pub has_audio: bool,
}

impl VideoMetadata {
    /// Number of frames at the source's own rate.
    pub fn frame_count(&self) -> u64 {
        (self.duration * self.frame_rate).ceil().max(0.0) as u64
    }

    /// Clamp a source-local time into `[0, duration]`.
    pub fn clamp_time(&self, time: f64) -> f64 {
        time.clamp(0.0, self.duration.max(0.0))
    }
}
