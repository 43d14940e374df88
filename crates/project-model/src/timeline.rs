//! Timeline items as produced by the editing surface.
//!
//! The compositor and the exporter read these to decide which layers are
//! active at a given time and which clips contribute audio. Nothing in the
//! core mutates them.

use serde::{Deserialize, Serialize};

use crate::layer::{
    CompositorLayer, LayerKind, LayerPosition, LayerTransition, TextStyle, TrimRange,
};

/// Kind of timeline item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipKind {
    Video,
    Image,
    Text,
    Audio,
}

/// Per-clip settings edited by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClipSettings {
    /// Volume in `0..=100`.
    pub volume: f64,

    /// Muted clips contribute no audio.
    pub muted: bool,

    /// Linear fade-out over the clip's final seconds.
    pub fade_out: f64,

    /// Base opacity in `[0, 1]`.
    pub opacity: f64,
}

impl Default for ClipSettings {
    fn default() -> Self {
        Self {
            volume: 100.0,
            muted: false,
            fade_out: 0.0,
            opacity: 1.0,
        }
    }
}

impl ClipSettings {
    /// Volume mapped from `0..=100` to a linear gain in `0.0..=1.0`.
    pub fn gain(&self) -> f32 {
        (self.volume / 100.0).clamp(0.0, 1.0) as f32
    }
}

/// A single item on the timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineItem {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: ClipKind,

    /// Media URL or path for video/image/audio items.
    #[serde(default)]
    pub url: Option<String>,

    /// Composition time at which the item starts.
    pub start_time: f64,

    /// Seconds the item occupies on the timeline.
    pub duration: f64,

    /// Ordering among items; doubles as z-index for visual items.
    #[serde(default)]
    pub order: i32,

    #[serde(default)]
    pub trim: Option<TrimRange>,

    #[serde(default)]
    pub speed: Option<f64>,

    #[serde(default)]
    pub settings: ClipSettings,

    #[serde(default)]
    pub transition: Option<LayerTransition>,

    #[serde(default)]
    pub text: Option<TextStyle>,

    #[serde(default)]
    pub position: Option<LayerPosition>,
}

impl TimelineItem {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }

    pub fn is_active(&self, t: f64) -> bool {
        self.start_time <= t && t < self.end_time()
    }

    pub fn trim_start(&self) -> f64 {
        self.trim.map(|trim| trim.start).unwrap_or(0.0)
    }

    pub fn effective_speed(&self) -> f64 {
        match self.speed {
            Some(speed) if speed > 0.0 && speed.is_finite() => speed,
            _ => 1.0,
        }
    }

    /// Whether the item feeds the audio mix during export.
    pub fn carries_audio(&self) -> bool {
        match self.kind {
            ClipKind::Audio => !self.settings.muted,
            ClipKind::Video => !self.settings.muted,
            _ => false,
        }
    }

    /// The compositor layer for a visual item; `None` for audio items.
    pub fn to_layer(&self) -> Option<CompositorLayer> {
        let kind = match self.kind {
            ClipKind::Video => LayerKind::Video,
            ClipKind::Image => LayerKind::Image,
            ClipKind::Text => LayerKind::Text,
            ClipKind::Audio => return None,
        };

        let source = match self.kind {
            // Video layers read frames decoded under the item id.
            ClipKind::Video => Some(self.id.clone()),
            _ => self.url.clone(),
        };

        Some(CompositorLayer {
            id: self.id.clone(),
            kind,
            source,
            start_time: self.start_time,
            duration: self.duration,
            z_index: self.order,
            position: self.position,
            opacity: Some(self.settings.opacity),
            text: self.text.clone(),
            transition: self.transition,
            trim: self.trim,
            speed: self.speed,
        })
    }

    /// The decode-buffering view of a video item.
    pub fn to_buffer_item(&self) -> Option<BufferItem> {
        if self.kind != ClipKind::Video {
            return None;
        }
        Some(BufferItem {
            id: self.id.clone(),
            start_time: self.start_time,
            duration: self.duration,
            trim: self.trim,
            speed: self.effective_speed(),
        })
    }
}

/// What the decode worker needs to pre-decode a window of an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferItem {
    pub id: String,
    pub start_time: f64,
    pub duration: f64,
    #[serde(default)]
    pub trim: Option<TrimRange>,
    pub speed: f64,
}

impl BufferItem {
    /// Source time shown at composition time `t`.
    pub fn local_time(&self, t: f64) -> f64 {
        let trim_start = self.trim.map(|trim| trim.start).unwrap_or(0.0);
        trim_start + (t - self.start_time) * self.speed
    }

    /// Source range the item uses: `[trim_start, trim_start + duration * speed]`,
    /// cut short by an explicit trim end.
    pub fn source_range(&self) -> (f64, f64) {
        let start = self.trim.map(|trim| trim.start).unwrap_or(0.0);
        let mut end = start + self.duration * self.speed;
        if let Some(trim_end) = self.trim.and_then(|trim| trim.end) {
            end = end.min(trim_end);
        }
        (start, end.max(start))
    }
}

/// The full editing timeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeline {
    pub items: Vec<TimelineItem>,
}

impl Timeline {
    pub fn new(items: Vec<TimelineItem>) -> Self {
        Self { items }
    }

    /// End of the last item.
    pub fn total_duration(&self) -> f64 {
        self.items
            .iter()
            .map(TimelineItem::end_time)
            .fold(0.0, f64::max)
    }

    /// Items active at `t`, in timeline order.
    pub fn active_at(&self, t: f64) -> impl Iterator<Item = &TimelineItem> {
        self.items.iter().filter(move |item| item.is_active(t))
    }

    /// Compositor layers for every visual item.
    pub fn layers(&self) -> Vec<CompositorLayer> {
        self.items.iter().filter_map(TimelineItem::to_layer).collect()
    }

    /// Buffering descriptors for every video item.
    pub fn buffer_items(&self) -> Vec<BufferItem> {
        self.items
            .iter()
            .filter_map(TimelineItem::to_buffer_item)
            .collect()
    }

    /// Items that feed the export audio mix.
    pub fn audio_items(&self) -> impl Iterator<Item = &TimelineItem> {
        self.items
            .iter()
            .filter(|item| item.carries_audio() && item.url.is_some())
    }

    /// Reject timelines the compositor and exporter cannot handle.
    pub fn validate(&self) -> Result<(), TimelineError> {
        let mut seen = std::collections::HashSet::new();
        for item in &self.items {
            if item.id.is_empty() {
                return Err(TimelineError::Invalid {
                    message: "item with empty id".to_string(),
                });
            }
            if !seen.insert(item.id.as_str()) {
                return Err(TimelineError::DuplicateId {
                    id: item.id.clone(),
                });
            }
            if !(item.start_time.is_finite() && item.start_time >= 0.0) {
                return Err(TimelineError::Invalid {
                    message: format!("item {} has invalid start time", item.id),
                });
            }
            if !(item.duration.is_finite() && item.duration > 0.0) {
                return Err(TimelineError::Invalid {
                    message: format!("item {} has non-positive duration", item.id),
                });
            }
            if matches!(item.kind, ClipKind::Video | ClipKind::Image | ClipKind::Audio)
                && item.url.is_none()
            {
                return Err(TimelineError::Invalid {
                    message: format!("item {} has no media url", item.id),
                });
            }
        }
        Ok(())
    }

    /// Parse a timeline from editor JSON.
    pub fn from_json(json: &str) -> Result<Self, TimelineError> {
        let timeline: Timeline = serde_json::from_str(json)?;
        timeline.validate()?;
        Ok(timeline)
    }
}

/// Errors raised while reading a timeline.
#[derive(Debug, thiserror::Error)]
pub enum TimelineError {
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Duplicate item id: {id}")]
    DuplicateId { id: String },

    #[error("Invalid timeline: {message}")]
    Invalid { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, kind: ClipKind, start: f64, duration: f64) -> TimelineItem {
        TimelineItem {
            id: id.to_string(),
            kind,
            url: Some(format!("{id}.mp4")),
            start_time: start,
            duration,
            order: 0,
            trim: None,
            speed: None,
            settings: ClipSettings::default(),
            transition: None,
            text: None,
            position: None,
        }
    }

    #[test]
    fn test_total_duration_is_last_end() {
        let timeline = Timeline::new(vec![
            item("a", ClipKind::Video, 0.0, 3.0),
            item("b", ClipKind::Video, 3.0, 3.0),
            item("c", ClipKind::Audio, 1.0, 8.0),
        ]);
        assert!((timeline.total_duration() - 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_audio_items_include_unmuted_video() {
        let mut muted = item("m", ClipKind::Video, 0.0, 1.0);
        muted.settings.muted = true;
        let timeline = Timeline::new(vec![
            item("v", ClipKind::Video, 0.0, 1.0),
            muted,
            item("i", ClipKind::Image, 0.0, 1.0),
            item("a", ClipKind::Audio, 0.0, 1.0),
        ]);
        let ids: Vec<&str> = timeline.audio_items().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["v", "a"]);
    }

    #[test]
    fn test_video_layer_sources_from_item_id() {
        let layer = item("clip-1", ClipKind::Video, 0.0, 1.0).to_layer().unwrap();
        assert_eq!(layer.source.as_deref(), Some("clip-1"));
        let layer = item("img", ClipKind::Image, 0.0, 1.0).to_layer().unwrap();
        assert_eq!(layer.source.as_deref(), Some("img.mp4"));
        assert!(item("a", ClipKind::Audio, 0.0, 1.0).to_layer().is_none());
    }

    #[test]
    fn test_buffer_item_source_range_respects_trim_end() {
        let mut video = item("v", ClipKind::Video, 5.0, 4.0);
        video.trim = Some(TrimRange {
            start: 1.0,
            end: Some(3.0),
        });
        video.speed = Some(1.0);
        let buffer = video.to_buffer_item().unwrap();
        assert_eq!(buffer.source_range(), (1.0, 3.0));
        assert!((buffer.local_time(6.0) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let timeline = Timeline::new(vec![
            item("a", ClipKind::Video, 0.0, 1.0),
            item("a", ClipKind::Video, 1.0, 1.0),
        ]);
        assert!(matches!(
            timeline.validate(),
            Err(TimelineError::DuplicateId { .. })
        ));
    }

    #[test]
    fn test_gain_maps_volume_range() {
        let mut settings = ClipSettings::default();
        assert_eq!(settings.gain(), 1.0);
        settings.volume = 50.0;
        assert_eq!(settings.gain(), 0.5);
        settings.volume = 250.0;
        assert_eq!(settings.gain(), 1.0);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn local_time_is_monotonic_within_item(
                start in 0.0f64..100.0,
                duration in 0.1f64..50.0,
                trim in 0.0f64..10.0,
                speed in 0.25f64..4.0,
                a in 0.0f64..1.0,
                b in 0.0f64..1.0,
            ) {
                let buffer = BufferItem {
                    id: "v".to_string(),
                    start_time: start,
                    duration,
                    trim: Some(TrimRange { start: trim, end: None }),
                    speed,
                };
                let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                let t0 = start + lo * duration;
                let t1 = start + hi * duration;
                prop_assert!(buffer.local_time(t0) <= buffer.local_time(t1));
                prop_assert!(buffer.local_time(start) == trim);
            }
        }
    }
}
