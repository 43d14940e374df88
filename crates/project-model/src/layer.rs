//! Compositor layer definitions.
//!
//! Layers are created and replaced by the editing surface and held by the
//! compositor until removed or replaced wholesale.

use serde::{Deserialize, Serialize};

/// What a layer draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    Video,
    Image,
    Text,
}

/// Destination rectangle in surface pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerPosition {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Transition styles applied at a layer's edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransitionKind {
    #[default]
    Fade,
    Dissolve,
    WipeLeft,
    WipeRight,
    WipeUp,
    WipeDown,
}

impl TransitionKind {
    /// Directional wipes reveal through a growing clip rectangle.
    pub fn is_wipe(self) -> bool {
        matches!(
            self,
            TransitionKind::WipeLeft
                | TransitionKind::WipeRight
                | TransitionKind::WipeUp
                | TransitionKind::WipeDown
        )
    }
}

/// Transition attached to a layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerTransition {
    #[serde(rename = "type")]
    pub kind: TransitionKind,

    /// Ramp length in seconds, applied at both ends of the layer.
    pub duration: f64,
}

/// Portion of the source used by the layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TrimRange {
    /// Seconds skipped at the start of the source.
    pub start: f64,

    /// Source time at which the used portion ends.
    #[serde(default)]
    pub end: Option<f64>,
}

/// Text drawn by a text layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextStyle {
    pub content: String,

    #[serde(default = "default_font_size")]
    pub font_size: f64,

    /// Fill color as hex.
    #[serde(default = "default_text_color")]
    pub color: String,

    /// Optional box drawn behind the text.
    #[serde(default)]
    pub background_color: Option<String>,
}

fn default_font_size() -> f64 {
    48.0
}

fn default_text_color() -> String {
    "#ffffff".to_string()
}

/// A timed visual element composited into the output frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositorLayer {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: LayerKind,

    /// Decode source id (video) or image URL/path (image).
    #[serde(default)]
    pub source: Option<String>,

    /// Composition time at which the layer appears.
    pub start_time: f64,

    /// Seconds the layer stays on screen.
    pub duration: f64,

    /// Draw order; higher is drawn later.
    #[serde(default)]
    pub z_index: i32,

    #[serde(default)]
    pub position: Option<LayerPosition>,

    /// Base opacity in `[0, 1]`; transitions multiply into it.
    #[serde(default)]
    pub opacity: Option<f64>,

    #[serde(default)]
    pub text: Option<TextStyle>,

    #[serde(default)]
    pub transition: Option<LayerTransition>,

    #[serde(default)]
    pub trim: Option<TrimRange>,

    /// Playback rate; 1.0 when absent.
    #[serde(default)]
    pub speed: Option<f64>,
}

impl CompositorLayer {
    /// A layer with no optional properties set.
    pub fn new(id: impl Into<String>, kind: LayerKind, start_time: f64, duration: f64) -> Self {
        Self {
            id: id.into(),
            kind,
            source: None,
            start_time,
            duration,
            z_index: 0,
            position: None,
            opacity: None,
            text: None,
            transition: None,
            trim: None,
            speed: None,
        }
    }

    /// Composition time at which the layer disappears.
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }

    /// `start_time <= t < start_time + duration`.
    pub fn is_active(&self, t: f64) -> bool {
        self.start_time <= t && t < self.end_time()
    }

    /// Playback rate, defaulting to 1.0 and ignoring non-positive values.
    pub fn effective_speed(&self) -> f64 {
        match self.speed {
            Some(speed) if speed > 0.0 && speed.is_finite() => speed,
            _ => 1.0,
        }
    }

    /// Source time shown at composition time `t`:
    /// `trim_start + (t - start_time) * speed`.
    pub fn local_time(&self, t: f64) -> f64 {
        let trim_start = self.trim.map(|trim| trim.start).unwrap_or(0.0);
        trim_start + (t - self.start_time) * self.effective_speed()
    }

    /// Base opacity clamped into `[0, 1]`.
    pub fn base_opacity(&self) -> f64 {
        self.opacity.unwrap_or(1.0).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_interval_is_half_open() {
        let layer = CompositorLayer::new("a", LayerKind::Video, 2.0, 3.0);
        assert!(!layer.is_active(1.999));
        assert!(layer.is_active(2.0));
        assert!(layer.is_active(4.999));
        assert!(!layer.is_active(5.0));
    }

    #[test]
    fn test_local_time_applies_trim_and_speed() {
        let mut layer = CompositorLayer::new("a", LayerKind::Video, 10.0, 5.0);
        layer.trim = Some(TrimRange {
            start: 1.5,
            end: None,
        });
        layer.speed = Some(2.0);
        assert!((layer.local_time(10.0) - 1.5).abs() < 1e-12);
        assert!((layer.local_time(12.0) - 5.5).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_speed_falls_back_to_unity() {
        let mut layer = CompositorLayer::new("a", LayerKind::Video, 0.0, 1.0);
        layer.speed = Some(0.0);
        assert_eq!(layer.effective_speed(), 1.0);
        layer.speed = Some(f64::NAN);
        assert_eq!(layer.effective_speed(), 1.0);
    }

    #[test]
    fn test_layer_deserializes_from_editor_json() {
        let raw = r##"{
            "id": "title",
            "type": "text",
            "startTime": 0.5,
            "duration": 2.0,
            "zIndex": 3,
            "text": {"content": "Hello", "fontSize": 64},
            "transition": {"type": "wipe-left", "duration": 0.4}
        }"##;
        let layer: CompositorLayer = serde_json::from_str(raw).unwrap();
        assert_eq!(layer.kind, LayerKind::Text);
        assert_eq!(layer.z_index, 3);
        assert_eq!(layer.text.as_ref().unwrap().color, "#ffffff");
        assert!(layer.transition.unwrap().kind.is_wipe());
    }
}
