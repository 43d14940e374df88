//! Layer compositor: draws the timed layer set for one presentation time.
//!
//! Layers are drawn in ascending z-index. The draw order is cached and
//! rebuilt only after the layer set changes. Video layers read frames from a
//! [`FrameSource`] and fall back to the last frame they showed on a cache
//! miss, so a miss never blanks a layer that already had content.
//!
//! Attached media elements are re-synced to composited time at most once per
//! `media_sync_interval_ms`, and only when their drift exceeds
//! `drift_threshold_secs`. [`LayerCompositor::seek`] re-syncs immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{Rgba, RgbaImage};
use tracing::{debug, trace, warn};

use cutline_common::clock::{DriftMeasurement, PeriodicGate};
use cutline_common::config::CompositorConfig;
use cutline_decode_engine::{CachedFrame, FrameSource};
use cutline_project_model::{CompositorLayer, LayerKind, TransitionKind};

use crate::media_sync::MediaElement;
use crate::surface::{parse_hex_color, Rect, Surface};

/// Whether `layer` is on screen at composition time `t`.
pub fn is_layer_active(layer: &CompositorLayer, t: f64) -> bool {
    layer.is_active(t)
}

/// Ramp length for `layer`, capped at half its duration.
fn transition_window(layer: &CompositorLayer) -> Option<(TransitionKind, f64)> {
    let transition = layer.transition?;
    let window = transition.duration.min(layer.duration / 2.0);
    (window.is_finite() && window > 0.0).then_some((transition.kind, window))
}

/// Opacity contributed by the layer's transition at composition time `t`.
///
/// Ramps 0 → 1 over the first `d` seconds of the layer and 1 → 0 over the
/// last `d` seconds. Layers without a transition are fully opaque.
pub fn transition_opacity(layer: &CompositorLayer, t: f64) -> f64 {
    let Some((_, window)) = transition_window(layer) else {
        return 1.0;
    };
    let elapsed = (t - layer.start_time).clamp(0.0, layer.duration);
    let remaining = layer.duration - elapsed;
    let fade_in = elapsed / window;
    let fade_out = remaining / window;
    fade_in.min(fade_out).clamp(0.0, 1.0)
}

/// Reveal rectangle for a wipe transition at composition time `t`.
///
/// Only applies during the fade-in window; the fade-out half of a wipe is a
/// plain fade. `wipe-left` grows from the right edge, `wipe-right` from the
/// left edge, `wipe-up` from the bottom and `wipe-down` from the top.
pub fn wipe_clip(layer: &CompositorLayer, t: f64, dest: Rect) -> Option<Rect> {
    let (kind, window) = transition_window(layer)?;
    if !kind.is_wipe() {
        return None;
    }
    let elapsed = t - layer.start_time;
    if !(0.0..window).contains(&elapsed) {
        return None;
    }
    let progress = (elapsed / window).clamp(0.0, 1.0);
    let width = dest.width * progress;
    let height = dest.height * progress;
    let rect = match kind {
        TransitionKind::WipeLeft => Rect::new(dest.right() - width, dest.y, width, dest.height),
        TransitionKind::WipeRight => Rect::new(dest.x, dest.y, width, dest.height),
        TransitionKind::WipeUp => Rect::new(dest.x, dest.bottom() - height, dest.width, height),
        TransitionKind::WipeDown => Rect::new(dest.x, dest.y, dest.width, height),
        TransitionKind::Fade | TransitionKind::Dissolve => return None,
    };
    Some(rect)
}

/// What one call to [`LayerCompositor::render_at`] drew.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    /// Layers active at the rendered time.
    pub active: usize,
    /// Layers that produced a draw call.
    pub drawn: usize,
    /// Video layers drawn from their last good frame after a cache miss.
    pub stale: usize,
    /// Video layers with nothing to show yet.
    pub missing: usize,
}

/// Composites timed layers onto a [`Surface`].
pub struct LayerCompositor<S: Surface> {
    surface: S,
    config: CompositorConfig,
    background: Rgba<u8>,
    layers: Vec<CompositorLayer>,
    /// Indices into `layers` in draw order; `None` after any change.
    draw_order: Option<Vec<usize>>,
    frames: Option<Arc<dyn FrameSource>>,
    last_good: HashMap<String, CachedFrame>,
    /// Decoded still images by URL; `None` marks a failed load.
    images: HashMap<String, Option<Arc<RgbaImage>>>,
    media: HashMap<String, Box<dyn MediaElement>>,
    sync_gate: PeriodicGate,
    current_time: f64,
    playing: bool,
    frames_rendered: u64,
}

impl<S: Surface> LayerCompositor<S> {
    pub fn new(surface: S, config: CompositorConfig) -> Self {
        let background = parse_hex_color(&config.background).unwrap_or_else(|| {
            warn!(background = %config.background, "Invalid background color, using black");
            Rgba([0, 0, 0, 255])
        });
        let sync_gate = PeriodicGate::new(Duration::from_millis(config.media_sync_interval_ms));
        Self {
            surface,
            config,
            background,
            layers: Vec::new(),
            draw_order: None,
            frames: None,
            last_good: HashMap::new(),
            images: HashMap::new(),
            media: HashMap::new(),
            sync_gate,
            current_time: 0.0,
            playing: false,
            frames_rendered: 0,
        }
    }

    /// Read video frames from `frames`.
    pub fn with_frame_source(mut self, frames: Arc<dyn FrameSource>) -> Self {
        self.frames = Some(frames);
        self
    }

    pub fn set_frame_source(&mut self, frames: Arc<dyn FrameSource>) {
        self.frames = Some(frames);
        self.last_good.clear();
    }

    /// Replace the whole layer set and render the current time.
    pub fn set_layers(&mut self, layers: Vec<CompositorLayer>) -> RenderStats {
        self.layers = layers;
        self.draw_order = None;
        self.last_good
            .retain(|id, _| self.layers.iter().any(|layer| &layer.id == id));
        debug!(layers = self.layers.len(), "Layer set replaced");
        self.render()
    }

    /// Add a layer, replacing any layer with the same id.
    pub fn add_layer(&mut self, layer: CompositorLayer) {
        self.layers.retain(|existing| existing.id != layer.id);
        self.layers.push(layer);
        self.draw_order = None;
    }

    pub fn remove_layer(&mut self, layer_id: &str) -> bool {
        let before = self.layers.len();
        self.layers.retain(|layer| layer.id != layer_id);
        self.last_good.remove(layer_id);
        let removed = self.layers.len() != before;
        if removed {
            self.draw_order = None;
        }
        removed
    }

    pub fn layers(&self) -> &[CompositorLayer] {
        &self.layers
    }

    /// Draw-order indices, rebuilt if the layer set changed.
    fn draw_order(&mut self) -> &[usize] {
        let layers = &self.layers;
        self.draw_order.get_or_insert_with(|| {
            let mut order: Vec<usize> = (0..layers.len()).collect();
            // Stable sort keeps insertion order among equal z-indices.
            order.sort_by_key(|&i| layers[i].z_index);
            order
        })
    }

    /// Layers active at `t`, in draw order.
    pub fn active_layers(&mut self, t: f64) -> Vec<&CompositorLayer> {
        let order = self.draw_order().to_vec();
        order
            .into_iter()
            .map(|i| &self.layers[i])
            .filter(|layer| is_layer_active(layer, t))
            .collect()
    }

    /// Register a decoded still image for `url` instead of loading it from disk.
    pub fn insert_image(&mut self, url: impl Into<String>, image: RgbaImage) {
        self.images.insert(url.into(), Some(Arc::new(image)));
    }

    fn image_for(&mut self, url: &str) -> Option<Arc<RgbaImage>> {
        self.images
            .entry(url.to_string())
            .or_insert_with(|| {
                let path = url.strip_prefix("file://").unwrap_or(url);
                match image::open(path) {
                    Ok(image) => {
                        debug!(url, "Loaded image layer source");
                        Some(Arc::new(image.to_rgba8()))
                    }
                    Err(e) => {
                        warn!(url, error = %e, "Failed to load image layer source");
                        None
                    }
                }
            })
            .clone()
    }

    /// Attach a media element that follows `layer_id`'s local time.
    pub fn attach_media(&mut self, layer_id: impl Into<String>, element: Box<dyn MediaElement>) {
        self.media.insert(layer_id.into(), element);
    }

    pub fn detach_media(&mut self, layer_id: &str) -> Option<Box<dyn MediaElement>> {
        self.media.remove(layer_id)
    }

    pub fn media(&self, layer_id: &str) -> Option<&dyn MediaElement> {
        self.media.get(layer_id).map(|element| element.as_ref())
    }

    pub fn current_time(&self) -> f64 {
        self.current_time
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn into_surface(self) -> S {
        self.surface
    }

    pub fn config(&self) -> &CompositorConfig {
        &self.config
    }

    /// Render the current time.
    pub fn render(&mut self) -> RenderStats {
        self.render_at(self.current_time)
    }

    /// Draw every layer active at `t`. Never fails: missing sources are
    /// skipped and reported in the returned stats.
    pub fn render_at(&mut self, t: f64) -> RenderStats {
        let (width, height) = self.surface.size();
        let full = Rect::full(width, height);
        let order = self.draw_order().to_vec();
        let mut stats = RenderStats::default();

        self.surface.clear(self.background);
        for index in order {
            let layer = self.layers[index].clone();
            if !is_layer_active(&layer, t) {
                continue;
            }
            stats.active += 1;

            let opacity = layer.base_opacity() * transition_opacity(&layer, t);
            if opacity <= 0.0 {
                continue;
            }
            let dest = layer
                .position
                .map(|p| Rect::new(p.x, p.y, p.width, p.height))
                .unwrap_or(full);
            let clip = wipe_clip(&layer, t, dest);

            match layer.kind {
                LayerKind::Video => {
                    let Some(frame) = self.video_frame(&layer, t, &mut stats) else {
                        stats.missing += 1;
                        continue;
                    };
                    self.surface.draw_image(frame.image(), dest, opacity, clip);
                }
                LayerKind::Image => {
                    let Some(image) = layer.source.as_deref().and_then(|url| self.image_for(url))
                    else {
                        continue;
                    };
                    self.surface.draw_image(&image, dest, opacity, clip);
                }
                LayerKind::Text => {
                    let Some(text) = &layer.text else {
                        continue;
                    };
                    self.surface.draw_text(text, dest, opacity, clip);
                }
            }
            stats.drawn += 1;
        }

        self.frames_rendered += 1;
        trace!(time = t, active = stats.active, drawn = stats.drawn, "Rendered frame");
        stats
    }

    fn video_frame(&mut self, layer: &CompositorLayer, t: f64, stats: &mut RenderStats) -> Option<CachedFrame> {
        let source = layer.source.as_deref()?;
        let local = layer.local_time(t);
        let fresh = self
            .frames
            .as_ref()
            .and_then(|frames| frames.frame_at(source, local));
        match fresh {
            Some(frame) => {
                self.last_good.insert(layer.id.clone(), frame.clone());
                Some(frame)
            }
            None => {
                let stale = self.last_good.get(&layer.id).cloned();
                if stale.is_some() {
                    stats.stale += 1;
                }
                stale
            }
        }
    }

    /// Jump to `time`: render immediately and hard-sync every attached media
    /// element, bypassing the periodic sync throttle.
    pub fn seek(&mut self, time: f64) -> RenderStats {
        let time = if time.is_finite() { time.max(0.0) } else { 0.0 };
        debug!(from = self.current_time, to = time, "Compositor seek");
        self.current_time = time;
        let stats = self.render();
        self.sync_media(true);
        self.sync_gate.reset();
        self.sync_gate.ready(Instant::now());
        stats
    }

    pub fn play(&mut self) {
        self.playing = true;
        self.sync_media(true);
    }

    pub fn pause(&mut self) {
        self.playing = false;
        for element in self.media.values_mut() {
            element.pause();
        }
    }

    /// Advance composited time by `delta` and render. Does nothing while
    /// paused.
    pub fn advance(&mut self, delta: Duration) -> Option<RenderStats> {
        self.advance_at(delta, Instant::now())
    }

    /// [`advance`](Self::advance) with an explicit wall-clock instant for
    /// the periodic media sync.
    pub fn advance_at(&mut self, delta: Duration, now: Instant) -> Option<RenderStats> {
        if !self.playing {
            return None;
        }
        let delta = delta.as_secs_f64();
        self.current_time += delta;
        for element in self.media.values_mut() {
            element.tick(delta);
        }
        let stats = self.render();
        if self.sync_gate.ready(now) {
            self.sync_media(false);
        }
        Some(stats)
    }

    /// Bring attached media in line with composited time. Without `force`,
    /// only elements drifting past the threshold are re-seeked.
    fn sync_media(&mut self, force: bool) {
        let t = self.current_time;
        let threshold = self.config.drift_threshold_secs;
        let playing = self.playing;
        for layer in &self.layers {
            let Some(element) = self.media.get_mut(&layer.id) else {
                continue;
            };
            if !is_layer_active(layer, t) {
                if element.is_playing() {
                    element.pause();
                }
                continue;
            }

            let drift = DriftMeasurement {
                reference_secs: layer.local_time(t),
                measured_secs: element.current_time(),
            };
            if force || drift.exceeds_threshold_secs(threshold) {
                if !force {
                    debug!(
                        layer_id = %layer.id,
                        drift_ms = drift.drift_ms(),
                        "Media element drifted, re-syncing"
                    );
                }
                element.seek(drift.reference_secs);
            }
            if playing && !element.is_playing() {
                element.play();
            } else if !playing && element.is_playing() {
                element.pause();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{DrawCommand, RecordingSurface};
    use cutline_project_model::{LayerPosition, LayerTransition, TextStyle};
    use std::sync::Mutex;

    fn layer(id: &str, kind: LayerKind, start: f64, duration: f64, z: i32) -> CompositorLayer {
        let mut layer = CompositorLayer::new(id, kind, start, duration);
        layer.z_index = z;
        layer.source = Some(id.to_string());
        if kind == LayerKind::Text {
            layer.text = Some(TextStyle {
                content: id.to_string(),
                font_size: 24.0,
                color: "#ffffff".to_string(),
                background_color: None,
            });
        }
        layer
    }

    fn with_transition(mut layer: CompositorLayer, kind: TransitionKind, duration: f64) -> CompositorLayer {
        layer.transition = Some(LayerTransition { kind, duration });
        layer
    }

    fn compositor() -> LayerCompositor<RecordingSurface> {
        LayerCompositor::new(RecordingSurface::new(100, 50), CompositorConfig::default())
    }

    /// Frame source serving one solid frame per source id, with a switch to
    /// simulate cache misses.
    #[derive(Default)]
    struct StubFrames {
        frames: Mutex<HashMap<String, CachedFrame>>,
        requests: Mutex<Vec<(String, f64)>>,
    }

    impl StubFrames {
        fn set(&self, source: &str, value: u8) {
            let image = RgbaImage::from_pixel(2, 2, Rgba([value, value, value, 255]));
            self.frames
                .lock()
                .unwrap()
                .insert(source.to_string(), CachedFrame::new(image, 0.0));
        }

        fn clear(&self) {
            self.frames.lock().unwrap().clear();
        }
    }

    impl FrameSource for StubFrames {
        fn frame_at(&self, source_id: &str, time: f64) -> Option<CachedFrame> {
            self.requests.lock().unwrap().push((source_id.to_string(), time));
            self.frames.lock().unwrap().get(source_id).cloned()
        }
    }

    struct FakeMedia {
        position: f64,
        playing: bool,
        seeks: Arc<Mutex<Vec<f64>>>,
    }

    impl MediaElement for FakeMedia {
        fn current_time(&self) -> f64 {
            self.position
        }
        fn seek(&mut self, time: f64) {
            self.position = time;
            self.seeks.lock().unwrap().push(time);
        }
        fn play(&mut self) {
            self.playing = true;
        }
        fn pause(&mut self) {
            self.playing = false;
        }
        fn is_playing(&self) -> bool {
            self.playing
        }
    }

    fn fake_media(position: f64) -> (Box<dyn MediaElement>, Arc<Mutex<Vec<f64>>>) {
        let seeks = Arc::new(Mutex::new(Vec::new()));
        let media = FakeMedia {
            position,
            playing: false,
            seeks: seeks.clone(),
        };
        (Box::new(media), seeks)
    }

    fn drawn_texts(surface: &RecordingSurface) -> Vec<String> {
        surface
            .last_frame()
            .iter()
            .filter_map(|command| match command {
                DrawCommand::Text { content, .. } => Some(content.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_transition_opacity_ramps() {
        let layer = with_transition(layer("a", LayerKind::Text, 10.0, 4.0, 0), TransitionKind::Fade, 1.0);
        assert_eq!(transition_opacity(&layer, 10.0), 0.0);
        assert!((transition_opacity(&layer, 10.5) - 0.5).abs() < 1e-12);
        assert_eq!(transition_opacity(&layer, 11.0), 1.0);
        assert_eq!(transition_opacity(&layer, 13.0), 1.0);
        assert!((transition_opacity(&layer, 13.5) - 0.5).abs() < 1e-12);
        assert_eq!(transition_opacity(&layer, 14.0), 0.0);

        let plain = self::layer("b", LayerKind::Text, 0.0, 4.0, 0);
        assert_eq!(transition_opacity(&plain, 0.0), 1.0);
    }

    #[test]
    fn test_wipe_clip_only_during_fade_in() {
        let layer = with_transition(layer("a", LayerKind::Image, 0.0, 4.0, 0), TransitionKind::WipeRight, 1.0);
        let dest = Rect::new(0.0, 0.0, 100.0, 50.0);
        assert_eq!(wipe_clip(&layer, 0.5, dest), Some(Rect::new(0.0, 0.0, 50.0, 50.0)));
        assert_eq!(wipe_clip(&layer, 2.0, dest), None);
        // The fade-out half is a plain fade: no clip even though opacity ramps.
        assert_eq!(wipe_clip(&layer, 3.5, dest), None);
        assert!(transition_opacity(&layer, 3.5) < 1.0);
    }

    #[test]
    fn test_wipe_directions_anchor_on_opposite_edges() {
        let dest = Rect::new(10.0, 10.0, 100.0, 40.0);
        let at = |kind| {
            let layer = with_transition(layer("a", LayerKind::Image, 0.0, 4.0, 0), kind, 1.0);
            wipe_clip(&layer, 0.25, dest).unwrap()
        };
        assert_eq!(at(TransitionKind::WipeLeft), Rect::new(85.0, 10.0, 25.0, 40.0));
        assert_eq!(at(TransitionKind::WipeRight), Rect::new(10.0, 10.0, 25.0, 40.0));
        assert_eq!(at(TransitionKind::WipeUp), Rect::new(10.0, 40.0, 100.0, 10.0));
        assert_eq!(at(TransitionKind::WipeDown), Rect::new(10.0, 10.0, 100.0, 10.0));
    }

    #[test]
    fn test_set_layers_renders_immediately_in_z_order() {
        let mut compositor = compositor();
        compositor.set_layers(vec![
            layer("top", LayerKind::Text, 0.0, 5.0, 10),
            layer("bottom", LayerKind::Text, 0.0, 5.0, -1),
            layer("middle", LayerKind::Text, 0.0, 5.0, 3),
            layer("later", LayerKind::Text, 6.0, 5.0, 0),
        ]);
        assert_eq!(compositor.surface().frames(), 1);
        assert_eq!(drawn_texts(compositor.surface()), vec!["bottom", "middle", "top"]);
    }

    #[test]
    fn test_draw_order_invalidated_on_add_and_remove() {
        let mut compositor = compositor();
        compositor.set_layers(vec![layer("a", LayerKind::Text, 0.0, 5.0, 1)]);
        compositor.add_layer(layer("b", LayerKind::Text, 0.0, 5.0, 0));
        compositor.render();
        assert_eq!(drawn_texts(compositor.surface()), vec!["b", "a"]);

        assert!(compositor.remove_layer("b"));
        assert!(!compositor.remove_layer("b"));
        compositor.render();
        assert_eq!(drawn_texts(compositor.surface()), vec!["a"]);
    }

    #[test]
    fn test_video_layer_uses_local_time_and_last_good_frame() {
        let frames = Arc::new(StubFrames::default());
        frames.set("clip", 200);
        let mut clip = layer("clip", LayerKind::Video, 2.0, 5.0, 0);
        clip.trim = Some(cutline_project_model::TrimRange { start: 1.0, end: None });
        clip.speed = Some(2.0);
        clip.position = Some(LayerPosition {
            x: 0.0,
            y: 0.0,
            width: 10.0,
            height: 10.0,
        });

        let mut compositor = compositor().with_frame_source(frames.clone());
        compositor.set_layers(vec![clip]);
        let stats = compositor.render_at(3.0);
        assert_eq!(stats.drawn, 1);
        let (_, requested) = frames.requests.lock().unwrap().last().cloned().unwrap();
        assert!((requested - 3.0).abs() < 1e-12, "1.0 + (3.0 - 2.0) * 2.0");

        frames.clear();
        let stats = compositor.render_at(3.1);
        assert_eq!(stats.stale, 1);
        assert!(matches!(
            compositor.surface().last_frame().last(),
            Some(DrawCommand::Image { first_pixel: Some(Rgba([200, 200, 200, 255])), .. })
        ));
    }

    #[test]
    fn test_video_layer_without_frames_is_skipped() {
        let mut compositor = compositor().with_frame_source(Arc::new(StubFrames::default()));
        let stats = compositor.set_layers(vec![layer("clip", LayerKind::Video, 0.0, 5.0, 0)]);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.missing, 1);
        assert_eq!(stats.drawn, 0);
    }

    #[test]
    fn test_image_layer_load_failure_is_cached() {
        let mut compositor = compositor();
        let mut still = layer("still", LayerKind::Image, 0.0, 5.0, 0);
        still.source = Some("/nonexistent/cutline-image.png".to_string());
        let stats = compositor.set_layers(vec![still.clone()]);
        assert_eq!(stats.drawn, 0);

        compositor.insert_image("mem://logo", RgbaImage::from_pixel(3, 3, Rgba([1, 2, 3, 255])));
        still.source = Some("mem://logo".to_string());
        let stats = compositor.set_layers(vec![still]);
        assert_eq!(stats.drawn, 1);
    }

    #[test]
    fn test_advance_only_while_playing() {
        let mut compositor = compositor();
        compositor.set_layers(vec![layer("a", LayerKind::Text, 0.0, 5.0, 0)]);
        assert!(compositor.advance(Duration::from_millis(100)).is_none());
        assert_eq!(compositor.current_time(), 0.0);

        compositor.play();
        compositor.advance(Duration::from_millis(100)).unwrap();
        assert!((compositor.current_time() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_media_sync_is_periodic_and_thresholded() {
        let start = Instant::now();
        let mut compositor = compositor();
        compositor.set_layers(vec![layer("clip", LayerKind::Video, 0.0, 10.0, 0)]);
        let (media, seeks) = fake_media(0.0);
        compositor.attach_media("clip", media);
        compositor.play();
        assert_eq!(seeks.lock().unwrap().len(), 1, "play hard-syncs");

        // Media clock stands still while composited time runs: drift grows.
        compositor.advance_at(Duration::from_millis(300), start);
        assert_eq!(seeks.lock().unwrap().len(), 1, "0.3s drift is under threshold");

        compositor.advance_at(Duration::from_millis(300), start + Duration::from_millis(50));
        assert_eq!(seeks.lock().unwrap().len(), 1, "gate closed within 100ms");

        compositor.advance_at(Duration::from_millis(10), start + Duration::from_millis(150));
        let seeks = seeks.lock().unwrap();
        assert_eq!(seeks.len(), 2);
        assert!((seeks[1] - 0.61).abs() < 1e-9);
    }

    #[test]
    fn test_seek_hard_syncs_and_pauses_inactive_media() {
        let mut compositor = compositor();
        compositor.set_layers(vec![
            layer("a", LayerKind::Video, 0.0, 2.0, 0),
            layer("b", LayerKind::Video, 2.0, 2.0, 0),
        ]);
        let (media_a, seeks_a) = fake_media(0.0);
        let (media_b, seeks_b) = fake_media(0.0);
        compositor.attach_media("a", media_a);
        compositor.attach_media("b", media_b);
        compositor.play();

        compositor.seek(2.1);
        assert_eq!(compositor.surface().frames(), 2);
        assert!((seeks_b.lock().unwrap().last().unwrap() - 0.1).abs() < 1e-9);
        assert_eq!(seeks_a.lock().unwrap().len(), 1);
        assert!(!compositor.media("a").unwrap().is_playing());
        assert!(compositor.media("b").unwrap().is_playing());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn transition_opacity_is_continuous_with_fixed_ends(
                start in 0.0f64..100.0,
                duration in 0.5f64..30.0,
                ratio in 0.01f64..0.49,
                samples in 50usize..200,
            ) {
                let d = duration * ratio;
                let layer = with_transition(
                    layer("p", LayerKind::Image, start, duration, 0),
                    TransitionKind::Dissolve,
                    d,
                );
                prop_assert_eq!(transition_opacity(&layer, start), 0.0);
                prop_assert!(transition_opacity(&layer, start + duration).abs() < 1e-9);
                prop_assert!((transition_opacity(&layer, start + d) - 1.0).abs() < 1e-9);
                prop_assert!((transition_opacity(&layer, start + duration - d) - 1.0).abs() < 1e-9);

                let step = duration / samples as f64;
                let mut previous = transition_opacity(&layer, start);
                for i in 1..=samples {
                    let t = start + i as f64 * step;
                    let value = transition_opacity(&layer, t);
                    prop_assert!((0.0..=1.0).contains(&value));
                    // Slope is at most 1/d.
                    prop_assert!((value - previous).abs() <= step / d + 1e-9);
                    if t >= start + d && t <= start + duration - d {
                        prop_assert!((value - 1.0).abs() < 1e-9);
                    }
                    previous = value;
                }
            }
        }
    }
}
