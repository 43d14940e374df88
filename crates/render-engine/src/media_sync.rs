//! Media elements kept in step with composited time.
//!
//! A media element runs its own clock (an audio output, a decode source being
//! played back). The compositor only corrects it when it drifts too far from
//! the layer's local time; see [`crate::compositor::LayerCompositor`].

use std::sync::Arc;

use tracing::trace;

use cutline_decode_engine::DecodeCoordinator;

/// Playable media attached to a compositor layer.
pub trait MediaElement: Send {
    /// The element's own position in source seconds.
    fn current_time(&self) -> f64;

    /// Jump to `time` source seconds.
    fn seek(&mut self, time: f64);

    fn play(&mut self);

    fn pause(&mut self);

    fn is_playing(&self) -> bool;

    /// Advance the element's own clock by `delta` wall seconds.
    fn tick(&mut self, _delta: f64) {}
}

/// A decode-coordinator source played back as a media element.
///
/// Seeks are forwarded to the coordinator as seek hints so the worker starts
/// decoding around the new position.
pub struct DecodeSourceElement {
    coordinator: Arc<DecodeCoordinator>,
    source_id: String,
    position: f64,
    rate: f64,
    playing: bool,
}

impl DecodeSourceElement {
    pub fn new(coordinator: Arc<DecodeCoordinator>, source_id: impl Into<String>) -> Self {
        Self {
            coordinator,
            source_id: source_id.into(),
            position: 0.0,
            rate: 1.0,
            playing: false,
        }
    }

    /// Clock rate relative to wall time.
    pub fn with_rate(mut self, rate: f64) -> Self {
        if rate.is_finite() && rate > 0.0 {
            self.rate = rate;
        }
        self
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }
}

impl MediaElement for DecodeSourceElement {
    fn current_time(&self) -> f64 {
        self.position
    }

    fn seek(&mut self, time: f64) {
        let time = match self.coordinator.metadata(&self.source_id) {
            Some(metadata) => metadata.clamp_time(time),
            None => time.max(0.0),
        };
        trace!(source_id = %self.source_id, from = self.position, to = time, "Media element seek");
        self.position = time;
        self.coordinator.seek_video(&self.source_id, time);
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

    fn tick(&mut self, delta: f64) {
        if self.playing {
            self.position += delta * self.rate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cutline_common::config::EngineConfig;
    use cutline_decode_engine::SyntheticDecoderFactory;

    #[tokio::test]
    async fn test_clock_only_runs_while_playing() {
        let coordinator = Arc::new(DecodeCoordinator::new(
            Arc::new(SyntheticDecoderFactory::new()),
            EngineConfig::default(),
        ));
        coordinator.load_video("v", "synthetic://4x4@30/5").await.unwrap();

        let mut element = DecodeSourceElement::new(coordinator.clone(), "v").with_rate(1.5);
        element.tick(1.0);
        assert_eq!(element.current_time(), 0.0);

        element.play();
        element.tick(1.0);
        assert!((element.current_time() - 1.5).abs() < 1e-12);

        element.seek(9.0);
        assert_eq!(element.current_time(), 5.0, "seek clamps to the source duration");
        coordinator.destroy().await;
    }
}
