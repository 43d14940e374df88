//! Self-pacing render loop.
//!
//! A tokio task wakes at display refresh rate and asks a [`FrameThrottle`]
//! whether a frame is due at the target fps. Time only advances on rendered
//! frames, so skipped wake-ups never push the compositor's clock ahead.
//! While the surface is hidden the loop keeps waking but renders nothing.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use cutline_common::clock::FrameThrottle;

use crate::compositor::LayerCompositor;
use crate::surface::Surface;

/// Wake-up period of the loop, standing in for a 60 Hz display callback.
pub const DISPLAY_REFRESH: Duration = Duration::from_micros(16_667);

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counters shared with the loop task.
#[derive(Debug, Default)]
pub struct LoopStats {
    ticks: AtomicU64,
    rendered: AtomicU64,
    hidden: AtomicU64,
}

impl LoopStats {
    /// Wake-ups seen by the loop.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Wake-ups that produced a frame.
    pub fn rendered(&self) -> u64 {
        self.rendered.load(Ordering::Relaxed)
    }

    /// Wake-ups skipped because the surface was hidden.
    pub fn hidden(&self) -> u64 {
        self.hidden.load(Ordering::Relaxed)
    }
}

/// Drives a shared compositor at a target frame rate.
pub struct RenderLoop<S: Surface + 'static> {
    compositor: Arc<Mutex<LayerCompositor<S>>>,
    target_fps: u32,
    visible: Arc<AtomicBool>,
    stats: Arc<LoopStats>,
    task: Option<JoinHandle<()>>,
}

impl<S: Surface + 'static> RenderLoop<S> {
    pub fn new(compositor: Arc<Mutex<LayerCompositor<S>>>, target_fps: u32) -> Self {
        Self {
            compositor,
            target_fps: target_fps.max(1),
            visible: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(LoopStats::default()),
            task: None,
        }
    }

    pub fn compositor(&self) -> &Arc<Mutex<LayerCompositor<S>>> {
        &self.compositor
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn is_playing(&self) -> bool {
        self.task.is_some()
    }

    /// Page visibility. Hidden loops skip rendering entirely.
    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
    }

    /// Start playback. Must be called from within a tokio runtime.
    pub fn play(&mut self) {
        if self.task.is_some() {
            return;
        }
        lock(&self.compositor).play();

        let compositor = self.compositor.clone();
        let visible = self.visible.clone();
        let stats = self.stats.clone();
        let target_fps = self.target_fps;
        self.task = Some(tokio::spawn(async move {
            let mut throttle = FrameThrottle::new(target_fps);
            let mut ticker = tokio::time::interval(DISPLAY_REFRESH);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                stats.ticks.fetch_add(1, Ordering::Relaxed);
                if !visible.load(Ordering::SeqCst) {
                    // Coming back must not replay the hidden span as one delta.
                    throttle.reset();
                    stats.hidden.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                if let Some(delta) = throttle.should_render(Instant::now()) {
                    lock(&compositor).advance(delta);
                    stats.rendered.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
        info!(fps = target_fps, "Render loop started");
    }

    /// Stop playback. The scheduled wake-up is cancelled before this returns,
    /// so no further frame is drawn.
    pub fn pause(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            lock(&self.compositor).pause();
            debug!(rendered = self.stats.rendered(), "Render loop paused");
        }
    }

    /// Jump to `time` and render it, playing or not.
    pub fn seek(&mut self, time: f64) {
        lock(&self.compositor).seek(time);
    }
}

impl<S: Surface + 'static> Drop for RenderLoop<S> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
