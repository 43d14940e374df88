//! Clock and timing utilities for the playback and export paths.
//!
//! - Conversions between seconds and encoder-native microseconds
//! - Frame throttling for the render loop
//! - Drift measurement between composited time and media elements
//! - Periodic gates and rate-limited diagnostics owned per instance

use std::time::{Duration, Instant};

/// Microseconds per second (encoder-native time unit).
pub const MICROS_PER_SEC: f64 = 1_000_000.0;

/// Convert seconds to encoder-native microseconds.
pub fn secs_to_micros(secs: f64) -> i64 {
    (secs * MICROS_PER_SEC).round() as i64
}

/// Convert encoder-native microseconds to seconds.
pub fn micros_to_secs(us: i64) -> f64 {
    us as f64 / MICROS_PER_SEC
}

/// Timestamp of frame `index` at `fps`, in microseconds.
pub fn frame_timestamp_micros(index: u64, fps: u32) -> i64 {
    secs_to_micros(index as f64 / fps.max(1) as f64)
}

/// Duration of one frame at `fps`, in microseconds.
pub fn frame_duration_micros(fps: u32) -> i64 {
    secs_to_micros(1.0 / fps.max(1) as f64)
}

/// Throttles a per-display-frame callback down to a target render rate.
///
/// Callbacks that arrive before a full frame interval has elapsed since the
/// last rendered frame are skipped. The elapsed time is only handed out when
/// a frame is actually rendered, so a clock advanced by the returned deltas
/// never runs ahead during skipped callbacks.
#[derive(Debug)]
pub struct FrameThrottle {
    target_interval: Duration,
    last_render: Option<Instant>,
}

impl FrameThrottle {
    /// Create a throttle targeting the given render rate.
    pub fn new(target_fps: u32) -> Self {
        Self {
            target_interval: Duration::from_secs_f64(1.0 / target_fps.max(1) as f64),
            last_render: None,
        }
    }

    /// Decide whether to render at `now`.
    ///
    /// Returns the delta since the previous rendered frame when the frame
    /// should be rendered. The first call renders with a zero delta.
    pub fn should_render(&mut self, now: Instant) -> Option<Duration> {
        match self.last_render {
            None => {
                self.last_render = Some(now);
                Some(Duration::ZERO)
            }
            Some(last) => {
                let elapsed = now.saturating_duration_since(last);
                if elapsed >= self.target_interval {
                    self.last_render = Some(now);
                    Some(elapsed)
                } else {
                    None
                }
            }
        }
    }

    /// Forget the last rendered instant (used when playback restarts).
    pub fn reset(&mut self) {
        self.last_render = None;
    }

    /// Target interval between rendered frames.
    pub fn interval(&self) -> Duration {
        self.target_interval
    }
}

/// Drift between composited time and a media element's own clock.
#[derive(Debug, Clone, Copy)]
pub struct DriftMeasurement {
    /// Composited (reference) time in seconds.
    pub reference_secs: f64,
    /// Media element time in seconds.
    pub measured_secs: f64,
}

impl DriftMeasurement {
    /// Drift in seconds (positive = measured is ahead).
    pub fn drift_secs(&self) -> f64 {
        self.measured_secs - self.reference_secs
    }

    /// Drift in milliseconds.
    pub fn drift_ms(&self) -> f64 {
        self.drift_secs() * 1000.0
    }

    /// Whether drift exceeds an acceptable threshold.
    pub fn exceeds_threshold_secs(&self, threshold_secs: f64) -> bool {
        self.drift_secs().abs() > threshold_secs
    }
}

/// Opens at most once per interval. The first check always opens.
#[derive(Debug)]
pub struct PeriodicGate {
    interval: Duration,
    last_open: Option<Instant>,
}

impl PeriodicGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_open: None,
        }
    }

    /// Returns true and re-arms if the interval has elapsed at `now`.
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last_open {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_open = Some(now);
                true
            }
        }
    }

    /// Force the next check to open.
    pub fn reset(&mut self) {
        self.last_open = None;
    }
}

/// Rate limiter for repetitive diagnostics.
///
/// Owned by the component that logs, never shared globally. Counts the
/// events suppressed since the last emitted line so the next line can
/// report them.
#[derive(Debug)]
pub struct LogThrottle {
    gate: PeriodicGate,
    suppressed: u64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            gate: PeriodicGate::new(interval),
            suppressed: 0,
        }
    }

    /// Returns `Some(suppressed_count)` when a line may be emitted at `now`.
    pub fn check(&mut self, now: Instant) -> Option<u64> {
        if self.gate.ready(now) {
            let suppressed = self.suppressed;
            self.suppressed = 0;
            Some(suppressed)
        } else {
            self.suppressed += 1;
            None
        }
    }
}
