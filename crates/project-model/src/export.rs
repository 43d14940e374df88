//! Export job status.
//!
//! One `ExportJob` exists per export invocation. It moves through
//! `preparing → rendering/encoding → muxing → finalizing → complete`, and
//! can reach `error` from any non-terminal phase.

use serde::{Deserialize, Serialize};

/// Phases of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportPhase {
    Preparing,
    Rendering,
    Encoding,
    Muxing,
    Finalizing,
    Complete,
    Error,
}

impl ExportPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExportPhase::Complete | ExportPhase::Error)
    }

    fn rank(self) -> u8 {
        match self {
            ExportPhase::Preparing => 0,
            // Rendering and encoding interleave per frame.
            ExportPhase::Rendering | ExportPhase::Encoding => 1,
            ExportPhase::Muxing => 2,
            ExportPhase::Finalizing => 3,
            ExportPhase::Complete => 4,
            ExportPhase::Error => 5,
        }
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_advance_to(self, next: ExportPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == ExportPhase::Error {
            return true;
        }
        next.rank() >= self.rank() && next.rank() <= self.rank() + 1
    }
}

/// Status of a single export invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJob {
    pub phase: ExportPhase,

    /// Overall progress in `0..=100`.
    pub progress: f64,

    pub current_frame: u64,

    pub total_frames: u64,

    /// Human-readable status the host UI can show verbatim.
    pub message: String,
}

impl ExportJob {
    pub fn new(total_frames: u64) -> Self {
        Self {
            phase: ExportPhase::Preparing,
            progress: 0.0,
            current_frame: 0,
            total_frames,
            message: "Preparing export".to_string(),
        }
    }

    /// Move to `phase` with a new message and progress.
    ///
    /// Illegal transitions (including any transition out of a terminal
    /// phase) are ignored and return false. Progress never decreases.
    pub fn advance(&mut self, phase: ExportPhase, progress: f64, message: impl Into<String>) -> bool {
        if !self.phase.can_advance_to(phase) {
            return false;
        }
        self.phase = phase;
        if phase != ExportPhase::Error {
            self.progress = progress.clamp(self.progress, 100.0);
        }
        self.message = message.into();
        true
    }

    /// Record the frame counter without changing phase.
    pub fn set_frame(&mut self, current_frame: u64) {
        self.current_frame = current_frame.min(self.total_frames);
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.advance(ExportPhase::Error, self.progress, message);
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut job = ExportJob::new(270);
        assert!(job.advance(ExportPhase::Rendering, 1.0, "Rendering frame 1/270"));
        assert!(job.advance(ExportPhase::Encoding, 2.0, "Encoding frame 1/270"));
        assert!(job.advance(ExportPhase::Rendering, 3.0, "Rendering frame 2/270"));
        assert!(job.advance(ExportPhase::Muxing, 85.0, "Muxing"));
        assert!(job.advance(ExportPhase::Finalizing, 95.0, "Finalizing"));
        assert!(job.advance(ExportPhase::Complete, 100.0, "Done"));
        assert!(job.is_terminal());
    }

    #[test]
    fn test_terminal_phase_is_sticky() {
        let mut job = ExportJob::new(10);
        job.fail("encoder unsupported");
        assert_eq!(job.phase, ExportPhase::Error);
        assert!(!job.advance(ExportPhase::Complete, 100.0, "nope"));
        assert_eq!(job.message, "encoder unsupported");
    }

    #[test]
    fn test_cannot_skip_phases() {
        let mut job = ExportJob::new(10);
        assert!(!job.advance(ExportPhase::Complete, 100.0, "skip"));
        assert!(!job.advance(ExportPhase::Finalizing, 90.0, "skip"));
        assert_eq!(job.phase, ExportPhase::Preparing);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut job = ExportJob::new(10);
        job.advance(ExportPhase::Rendering, 40.0, "a");
        job.advance(ExportPhase::Encoding, 20.0, "b");
        assert_eq!(job.progress, 40.0);
    }
}
