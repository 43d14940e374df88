//! Messages exchanged between the decode coordinator and its worker.
//!
//! Requests flow coordinator → worker, events flow worker → coordinator,
//! both over bounded channels. Requests are validated when they reach the
//! worker; a malformed request becomes an [`WorkerEvent::Error`] instead of
//! being processed.

use std::collections::{HashMap, HashSet};
use std::fmt;

use cutline_common::error::{CutlineError, CutlineResult};
use cutline_project_model::{BufferItem, SourceId, VideoMetadata};

use crate::cache::TimeKey;
use crate::frame::PooledFrame;
use crate::object_url::ObjectHandle;

/// Coordinator → worker.
#[derive(Debug, Clone)]
pub enum WorkerRequest {
    /// Open and probe a source.
    Load { source_id: SourceId, url: String },

    /// Decode the frame at `time` (source seconds).
    Seek { source_id: SourceId, time: f64 },

    /// Pre-decode a window around composition time `time`.
    Buffer {
        time: f64,
        items: Vec<BufferItem>,
        /// Keys the cache already holds, per source.
        cached: HashMap<SourceId, HashSet<TimeKey>>,
    },

    /// Forget a source and close its decoder.
    Destroy { source_id: SourceId },

    /// Stop the worker.
    Shutdown,
}

impl WorkerRequest {
    /// Source the request concerns, if any.
    pub fn source_id(&self) -> Option<&str> {
        match self {
            WorkerRequest::Load { source_id, .. }
            | WorkerRequest::Seek { source_id, .. }
            | WorkerRequest::Destroy { source_id } => Some(source_id),
            WorkerRequest::Buffer { .. } | WorkerRequest::Shutdown => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkerRequest::Load { .. } => "load",
            WorkerRequest::Seek { .. } => "seek",
            WorkerRequest::Buffer { .. } => "buffer",
            WorkerRequest::Destroy { .. } => "destroy",
            WorkerRequest::Shutdown => "shutdown",
        }
    }

    /// Check ids and times before the worker acts on the request.
    pub fn validate(&self) -> CutlineResult<()> {
        match self {
            WorkerRequest::Load { source_id, url } => {
                check_id(source_id)?;
                if url.trim().is_empty() {
                    return Err(CutlineError::decode(format!(
                        "Load request for {source_id} has an empty URL"
                    )));
                }
            }
            WorkerRequest::Seek { source_id, time } => {
                check_id(source_id)?;
                check_time("seek time", *time)?;
            }
            WorkerRequest::Buffer { time, items, .. } => {
                check_time("buffer time", *time)?;
                for item in items {
                    check_id(&item.id)?;
                    check_time("item start", item.start_time)?;
                    check_time("item duration", item.duration)?;
                    if !(item.speed.is_finite() && item.speed > 0.0) {
                        return Err(CutlineError::decode(format!(
                            "Buffer item {} has invalid speed {}",
                            item.id, item.speed
                        )));
                    }
                }
            }
            WorkerRequest::Destroy { source_id } => check_id(source_id)?,
            WorkerRequest::Shutdown => {}
        }
        Ok(())
    }
}

fn check_id(id: &str) -> CutlineResult<()> {
    if id.trim().is_empty() {
        return Err(CutlineError::decode("Request has an empty source id"));
    }
    Ok(())
}

fn check_time(what: &str, value: f64) -> CutlineResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(CutlineError::decode(format!("Invalid {what}: {value}")));
    }
    Ok(())
}

/// Worker → coordinator.
pub enum WorkerEvent {
    Loaded {
        source_id: SourceId,
        metadata: VideoMetadata,
    },
    Frame {
        source_id: SourceId,
        frame: PooledFrame,
        timestamp: f64,
    },
    Progress {
        source_id: SourceId,
        percent: f64,
    },
    /// An empty `source_id` marks a failure not tied to one source.
    Error {
        source_id: SourceId,
        message: String,
    },
    ObjectHandleReady {
        source_id: SourceId,
        handle: ObjectHandle,
    },
}

impl WorkerEvent {
    pub fn source_id(&self) -> &str {
        match self {
            WorkerEvent::Loaded { source_id, .. }
            | WorkerEvent::Frame { source_id, .. }
            | WorkerEvent::Progress { source_id, .. }
            | WorkerEvent::Error { source_id, .. }
            | WorkerEvent::ObjectHandleReady { source_id, .. } => source_id,
        }
    }

    pub fn error(source_id: impl Into<SourceId>, message: impl Into<String>) -> Self {
        WorkerEvent::Error {
            source_id: source_id.into(),
            message: message.into(),
        }
    }
}

impl fmt::Debug for WorkerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerEvent::Loaded { source_id, metadata } => f
                .debug_struct("Loaded")
                .field("source_id", source_id)
                .field("metadata", metadata)
                .finish(),
            WorkerEvent::Frame {
                source_id,
                frame,
                timestamp,
            } => f
                .debug_struct("Frame")
                .field("source_id", source_id)
                .field("size", &(frame.width(), frame.height()))
                .field("timestamp", timestamp)
                .finish(),
            WorkerEvent::Progress { source_id, percent } => f
                .debug_struct("Progress")
                .field("source_id", source_id)
                .field("percent", percent)
                .finish(),
            WorkerEvent::Error { source_id, message } => f
                .debug_struct("Error")
                .field("source_id", source_id)
                .field("message", message)
                .finish(),
            WorkerEvent::ObjectHandleReady { source_id, handle } => f
                .debug_struct("ObjectHandleReady")
                .field("source_id", source_id)
                .field("handle", handle)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, speed: f64) -> BufferItem {
        BufferItem {
            id: id.to_string(),
            start_time: 0.0,
            duration: 2.0,
            trim: None,
            speed,
        }
    }

    #[test]
    fn test_valid_requests_pass() {
        let requests = [
            WorkerRequest::Load {
                source_id: "a".into(),
                url: "clip.mp4".into(),
            },
            WorkerRequest::Seek {
                source_id: "a".into(),
                time: 1.5,
            },
            WorkerRequest::Buffer {
                time: 0.0,
                items: vec![item("a", 1.0)],
                cached: HashMap::new(),
            },
            WorkerRequest::Destroy {
                source_id: "a".into(),
            },
            WorkerRequest::Shutdown,
        ];
        for request in &requests {
            assert!(request.validate().is_ok(), "{}", request.kind());
        }
    }

    #[test]
    fn test_invalid_requests_rejected() {
        let bad = [
            WorkerRequest::Load {
                source_id: " ".into(),
                url: "clip.mp4".into(),
            },
            WorkerRequest::Load {
                source_id: "a".into(),
                url: String::new(),
            },
            WorkerRequest::Seek {
                source_id: "a".into(),
                time: f64::NAN,
            },
            WorkerRequest::Seek {
                source_id: "a".into(),
                time: -0.5,
            },
            WorkerRequest::Buffer {
                time: 1.0,
                items: vec![item("a", 0.0)],
                cached: HashMap::new(),
            },
        ];
        for request in &bad {
            assert!(request.validate().is_err(), "{} should fail", request.kind());
        }
    }

    #[test]
    fn test_source_id_accessor() {
        let request = WorkerRequest::Seek {
            source_id: "clip-1".into(),
            time: 0.0,
        };
        assert_eq!(request.source_id(), Some("clip-1"));
        assert_eq!(WorkerRequest::Shutdown.source_id(), None);
        assert_eq!(WorkerEvent::error("x", "boom").source_id(), "x");
    }
}
