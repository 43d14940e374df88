//! Error types shared across Cutline crates.

use std::path::PathBuf;

/// Top-level error type for Cutline operations.
#[derive(Debug, thiserror::Error)]
pub enum CutlineError {
    #[error("Decode error: {message}")]
    Decode { message: String },

    #[error("Frame cache error: {message}")]
    Cache { message: String },

    #[error("Render error: {message}")]
    Render { message: String },

    #[error("Encode error: {message}")]
    Encode { message: String },

    #[error("Mux error: {message}")]
    Mux { message: String },

    #[error("Audio error: {message}")]
    Audio { message: String },

    #[error("Export error: {message}")]
    Export { message: String },

    #[error("API error: {message}")]
    Api { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Unsupported: {message}")]
    Unsupported { message: String },

    #[error("Export already in progress")]
    ExportInProgress,

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using CutlineError.
pub type CutlineResult<T> = Result<T, CutlineError>;

impl CutlineError {
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode {
            message: msg.into(),
        }
    }

    pub fn cache(msg: impl Into<String>) -> Self {
        Self::Cache {
            message: msg.into(),
        }
    }

    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render {
            message: msg.into(),
        }
    }

    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode {
            message: msg.into(),
        }
    }

    pub fn mux(msg: impl Into<String>) -> Self {
        Self::Mux {
            message: msg.into(),
        }
    }

    pub fn audio(msg: impl Into<String>) -> Self {
        Self::Audio {
            message: msg.into(),
        }
    }

    pub fn export(msg: impl Into<String>) -> Self {
        Self::Export {
            message: msg.into(),
        }
    }

    pub fn api(msg: impl Into<String>) -> Self {
        Self::Api {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported {
            message: msg.into(),
        }
    }

    /// Cancellation is a control-flow signal rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether the error was raised by a capability pre-flight check.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructor_messages() {
        let err = CutlineError::decode("bad packet");
        assert_eq!(err.to_string(), "Decode error: bad packet");

        let err = CutlineError::unsupported("codec avc1.640034");
        assert!(err.is_unsupported());
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_cancelled_is_not_unsupported() {
        let err = CutlineError::Cancelled;
        assert!(err.is_cancelled());
        assert!(!err.is_unsupported());
        assert_eq!(err.to_string(), "Operation cancelled");
    }
}
