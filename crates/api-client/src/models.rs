//! Wire types of the generation and export-status endpoints.

use serde::{Deserialize, Serialize};

/// A status that polling can stop on.
pub trait Terminal {
    fn is_terminal(&self) -> bool;
}

/// Server-side export state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportStatus {
    Processing,
    Completed,
    Failed,
}

/// `GET /export/{jobId}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportStatusResponse {
    pub status: ExportStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Terminal for ExportStatusResponse {
    fn is_terminal(&self) -> bool {
        self.status != ExportStatus::Processing
    }
}

/// Kinds of media the generation API produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationKind {
    Video,
    Image,
    Music,
    Voice,
}

impl GenerationKind {
    /// Path segment of `POST /generate/{kind}`.
    pub fn as_str(self) -> &'static str {
        match self {
            GenerationKind::Video => "video",
            GenerationKind::Image => "image",
            GenerationKind::Music => "music",
            GenerationKind::Voice => "voice",
        }
    }
}

impl std::str::FromStr for GenerationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "video" => Ok(GenerationKind::Video),
            "image" => Ok(GenerationKind::Image),
            "music" => Ok(GenerationKind::Music),
            "voice" => Ok(GenerationKind::Voice),
            other => Err(format!("unknown generation kind: {other}")),
        }
    }
}

/// Body of `POST /generate/{kind}`. Extra fields pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,

    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            options: serde_json::Map::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSubmitted {
    pub generation_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationState {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// `GET /generations/{id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStatus {
    pub status: GenerationState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Terminal for GenerationStatus {
    fn is_terminal(&self) -> bool {
        matches!(self.status, GenerationState::Completed | GenerationState::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_status_parsing() {
        let done: ExportStatusResponse =
            serde_json::from_str(r#"{"status":"completed","downloadUrl":"https://cdn/x.mp4"}"#).unwrap();
        assert!(done.is_terminal());
        assert_eq!(done.download_url.as_deref(), Some("https://cdn/x.mp4"));

        let running: ExportStatusResponse = serde_json::from_str(r#"{"status":"processing"}"#).unwrap();
        assert!(!running.is_terminal());

        let failed: ExportStatusResponse =
            serde_json::from_str(r#"{"status":"failed","error":"encoder crashed"}"#).unwrap();
        assert!(failed.is_terminal());
        assert_eq!(failed.error.as_deref(), Some("encoder crashed"));

        assert!(serde_json::from_str::<ExportStatusResponse>(r#"{"status":"queued"}"#).is_err());
    }

    #[test]
    fn test_generation_request_flattens_options() {
        let request = GenerationRequest::new("a fox at dawn").with_option("durationSecs", 5);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["prompt"], "a fox at dawn");
        assert_eq!(json["durationSecs"], 5);
    }

    #[test]
    fn test_generation_status_terminal_states() {
        let pending: GenerationStatus = serde_json::from_str(r#"{"status":"pending"}"#).unwrap();
        assert!(!pending.is_terminal());
        let done: GenerationStatus =
            serde_json::from_str(r#"{"status":"completed","resultUrl":"https://cdn/v.mp4"}"#).unwrap();
        assert!(done.is_terminal());
        assert_eq!("Music".parse::<GenerationKind>().unwrap(), GenerationKind::Music);
        assert!("gif".parse::<GenerationKind>().is_err());
    }
}
