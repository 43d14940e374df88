//! HTTP clients for the generation and export-status endpoints.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};

use cutline_common::config::ApiConfig;
use cutline_common::error::{CutlineError, CutlineResult};

use crate::models::{ExportStatusResponse, GenerationKind, GenerationRequest, GenerationStatus, GenerationSubmitted};

/// Reads the status of a server-side export job.
#[async_trait]
pub trait ExportStatusClient: Send + Sync {
    async fn export_status(&self, job_id: &str) -> CutlineResult<ExportStatusResponse>;
}

/// Submits generation jobs and reads their status.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn submit(&self, kind: GenerationKind, request: &GenerationRequest) -> CutlineResult<GenerationSubmitted>;

    async fn generation(&self, generation_id: &str) -> CutlineResult<GenerationStatus>;
}

/// `reqwest` implementation of both clients.
#[derive(Debug, Clone)]
pub struct HttpApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpApiClient {
    pub fn new(config: &ApiConfig) -> CutlineResult<Self> {
        if config.base_url.trim().is_empty() {
            return Err(CutlineError::config("api.base_url is empty"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .user_agent(concat!("cutline/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CutlineError::api(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Join `segments` onto the base URL. Segments must be single path
    /// components.
    pub fn endpoint(&self, segments: &[&str]) -> CutlineResult<String> {
        let mut url = self.base_url.clone();
        for segment in segments {
            if segment.is_empty() || segment.contains(&['/', '?', '#'][..]) {
                return Err(CutlineError::api(format!("Invalid path segment {segment:?}")));
            }
            url.push('/');
            url.push_str(segment);
        }
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> CutlineResult<T> {
        trace!(url, "GET");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| CutlineError::api(format!("GET {url} failed: {e}")))?;
        Self::decode(url, response).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(&self, url: &str, body: &B) -> CutlineResult<T> {
        trace!(url, "POST");
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| CutlineError::api(format!("POST {url} failed: {e}")))?;
        Self::decode(url, response).await
    }

    async fn decode<T: DeserializeOwned>(url: &str, response: reqwest::Response) -> CutlineResult<T> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CutlineError::api(format!("Reading {url} failed: {e}")))?;
        if !status.is_success() {
            let detail: String = body.chars().take(200).collect();
            return Err(CutlineError::api(format!("HTTP {status} from {url}: {detail}")));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl ExportStatusClient for HttpApiClient {
    async fn export_status(&self, job_id: &str) -> CutlineResult<ExportStatusResponse> {
        let url = self.endpoint(&["export", job_id])?;
        let status: ExportStatusResponse = self.get_json(&url).await?;
        debug!(job_id, status = ?status.status, "Export status");
        Ok(status)
    }
}

#[async_trait]
impl GenerationClient for HttpApiClient {
    async fn submit(&self, kind: GenerationKind, request: &GenerationRequest) -> CutlineResult<GenerationSubmitted> {
        let url = self.endpoint(&["generate", kind.as_str()])?;
        let submitted: GenerationSubmitted = self.post_json(&url, request).await?;
        debug!(kind = kind.as_str(), generation_id = %submitted.generation_id, "Generation submitted");
        Ok(submitted)
    }

    async fn generation(&self, generation_id: &str) -> CutlineResult<GenerationStatus> {
        let url = self.endpoint(&["generations", generation_id])?;
        self.get_json(&url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> HttpApiClient {
        HttpApiClient::new(&ApiConfig {
            base_url: base.to_string(),
            ..ApiConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_endpoint_joins_segments() {
        let api = client("https://api.example.com/v1/");
        assert_eq!(api.base_url(), "https://api.example.com/v1");
        assert_eq!(
            api.endpoint(&["export", "job-42"]).unwrap(),
            "https://api.example.com/v1/export/job-42"
        );
        assert_eq!(
            api.endpoint(&["generate", GenerationKind::Voice.as_str()]).unwrap(),
            "https://api.example.com/v1/generate/voice"
        );
    }

    #[test]
    fn test_endpoint_rejects_unsafe_ids() {
        let api = client("https://api.example.com");
        assert!(api.endpoint(&["export", "../admin"]).is_err());
        assert!(api.endpoint(&["export", ""]).is_err());
        assert!(api.endpoint(&["export", "a?b=c"]).is_err());
    }

    #[test]
    fn test_empty_base_url_is_a_config_error() {
        let err = HttpApiClient::new(&ApiConfig {
            base_url: "  ".to_string(),
            ..ApiConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, CutlineError::Config { .. }));
    }
}
