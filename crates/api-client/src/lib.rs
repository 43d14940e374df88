//! Cutline API Client
//!
//! Clients for the external generation API and for server-assisted export
//! status, plus the cancellable poll loop both use:
//! - `POST /generate/{kind}` → `{generationId}`
//! - `GET /generations/{id}` → `{status, resultUrl?, errorMessage?}`
//! - `GET /export/{jobId}` → `{status, downloadUrl?, error?}`
//!
//! Result URLs are plain media URLs; the decode engine consumes them as-is.

pub mod client;
pub mod models;
pub mod poll;

pub use client::{ExportStatusClient, GenerationClient, HttpApiClient};
pub use models::*;
pub use poll::{
    clamp_poll_interval, poll_until_terminal, sleep_or_abort, wait_for_export, wait_for_generation,
    MAX_POLL_INTERVAL, MIN_POLL_INTERVAL,
};
