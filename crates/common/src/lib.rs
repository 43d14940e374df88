//! Cutline Common Utilities
//!
//! Shared infrastructure for all Cutline crates:
//! - Error types and result aliases
//! - Clock, throttling, and drift utilities for the playback path
//! - Cooperative abort signal used by exports and poll loops
//! - Tracing/logging initialization
//! - Configuration loading

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod signal;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use signal::*;
