//! Cutline Project Model
//!
//! Defines the data contracts shared by the decode, render, and export paths:
//! - **Media:** Per-source metadata captured on first successful load
//! - **Layers:** Timed, positioned visual elements held by the compositor
//! - **Timeline:** Editing-surface items the compositor and exporter read
//! - **Export:** Phased status of a single export invocation
//!
//! Times are in seconds on the composition timeline unless a field says
//! otherwise. The core never mutates timeline items.

pub mod export;
pub mod layer;
pub mod media;
pub mod timeline;

pub use export::*;
pub use layer::*;
pub use media::*;
pub use timeline::*;
