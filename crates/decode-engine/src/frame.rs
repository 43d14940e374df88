//! Decoded frame resources.
//!
//! Two kinds of frames move through the decode path:
//!
//! - [`PooledFrame`]: produced by a decoder and holding one slot of the
//!   decoder's fixed-depth [`FramePool`]. Dropping it returns the slot. A
//!   decoder that cannot lease a slot waits, so frames that are not released
//!   promptly stall decoding.
//! - [`CachedFrame`]: a cheap, cloneable, immutable image stored in the
//!   frame cache and handed to the compositor.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use image::RgbaImage;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use cutline_common::error::{CutlineError, CutlineResult};

/// Fixed-depth pool bounding the decoder-owned frames alive at once.
#[derive(Debug, Clone)]
pub struct FramePool {
    semaphore: Arc<Semaphore>,
    stats: Arc<PoolStats>,
    depth: usize,
}

#[derive(Debug, Default)]
struct PoolStats {
    outstanding: AtomicUsize,
    leased: AtomicU64,
    released: AtomicU64,
}

impl FramePool {
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(depth)),
            stats: Arc::new(PoolStats::default()),
            depth,
        }
    }

    /// Wait for a free slot.
    pub async fn lease(&self) -> CutlineResult<FrameLease> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CutlineError::decode("Frame pool closed"))?;
        Ok(self.wrap(permit))
    }

    /// Take a free slot without waiting.
    pub fn try_lease(&self) -> Option<FrameLease> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| self.wrap(permit))
    }

    fn wrap(&self, permit: OwnedSemaphorePermit) -> FrameLease {
        self.stats.outstanding.fetch_add(1, Ordering::SeqCst);
        self.stats.leased.fetch_add(1, Ordering::SeqCst);
        FrameLease {
            _permit: permit,
            stats: self.stats.clone(),
        }
    }

    /// Close the pool; pending and future leases fail.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Frames currently holding a slot.
    pub fn outstanding(&self) -> usize {
        self.stats.outstanding.load(Ordering::SeqCst)
    }

    pub fn total_leased(&self) -> u64 {
        self.stats.leased.load(Ordering::SeqCst)
    }

    pub fn total_released(&self) -> u64 {
        self.stats.released.load(Ordering::SeqCst)
    }
}

/// One slot of a [`FramePool`]. Released on drop.
#[derive(Debug)]
pub struct FrameLease {
    _permit: OwnedSemaphorePermit,
    stats: Arc<PoolStats>,
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        self.stats.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.stats.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// A frame owned by the decoder until dropped.
#[derive(Debug)]
pub struct PooledFrame {
    image: RgbaImage,
    timestamp: f64,
    _lease: FrameLease,
}

impl PooledFrame {
    pub fn new(image: RgbaImage, timestamp: f64, lease: FrameLease) -> Self {
        Self {
            image,
            timestamp,
            _lease: lease,
        }
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    /// Source time of the frame in seconds.
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Immutable, shareable image stored in the frame cache.
#[derive(Debug, Clone)]
pub struct CachedFrame {
    image: Arc<RgbaImage>,
    timestamp: f64,
}

impl CachedFrame {
    pub fn new(image: RgbaImage, timestamp: f64) -> Self {
        Self {
            image: Arc::new(image),
            timestamp,
        }
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn shared_image(&self) -> Arc<RgbaImage> {
        self.image.clone()
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Build an image from tightly packed RGBA bytes.
pub fn image_from_rgba(width: u32, height: u32, data: Vec<u8>) -> CutlineResult<RgbaImage> {
    let expected = width as usize * height as usize * 4;
    if data.len() != expected {
        return Err(CutlineError::decode(format!(
            "RGBA buffer has {} bytes, expected {expected} for {width}x{height}",
            data.len()
        )));
    }
    RgbaImage::from_raw(width, height, data)
        .ok_or_else(|| CutlineError::decode("RGBA buffer rejected"))
}
