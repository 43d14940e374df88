//! Decode coordinator.
//!
//! Owns the decode worker, the frame cache and the object-handle table.
//! Per-source state moves `unloaded → loading → loaded` or
//! `unloaded → loading → error`; a second load while loading is refused so
//! only one load request per source is ever in flight.
//!
//! An intake task drains worker events. Every decoded frame is converted into
//! a [`CachedFrame`] and the decoder-owned [`PooledFrame`] is dropped right
//! after conversion, whatever the outcome, so the worker's frame pool never
//! runs dry.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use cutline_common::clock::LogThrottle;
use cutline_common::config::EngineConfig;
use cutline_common::error::CutlineResult;
use cutline_project_model::{BufferItem, SourceId, VideoMetadata};

use crate::cache::{CacheStats, FrameCache, TimeKey};
use crate::decoder::DecoderFactory;
use crate::effects::EffectWorker;
use crate::frame::{CachedFrame, FramePool, PooledFrame};
use crate::object_url::{ObjectHandle, ObjectHandleRegistry};
use crate::protocol::{WorkerEvent, WorkerRequest};
use crate::worker::{spawn_decode_worker, WorkerConfig};

const MISS_LOG_INTERVAL: Duration = Duration::from_secs(2);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Turns decoder-owned frames into cache-storable ones.
#[async_trait]
pub trait FrameConverter: Send + Sync {
    async fn convert(&self, frame: &PooledFrame) -> CutlineResult<CachedFrame>;
}

/// Converter that copies the decoded pixels.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyConverter;

#[async_trait]
impl FrameConverter for CopyConverter {
    async fn convert(&self, frame: &PooledFrame) -> CutlineResult<CachedFrame> {
        Ok(CachedFrame::new(frame.image().clone(), frame.timestamp()))
    }
}

/// Read access to decoded frames by source and time.
pub trait FrameSource: Send + Sync {
    fn frame_at(&self, source_id: &str, time: f64) -> Option<CachedFrame>;
}

pub type FrameCallback = Box<dyn Fn(&str, &CachedFrame, f64) + Send + Sync>;
pub type MetadataCallback = Box<dyn Fn(&str, &VideoMetadata) + Send + Sync>;
pub type ProgressCallback = Box<dyn Fn(&str, f64) + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(&str, &str) + Send + Sync>;
pub type HandleCallback = Box<dyn Fn(&str, &ObjectHandle) + Send + Sync>;

/// Notifications fired as worker events arrive.
#[derive(Default)]
pub struct CoordinatorCallbacks {
    pub on_frame: Option<FrameCallback>,
    pub on_metadata: Option<MetadataCallback>,
    pub on_progress: Option<ProgressCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_object_handle: Option<HandleCallback>,
}

impl CoordinatorCallbacks {
    pub fn on_frame(mut self, f: impl Fn(&str, &CachedFrame, f64) + Send + Sync + 'static) -> Self {
        self.on_frame = Some(Box::new(f));
        self
    }

    pub fn on_metadata(mut self, f: impl Fn(&str, &VideoMetadata) + Send + Sync + 'static) -> Self {
        self.on_metadata = Some(Box::new(f));
        self
    }

    pub fn on_progress(mut self, f: impl Fn(&str, f64) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_object_handle(mut self, f: impl Fn(&str, &ObjectHandle) + Send + Sync + 'static) -> Self {
        self.on_object_handle = Some(Box::new(f));
        self
    }
}

/// Public view of a source's load state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    Unloaded,
    Loading,
    Loaded,
    Error,
}

enum SourceState {
    Loading {
        waiter: Option<oneshot::Sender<Option<VideoMetadata>>>,
    },
    Loaded(VideoMetadata),
    Failed(String),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the coordinator and its intake task.
struct Shared {
    cache: Mutex<FrameCache<CachedFrame>>,
    sources: Mutex<HashMap<SourceId, SourceState>>,
    handles: Mutex<ObjectHandleRegistry>,
    miss_log: Mutex<LogThrottle>,
    callbacks: CoordinatorCallbacks,
    converter: Arc<dyn FrameConverter>,
    requests: mpsc::Sender<WorkerRequest>,
    /// Decode errors reported per source since it was loaded.
    decode_errors: Mutex<HashMap<SourceId, u64>>,
    /// Bumped after every frame stored in the cache and every decode error.
    changes: watch::Sender<u64>,
}

impl Shared {
    fn is_loaded(&self, source_id: &str) -> bool {
        matches!(lock(&self.sources).get(source_id), Some(SourceState::Loaded(_)))
    }

    fn decode_error_count(&self, source_id: &str) -> u64 {
        lock(&self.decode_errors).get(source_id).copied().unwrap_or(0)
    }

    /// Queue a request that must reach the worker even when the channel is
    /// momentarily full.
    fn dispatch(&self, request: WorkerRequest) {
        match self.requests.try_send(request) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(request)) => {
                let requests = self.requests.clone();
                tokio::spawn(async move {
                    let _ = requests.send(request).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(request)) => {
                debug!(kind = request.kind(), "Worker gone, request dropped");
            }
        }
    }

    async fn handle_event(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::Loaded { source_id, metadata } => self.on_loaded(source_id, metadata),
            WorkerEvent::Frame {
                source_id,
                frame,
                timestamp,
            } => self.on_frame(source_id, frame, timestamp).await,
            WorkerEvent::Progress { source_id, percent } => {
                if let Some(callback) = &self.callbacks.on_progress {
                    callback(&source_id, percent);
                }
            }
            WorkerEvent::Error { source_id, message } => self.on_error(source_id, message),
            WorkerEvent::ObjectHandleReady { source_id, handle } => {
                if !self.is_loaded(&source_id) {
                    debug!(source_id = %source_id, "Object handle for a torn-down source, revoking");
                    handle.revoke();
                    return;
                }
                lock(&self.handles).register(&source_id, handle.clone());
                if let Some(callback) = &self.callbacks.on_object_handle {
                    callback(&source_id, &handle);
                }
            }
        }
    }

    fn on_loaded(&self, source_id: SourceId, metadata: VideoMetadata) {
        let waiter = {
            let mut sources = lock(&self.sources);
            sources.get_mut(&source_id).map(|state| {
                match std::mem::replace(state, SourceState::Loaded(metadata.clone())) {
                    SourceState::Loading { waiter } => waiter,
                    _ => None,
                }
            })
        };
        let Some(waiter) = waiter else {
            debug!(source_id = %source_id, "Loaded a source that was destroyed meanwhile");
            self.dispatch(WorkerRequest::Destroy { source_id });
            return;
        };

        info!(
            source_id = %source_id,
            width = metadata.width,
            height = metadata.height,
            duration = metadata.duration,
            "Source loaded"
        );
        if let Some(callback) = &self.callbacks.on_metadata {
            callback(&source_id, &metadata);
        }
        if let Some(waiter) = waiter {
            let _ = waiter.send(Some(metadata));
        }
    }

    async fn on_frame(&self, source_id: SourceId, frame: PooledFrame, timestamp: f64) {
        let converted = self.converter.convert(&frame).await;
        // The decoder's slot returns here on every path.
        drop(frame);

        let cached = match converted {
            Ok(cached) => cached,
            Err(e) => {
                warn!(source_id = %source_id, timestamp, error = %e, "Frame conversion failed");
                return;
            }
        };
        if !self.is_loaded(&source_id) {
            trace!(source_id = %source_id, timestamp, "Discarding frame for inactive source");
            return;
        }

        lock(&self.cache).put(&source_id, timestamp, cached.clone());
        self.changes.send_modify(|count| *count += 1);
        if let Some(callback) = &self.callbacks.on_frame {
            callback(&source_id, &cached, timestamp);
        }
    }

    fn on_error(&self, source_id: SourceId, message: String) {
        let waiter = {
            let mut sources = lock(&self.sources);
            match sources.get_mut(&source_id) {
                Some(state) if matches!(state, SourceState::Loading { .. }) => {
                    match std::mem::replace(state, SourceState::Failed(message.clone())) {
                        SourceState::Loading { waiter } => waiter,
                        _ => None,
                    }
                }
                _ => None,
            }
        };

        warn!(source_id = %source_id, error = %message, "Decode error");
        *lock(&self.decode_errors).entry(source_id.clone()).or_default() += 1;
        self.changes.send_modify(|count| *count += 1);
        if let Some(callback) = &self.callbacks.on_error {
            callback(&source_id, &message);
        }
        if let Some(waiter) = waiter {
            let _ = waiter.send(None);
        }
    }
}

async fn run_intake(shared: Arc<Shared>, mut events: mpsc::Receiver<WorkerEvent>) {
    while let Some(event) = events.recv().await {
        shared.handle_event(event).await;
    }
    debug!("Decode intake stopped");
}

/// Builder for [`DecodeCoordinator`].
pub struct CoordinatorBuilder {
    factory: Arc<dyn DecoderFactory>,
    config: EngineConfig,
    callbacks: CoordinatorCallbacks,
    converter: Arc<dyn FrameConverter>,
}

impl CoordinatorBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn callbacks(mut self, callbacks: CoordinatorCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn converter(mut self, converter: Arc<dyn FrameConverter>) -> Self {
        self.converter = converter;
        self
    }

    /// Start the worker and intake tasks. Must run inside a tokio runtime.
    pub fn build(self) -> DecodeCoordinator {
        let worker_config = WorkerConfig::from_engine(&self.config.decode, &self.config.cache);
        let channels = spawn_decode_worker(self.factory.clone(), worker_config);
        let (changes, _) = watch::channel(0);

        let shared = Arc::new(Shared {
            cache: Mutex::new(FrameCache::new(self.config.cache.clone())),
            sources: Mutex::new(HashMap::new()),
            handles: Mutex::new(ObjectHandleRegistry::new()),
            miss_log: Mutex::new(LogThrottle::new(MISS_LOG_INTERVAL)),
            callbacks: self.callbacks,
            converter: self.converter,
            requests: channels.requests,
            decode_errors: Mutex::new(HashMap::new()),
            changes,
        });
        let intake = tokio::spawn(run_intake(shared.clone(), channels.events));

        DecodeCoordinator {
            shared,
            factory: self.factory,
            pool: channels.pool,
            tasks: Mutex::new(Some((channels.task, intake))),
            effects: OnceCell::new(),
            load_requests: AtomicU64::new(0),
        }
    }
}

/// Front door to decoding: loads, seeks, buffering and cached frame reads.
pub struct DecodeCoordinator {
    shared: Arc<Shared>,
    factory: Arc<dyn DecoderFactory>,
    pool: FramePool,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
    effects: OnceCell<EffectWorker>,
    load_requests: AtomicU64,
}

impl DecodeCoordinator {
    pub fn builder(factory: Arc<dyn DecoderFactory>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            factory,
            config: EngineConfig::default(),
            callbacks: CoordinatorCallbacks::default(),
            converter: Arc::new(CopyConverter),
        }
    }

    /// Coordinator with default callbacks and a copying converter.
    pub fn new(factory: Arc<dyn DecoderFactory>, config: EngineConfig) -> Self {
        Self::builder(factory).config(config).build()
    }

    /// Load `url` as `source_id` and wait for its metadata.
    ///
    /// Returns cached metadata when already loaded, and `None` when a load
    /// for the source is already in flight or the load fails.
    pub async fn load_video(&self, source_id: &str, url: &str) -> Option<VideoMetadata> {
        let rx = {
            let mut sources = lock(&self.shared.sources);
            match sources.get(source_id) {
                Some(SourceState::Loaded(metadata)) => return Some(metadata.clone()),
                Some(SourceState::Loading { .. }) => {
                    warn!(source_id, "Load already in flight, ignoring duplicate request");
                    return None;
                }
                Some(SourceState::Failed(_)) | None => {}
            }
            let (tx, rx) = oneshot::channel();
            sources.insert(
                source_id.to_string(),
                SourceState::Loading { waiter: Some(tx) },
            );
            rx
        };

        let request = WorkerRequest::Load {
            source_id: source_id.to_string(),
            url: url.to_string(),
        };
        if let Err(e) = request.validate() {
            lock(&self.shared.sources).remove(source_id);
            self.shared.on_error(source_id.to_string(), e.to_string());
            return None;
        }
        if self.shared.requests.send(request).await.is_err() {
            lock(&self.shared.sources).remove(source_id);
            warn!(source_id, "Decode worker is gone");
            return None;
        }
        self.load_requests.fetch_add(1, Ordering::SeqCst);

        rx.await.ok().flatten()
    }

    /// Ask the worker for the frame at `time`. Fire-and-forget.
    pub fn seek_video(&self, source_id: &str, time: f64) {
        let request = WorkerRequest::Seek {
            source_id: source_id.to_string(),
            time,
        };
        if let Err(e) = request.validate() {
            warn!(source_id, time, error = %e, "Ignoring invalid seek");
            return;
        }
        if !self.shared.is_loaded(source_id) {
            trace!(source_id, "Seek on source that is not loaded");
            return;
        }
        if self.shared.requests.try_send(request).is_err() {
            debug!(source_id, time, "Worker busy, seek hint dropped");
        }
    }

    /// Ask the worker to pre-decode frames around composition time `time`.
    pub fn buffer_frames(&self, time: f64, items: &[BufferItem]) {
        let items: Vec<BufferItem> = {
            let sources = lock(&self.shared.sources);
            items
                .iter()
                .filter(|item| matches!(sources.get(&item.id), Some(SourceState::Loaded(_))))
                .cloned()
                .collect()
        };
        if items.is_empty() {
            return;
        }

        let cached: HashMap<SourceId, HashSet<TimeKey>> = {
            let cache = lock(&self.shared.cache);
            items
                .iter()
                .map(|item| (item.id.clone(), cache.keys(&item.id).into_iter().collect()))
                .collect()
        };

        let request = WorkerRequest::Buffer {
            time,
            items,
            cached,
        };
        if let Err(e) = request.validate() {
            warn!(time, error = %e, "Ignoring invalid buffer request");
            return;
        }
        if self.shared.requests.try_send(request).is_err() {
            trace!(time, "Worker busy, buffer request dropped");
        }
    }

    /// Closest cached frame to `time`. Also records `time` as the playback
    /// position used for eviction.
    pub fn get_frame(&self, source_id: &str, time: f64) -> Option<CachedFrame> {
        let frame = {
            let mut cache = lock(&self.shared.cache);
            cache.mark_playback_position(source_id, time);
            cache.get(source_id, time).cloned()
        };
        if frame.is_none() {
            if let Some(suppressed) = lock(&self.shared.miss_log).check(Instant::now()) {
                debug!(source_id, time, suppressed, "Frame cache miss");
            }
        }
        frame
    }

    /// Wait until the frame at `time` is cached, requesting it if needed.
    ///
    /// `time` is clamped to the source duration first, so times past the end
    /// of the media resolve to its last frame. Falls back to the closest
    /// cached frame as soon as the worker reports a decode error for the
    /// source, or after `timeout`.
    pub async fn ensure_frame(&self, source_id: &str, time: f64, timeout: Duration) -> Option<CachedFrame> {
        let time = self.metadata(source_id)?.clamp_time(time);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut changes = self.shared.changes.subscribe();
        let errors_before = self.shared.decode_error_count(source_id);
        let mut requested = false;

        loop {
            let ready = lock(&self.shared.cache).contains_exact(source_id, time);
            if ready {
                break;
            }
            if self.shared.decode_error_count(source_id) != errors_before {
                debug!(source_id, time, "Decode failed, using closest cached frame");
                break;
            }
            if !requested {
                let request = WorkerRequest::Seek {
                    source_id: source_id.to_string(),
                    time,
                };
                if self.shared.requests.send(request).await.is_err() {
                    break;
                }
                requested = true;
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => break,
            }
            if !self.shared.is_loaded(source_id) {
                return None;
            }
        }
        self.get_frame(source_id, time)
    }

    /// Release everything held for one source.
    pub fn destroy_video(&self, source_id: &str) {
        let removed = lock(&self.shared.sources).remove(source_id).is_some();
        lock(&self.shared.decode_errors).remove(source_id);
        let frames = lock(&self.shared.cache).evict_source(source_id);
        let handles = lock(&self.shared.handles).revoke(source_id);
        if removed {
            self.shared.dispatch(WorkerRequest::Destroy {
                source_id: source_id.to_string(),
            });
        }
        debug!(source_id, frames, handles, "Source destroyed");
    }

    /// Release all sources and stop the worker tasks.
    pub async fn destroy(&self) {
        let sources: Vec<SourceId> = lock(&self.shared.sources).drain().map(|(id, _)| id).collect();
        lock(&self.shared.decode_errors).clear();
        let frames = lock(&self.shared.cache).evict_all();
        let handles = lock(&self.shared.handles).revoke_all();
        if let Some(effects) = self.effects.get() {
            effects.shutdown();
        }

        let tasks = lock(&self.tasks).take();
        if let Some((worker, intake)) = tasks {
            let _ = self.shared.requests.send(WorkerRequest::Shutdown).await;
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, worker).await.is_err() {
                warn!("Decode worker did not stop in time");
            }
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, intake).await.is_err() {
                warn!("Decode intake did not stop in time");
            }
        }
        self.pool.close();
        info!(sources = sources.len(), frames, handles, "Decode coordinator destroyed");
    }

    /// The effect worker, started on first use.
    pub async fn effects(&self) -> &EffectWorker {
        self.effects
            .get_or_init(|| async { EffectWorker::spawn(self.factory.clone()) })
            .await
    }

    pub fn status(&self, source_id: &str) -> SourceStatus {
        match lock(&self.shared.sources).get(source_id) {
            None => SourceStatus::Unloaded,
            Some(SourceState::Loading { .. }) => SourceStatus::Loading,
            Some(SourceState::Loaded(_)) => SourceStatus::Loaded,
            Some(SourceState::Failed(_)) => SourceStatus::Error,
        }
    }

    pub fn metadata(&self, source_id: &str) -> Option<VideoMetadata> {
        match lock(&self.shared.sources).get(source_id) {
            Some(SourceState::Loaded(metadata)) => Some(metadata.clone()),
            _ => None,
        }
    }

    /// Message of the failed load, if the source is in the error state.
    pub fn load_error(&self, source_id: &str) -> Option<String> {
        match lock(&self.shared.sources).get(source_id) {
            Some(SourceState::Failed(message)) => Some(message.clone()),
            _ => None,
        }
    }

    /// Object handles currently registered for `source_id`.
    pub fn object_handles(&self, source_id: &str) -> Vec<ObjectHandle> {
        lock(&self.shared.handles).handles(source_id).to_vec()
    }

    pub fn cache_stats(&self) -> CacheStats {
        lock(&self.shared.cache).stats()
    }

    pub fn cached_frames(&self, source_id: &str) -> usize {
        lock(&self.shared.cache).len(source_id)
    }

    /// Sources with an entry in the frame cache.
    pub fn cached_sources(&self) -> usize {
        lock(&self.shared.cache).source_count()
    }

    /// Load requests actually sent to the worker.
    pub fn load_requests_sent(&self) -> u64 {
        self.load_requests.load(Ordering::SeqCst)
    }

    pub fn frame_pool(&self) -> &FramePool {
        &self.pool
    }
}

impl FrameSource for DecodeCoordinator {
    fn frame_at(&self, source_id: &str, time: f64) -> Option<CachedFrame> {
        self.get_frame(source_id, time)
    }
}

impl Drop for DecodeCoordinator {
    fn drop(&mut self) {
        if let Some((worker, intake)) = lock(&self.tasks).take() {
            worker.abort();
            intake.abort();
        }
        lock(&self.shared.handles).revoke_all();
        lock(&self.shared.cache).evict_all();
    }
}
