//! Decode worker host.
//!
//! One tokio task owns every open decoder and serves [`WorkerRequest`]s in
//! arrival order, answering with [`WorkerEvent`]s. Frames are leased from a
//! fixed-depth [`FramePool`] before decoding, so the worker waits whenever the
//! receiving side holds on to too many frames.
//!
//! A buffer batch checks for newer requests between frames and yields to
//! them; the abandoned remainder is re-requested by the next buffer call.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use cutline_common::config::{CacheConfig, DecodeConfig};
use cutline_project_model::{BufferItem, SourceId, VideoMetadata};

use crate::cache::{time_key, TimeKey};
use crate::decoder::{DecoderFactory, MediaDecoder};
use crate::frame::{FramePool, PooledFrame};
use crate::object_url::ObjectHandle;
use crate::protocol::{WorkerEvent, WorkerRequest};

/// Worker parameters.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub frame_pool_depth: usize,
    pub request_capacity: usize,
    pub event_capacity: usize,
    pub time_resolution: u32,
    pub buffer_ahead_secs: f64,
    pub buffer_behind_secs: f64,
}

impl WorkerConfig {
    pub fn from_engine(decode: &DecodeConfig, cache: &CacheConfig) -> Self {
        Self {
            frame_pool_depth: decode.frame_pool_depth,
            request_capacity: decode.request_capacity.max(1),
            event_capacity: decode.event_capacity.max(1),
            time_resolution: cache.time_resolution.max(1),
            buffer_ahead_secs: decode.buffer_ahead_secs.max(0.0),
            buffer_behind_secs: decode.buffer_behind_secs.max(0.0),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_engine(&DecodeConfig::default(), &CacheConfig::default())
    }
}

/// Coordinator-side ends of a running worker.
pub struct WorkerChannels {
    pub requests: mpsc::Sender<WorkerRequest>,
    pub events: mpsc::Receiver<WorkerEvent>,
    pub pool: FramePool,
    pub task: JoinHandle<()>,
}

/// Spawn a worker task on the current runtime.
pub fn spawn_decode_worker(factory: Arc<dyn DecoderFactory>, config: WorkerConfig) -> WorkerChannels {
    let (request_tx, request_rx) = mpsc::channel(config.request_capacity);
    let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
    let pool = FramePool::new(config.frame_pool_depth);

    let worker = DecodeWorker {
        factory,
        config,
        decoders: HashMap::new(),
        pool: pool.clone(),
        requests: request_rx,
        events: event_tx,
        deferred: None,
    };
    let task = tokio::spawn(worker.run());

    WorkerChannels {
        requests: request_tx,
        events: event_rx,
        pool,
        task,
    }
}

struct OpenSource {
    decoder: Box<dyn MediaDecoder>,
    metadata: VideoMetadata,
}

/// One planned buffer decode.
#[derive(Debug, Clone, PartialEq)]
struct PlannedFrame {
    source_id: SourceId,
    time: f64,
    priority: f64,
}

struct DecodeWorker {
    factory: Arc<dyn DecoderFactory>,
    config: WorkerConfig,
    decoders: HashMap<SourceId, OpenSource>,
    pool: FramePool,
    requests: mpsc::Receiver<WorkerRequest>,
    events: mpsc::Sender<WorkerEvent>,
    /// A request that arrived while a buffer batch was running.
    deferred: Option<WorkerRequest>,
}

impl DecodeWorker {
    async fn run(mut self) {
        info!(pool_depth = self.pool.depth(), "Decode worker started");

        loop {
            let request = match self.deferred.take() {
                Some(request) => request,
                None => match self.requests.recv().await {
                    Some(request) => request,
                    None => break,
                },
            };

            if let Err(e) = request.validate() {
                warn!(kind = request.kind(), error = %e, "Rejected worker request");
                let source_id = request.source_id().unwrap_or_default().to_string();
                if !self.emit(WorkerEvent::error(source_id, e.to_string())).await {
                    break;
                }
                continue;
            }

            let open = match request {
                WorkerRequest::Load { source_id, url } => self.handle_load(source_id, url).await,
                WorkerRequest::Seek { source_id, time } => self.handle_seek(source_id, time).await,
                WorkerRequest::Buffer { time, items, cached } => {
                    self.handle_buffer(time, items, cached).await
                }
                WorkerRequest::Destroy { source_id } => {
                    self.handle_destroy(&source_id).await;
                    true
                }
                WorkerRequest::Shutdown => break,
            };
            if !open {
                debug!("Event channel closed, stopping decode worker");
                break;
            }
        }

        for (source_id, mut open) in self.decoders.drain() {
            trace!(source_id = %source_id, "Closing decoder");
            open.decoder.close().await;
        }
        self.pool.close();
        info!("Decode worker stopped");
    }

    /// Send an event; false once the coordinator is gone.
    async fn emit(&self, event: WorkerEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    async fn handle_load(&mut self, source_id: SourceId, url: String) -> bool {
        if let Some(open) = self.decoders.get(&source_id) {
            let metadata = open.metadata.clone();
            return self.emit(WorkerEvent::Loaded { source_id, metadata }).await;
        }

        info!(source_id = %source_id, url = %url, "Loading source");
        if !self
            .emit(WorkerEvent::Progress {
                source_id: source_id.clone(),
                percent: 0.0,
            })
            .await
        {
            return false;
        }

        let mut decoder = match self.factory.open(&source_id, &url) {
            Ok(decoder) => decoder,
            Err(e) => return self.emit(WorkerEvent::error(source_id, e.to_string())).await,
        };
        let metadata = match decoder.probe().await {
            Ok(metadata) => metadata,
            Err(e) => {
                decoder.close().await;
                return self.emit(WorkerEvent::error(source_id, e.to_string())).await;
            }
        };

        debug!(
            source_id = %source_id,
            width = metadata.width,
            height = metadata.height,
            fps = metadata.frame_rate,
            duration = metadata.duration,
            "Source probed"
        );

        let has_audio = metadata.has_audio;
        self.decoders.insert(
            source_id.clone(),
            OpenSource {
                decoder,
                metadata: metadata.clone(),
            },
        );
        if !self
            .emit(WorkerEvent::Loaded {
                source_id: source_id.clone(),
                metadata,
            })
            .await
        {
            return false;
        }

        if has_audio {
            if !self
                .emit(WorkerEvent::Progress {
                    source_id: source_id.clone(),
                    percent: 50.0,
                })
                .await
            {
                return false;
            }
            if let Some(handle) = self.extract_audio(&source_id).await {
                if !self
                    .emit(WorkerEvent::ObjectHandleReady {
                        source_id: source_id.clone(),
                        handle,
                    })
                    .await
                {
                    return false;
                }
            }
        }

        self.emit(WorkerEvent::Progress {
            source_id,
            percent: 100.0,
        })
        .await
    }

    async fn extract_audio(&mut self, source_id: &str) -> Option<ObjectHandle> {
        let open = self.decoders.get_mut(source_id)?;
        let handle = ObjectHandle::temp_for(source_id, "wav");
        match open.decoder.extract_audio(handle.path()).await {
            Ok(true) => Some(handle),
            Ok(false) => None,
            Err(e) => {
                warn!(source_id, error = %e, "Audio extraction failed");
                let _ = tokio::fs::remove_file(handle.path()).await;
                None
            }
        }
    }

    async fn handle_seek(&mut self, source_id: SourceId, time: f64) -> bool {
        if !self.decoders.contains_key(&source_id) {
            let message = format!("Seek on source that is not loaded: {source_id}");
            return self.emit(WorkerEvent::error(source_id, message)).await;
        }
        match self.decode_one(&source_id, time).await {
            Ok(true) => true,
            Ok(false) => false,
            Err(message) => self.emit(WorkerEvent::error(source_id, message)).await,
        }
    }

    /// Decode and emit one frame.
    ///
    /// `Ok(false)` means the event channel closed; `Err` carries a decode
    /// failure for the caller to report.
    async fn decode_one(&mut self, source_id: &str, time: f64) -> Result<bool, String> {
        let Some(open) = self.decoders.get_mut(source_id) else {
            return Ok(true);
        };
        let time = open.metadata.clamp_time(time);

        let lease = match self.pool.lease().await {
            Ok(lease) => lease,
            Err(_) => return Ok(false),
        };
        let image = open
            .decoder
            .decode_frame_at(time)
            .await
            .map_err(|e| e.to_string())?;
        let frame = PooledFrame::new(image, time, lease);

        trace!(source_id, time, outstanding = self.pool.outstanding(), "Emitting frame");
        Ok(self
            .events
            .send(WorkerEvent::Frame {
                source_id: source_id.to_string(),
                frame,
                timestamp: time,
            })
            .await
            .is_ok())
    }

    async fn handle_buffer(
        &mut self,
        time: f64,
        items: Vec<BufferItem>,
        cached: HashMap<SourceId, HashSet<TimeKey>>,
    ) -> bool {
        let plan = self.plan_buffer(time, &items, &cached);
        if plan.is_empty() {
            return true;
        }
        trace!(time, frames = plan.len(), "Buffering frames");

        let mut failed: HashSet<SourceId> = HashSet::new();
        for planned in plan {
            if failed.contains(&planned.source_id) {
                continue;
            }
            match self.requests.try_recv() {
                Ok(request) => {
                    debug!(next = request.kind(), "Buffer batch preempted");
                    self.deferred = Some(request);
                    return true;
                }
                Err(mpsc::error::TryRecvError::Empty) => {}
                Err(mpsc::error::TryRecvError::Disconnected) => return true,
            }

            match self.decode_one(&planned.source_id, planned.time).await {
                Ok(true) => {}
                Ok(false) => return false,
                Err(message) => {
                    if !self
                        .emit(WorkerEvent::error(planned.source_id.clone(), message))
                        .await
                    {
                        return false;
                    }
                    failed.insert(planned.source_id);
                }
            }
        }
        true
    }

    /// Source times to decode around composition time `time`, nearest first,
    /// frames ahead of the playhead before frames behind it.
    fn plan_buffer(
        &self,
        time: f64,
        items: &[BufferItem],
        cached: &HashMap<SourceId, HashSet<TimeKey>>,
    ) -> Vec<PlannedFrame> {
        let resolution = self.config.time_resolution;
        let ahead = self.config.buffer_ahead_secs;
        let behind = self.config.buffer_behind_secs;
        let empty = HashSet::new();

        let mut plan = Vec::new();
        for item in items {
            let Some(open) = self.decoders.get(&item.id) else {
                trace!(source_id = %item.id, "Skipping buffer for source that is not loaded");
                continue;
            };
            let held = cached.get(&item.id).unwrap_or(&empty);
            let mut planned_keys: HashSet<TimeKey> = HashSet::new();

            let (range_start, range_end) = item.source_range();
            let range_end = range_end.min(open.metadata.duration);
            let center = item.local_time(time);
            let lo = (center - behind * item.speed).max(range_start);
            let hi = (center + ahead * item.speed).min(range_end);
            if hi < lo {
                continue;
            }

            let step = item.speed / resolution as f64;
            let mut push = |local: f64, priority: f64| {
                let key = time_key(local, resolution);
                if held.contains(&key) || !planned_keys.insert(key) {
                    return;
                }
                plan.push(PlannedFrame {
                    source_id: item.id.clone(),
                    time: key as f64 / resolution as f64,
                    priority,
                });
            };

            // Step by index so accumulated error cannot drop the last frame.
            let first = center.clamp(lo, hi);
            let tolerance = step * 1e-6;
            for i in 0u64.. {
                let local = first + i as f64 * step;
                if local > hi + tolerance {
                    break;
                }
                push(local.min(hi), (local - center).abs() / item.speed);
            }
            for i in 1u64.. {
                let local = first - i as f64 * step;
                if local < lo - tolerance {
                    break;
                }
                push(local.max(lo), ahead + (center - local).abs() / item.speed);
            }
        }

        plan.sort_by(|a, b| a.priority.total_cmp(&b.priority));
        plan
    }

    async fn handle_destroy(&mut self, source_id: &str) {
        if let Some(mut open) = self.decoders.remove(source_id) {
            open.decoder.close().await;
            debug!(source_id, "Decoder closed");
        }
    }
}
