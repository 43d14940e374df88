//! Offline export pipeline.
//!
//! Renders every frame of a timeline through a [`FrameProvider`], encodes it,
//! mixes the timeline audio, and muxes the result into an MP4. Progress is
//! reported through an [`ExportJob`] whose message the host UI can show
//! verbatim.
//!
//! Failure handling:
//! - unsupported codecs are rejected before the muxer or any frame exists
//! - per-frame encoder errors are logged and counted, the export continues
//! - per-clip audio failures drop that clip from the mix
//! - cancellation is checked before each frame and each audio block
//!
//! On any failure the encoders and muxer are dropped before `export` returns
//! and the partial file is deleted, so no artifact is left behind.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use tracing::{debug, error, info, warn};

use cutline_common::clock::{frame_duration_micros, frame_timestamp_micros};
use cutline_common::config::ExportSettings;
use cutline_common::error::{CutlineError, CutlineResult};
use cutline_common::signal::AbortSignal;
use cutline_decode_engine::DecodeCoordinator;
use cutline_project_model::{ExportJob, ExportPhase, LayerKind, Timeline};

use crate::audio::{render_timeline_audio, AudioLoader};
use crate::compositor::LayerCompositor;
use crate::encoder::{AudioEncoder, AudioEncoderConfig, EncoderFactory, VideoEncoder, VideoEncoderConfig};
use crate::mux::{AudioTrackConfig, Mp4Muxer, VideoTrackConfig};
use crate::render_loop::lock;
use crate::surface::RgbaCanvas;

/// Sample frames per audio encode call.
const AUDIO_BLOCK_FRAMES: usize = 4096;

const FRAME_PROGRESS_END: f64 = 80.0;
const AUDIO_PROGRESS_END: f64 = 85.0;
const MUX_PROGRESS: f64 = 85.0;
const FINALIZE_PROGRESS: f64 = 95.0;

/// Frames needed to cover `duration` at `fps`, i.e. `ceil(duration * fps)`.
///
/// Products within a microsecond-scale epsilon of an integer count as that
/// integer, so `0.3 s` at 10 fps is 3 frames, not 4.
pub fn frame_count(duration: f64, fps: u32) -> u64 {
    if !duration.is_finite() || duration <= 0.0 {
        return 0;
    }
    (duration * fps.max(1) as f64 - 1e-6).ceil().max(0.0) as u64
}

/// Called with the job after every status change.
pub type ExportProgressCallback = Box<dyn Fn(&ExportJob) + Send + Sync>;

/// A rendered frame handed from a provider to the pipeline.
///
/// The pipeline owns it and drops it right after encoding. The optional
/// release hook runs on drop.
pub struct RenderedFrame {
    image: RgbaImage,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl RenderedFrame {
    pub fn new(image: RgbaImage) -> Self {
        Self {
            image,
            on_release: None,
        }
    }

    pub fn with_release(mut self, on_release: impl FnOnce() + Send + 'static) -> Self {
        self.on_release = Some(Box::new(on_release));
        self
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }
}

impl std::fmt::Debug for RenderedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderedFrame")
            .field("width", &self.image.width())
            .field("height", &self.image.height())
            .finish()
    }
}

impl Drop for RenderedFrame {
    fn drop(&mut self) {
        if let Some(release) = self.on_release.take() {
            release();
        }
    }
}

/// Supplies the composed frame for a presentation time.
#[async_trait]
pub trait FrameProvider: Send {
    /// Make whatever `frame_at(time)` needs available. Runs before every
    /// frame and may wait on decoding.
    async fn prepare(&mut self, _time: f64) -> CutlineResult<()> {
        Ok(())
    }

    /// The frame at `time`, or `None` to encode the background instead.
    fn frame_at(&mut self, time: f64) -> Option<RenderedFrame>;
}

#[async_trait]
impl<F> FrameProvider for F
where
    F: FnMut(f64) -> Option<RenderedFrame> + Send,
{
    fn frame_at(&mut self, time: f64) -> Option<RenderedFrame> {
        self(time)
    }
}

/// Renders frames through a [`LayerCompositor`] on a CPU canvas.
///
/// With a coordinator attached, `prepare` waits (bounded) for every active
/// video layer's frame to be decoded, so export never falls back to stale
/// frames because decoding lagged.
pub struct CompositorFrameProvider {
    compositor: LayerCompositor<RgbaCanvas>,
    coordinator: Option<Arc<DecodeCoordinator>>,
    frame_timeout: Duration,
}

impl CompositorFrameProvider {
    pub fn new(compositor: LayerCompositor<RgbaCanvas>) -> Self {
        Self {
            compositor,
            coordinator: None,
            frame_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_coordinator(mut self, coordinator: Arc<DecodeCoordinator>, frame_timeout: Duration) -> Self {
        self.coordinator = Some(coordinator);
        self.frame_timeout = frame_timeout;
        self
    }

    pub fn compositor(&self) -> &LayerCompositor<RgbaCanvas> {
        &self.compositor
    }

    pub fn compositor_mut(&mut self) -> &mut LayerCompositor<RgbaCanvas> {
        &mut self.compositor
    }
}

#[async_trait]
impl FrameProvider for CompositorFrameProvider {
    async fn prepare(&mut self, time: f64) -> CutlineResult<()> {
        let Some(coordinator) = self.coordinator.clone() else {
            return Ok(());
        };
        let wanted: Vec<(String, f64)> = self
            .compositor
            .active_layers(time)
            .into_iter()
            .filter(|layer| layer.kind == LayerKind::Video)
            .filter_map(|layer| Some((layer.source.clone()?, layer.local_time(time))))
            .collect();

        for (source, local) in wanted {
            if coordinator.metadata(&source).is_none() {
                continue;
            }
            if coordinator
                .ensure_frame(&source, local, self.frame_timeout)
                .await
                .is_none()
            {
                debug!(source = %source, time = local, "Frame not decoded in time");
            }
        }
        Ok(())
    }

    fn frame_at(&mut self, time: f64) -> Option<RenderedFrame> {
        self.compositor.render_at(time);
        Some(RenderedFrame::new(self.compositor.surface().snapshot()))
    }
}

/// Audio mixing result reported with a finished export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSummary {
    pub clips_mixed: usize,
    pub clips_skipped: usize,
}

/// A finished export.
#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub path: PathBuf,
    pub job: ExportJob,
    pub frames_encoded: u64,
    /// Frames whose encode call failed.
    pub encode_errors: u64,
    /// `None` when the export has no audio track.
    pub audio: Option<AudioSummary>,
    pub bytes: u64,
    pub elapsed: Duration,
}

/// Clears the in-progress flag on every exit path.
struct ExportGuard<'a>(&'a AtomicBool);

impl<'a> ExportGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> CutlineResult<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| CutlineError::ExportInProgress)?;
        Ok(Self(flag))
    }
}

impl Drop for ExportGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The encoder pair of one export. Closed when dropped.
struct Encoders {
    video: Box<dyn VideoEncoder>,
    audio: Option<Box<dyn AudioEncoder>>,
}

impl Drop for Encoders {
    fn drop(&mut self) {
        self.video.close();
        if let Some(audio) = self.audio.as_mut() {
            audio.close();
        }
    }
}

/// Job status plus its observer.
struct JobReporter {
    job: ExportJob,
    callback: Option<ExportProgressCallback>,
}

impl JobReporter {
    fn advance(&mut self, phase: ExportPhase, progress: f64, message: impl Into<String>) {
        if self.job.advance(phase, progress, message) {
            self.notify();
        }
    }

    fn notify(&self) {
        if let Some(callback) = &self.callback {
            callback(&self.job);
        }
    }
}

struct Preflight {
    video: VideoEncoderConfig,
    video_track: VideoTrackConfig,
    audio: Option<(AudioEncoderConfig, AudioTrackConfig)>,
}

/// Drives offline exports. One export at a time per pipeline.
pub struct ExportPipeline {
    encoders: Arc<dyn EncoderFactory>,
    audio_loader: Option<Arc<dyn AudioLoader>>,
    exporting: AtomicBool,
    abort: Mutex<AbortSignal>,
}

impl ExportPipeline {
    pub fn new(encoders: Arc<dyn EncoderFactory>) -> Self {
        Self {
            encoders,
            audio_loader: None,
            exporting: AtomicBool::new(false),
            abort: Mutex::new(AbortSignal::new()),
        }
    }

    /// Enable the audio track. Without a loader exports are video-only.
    pub fn with_audio_loader(mut self, loader: Arc<dyn AudioLoader>) -> Self {
        self.audio_loader = Some(loader);
        self
    }

    pub fn is_exporting(&self) -> bool {
        self.exporting.load(Ordering::SeqCst)
    }

    /// Cancel the running export, if any. It unwinds at its next check.
    pub fn cancel(&self) {
        let abort = lock(&self.abort);
        if self.is_exporting() {
            info!("Export cancellation requested");
        }
        abort.abort();
    }

    /// Export `timeline` to `output`.
    ///
    /// Fails immediately with [`CutlineError::ExportInProgress`] while
    /// another export runs on this pipeline.
    pub async fn export(
        &self,
        timeline: &Timeline,
        settings: &ExportSettings,
        output: &Path,
        frames: &mut dyn FrameProvider,
        progress: Option<ExportProgressCallback>,
    ) -> CutlineResult<ExportOutcome> {
        // Claim the pipeline and install a fresh signal under one lock, so a
        // cancel() that sees the export running always aborts this export.
        let (_guard, abort) = {
            let mut current = lock(&self.abort);
            let guard = ExportGuard::acquire(&self.exporting)?;
            let abort = AbortSignal::new();
            *current = abort.clone();
            (guard, abort)
        };

        let fps = settings.fps.max(1);
        let total_frames = frame_count(timeline.total_duration(), fps);
        let mut reporter = JobReporter {
            job: ExportJob::new(total_frames),
            callback: progress,
        };
        reporter.notify();

        info!(
            output = %output.display(),
            total_frames,
            fps,
            width = settings.width,
            height = settings.height,
            mode = ?settings.mux_mode,
            "Starting export"
        );

        let started = Instant::now();
        match self
            .run(timeline, settings, output, frames, &abort, &mut reporter)
            .await
        {
            Ok(mut outcome) => {
                outcome.elapsed = started.elapsed();
                outcome.job = reporter.job.clone();
                info!(
                    path = %outcome.path.display(),
                    frames = outcome.frames_encoded,
                    encode_errors = outcome.encode_errors,
                    bytes = outcome.bytes,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    "Export complete"
                );
                Ok(outcome)
            }
            Err(e) => {
                if e.is_cancelled() {
                    info!(frame = reporter.job.current_frame, "Export cancelled");
                    reporter.advance(ExportPhase::Error, 0.0, "Export cancelled");
                } else {
                    error!(error = %e, frame = reporter.job.current_frame, "Export failed");
                    reporter.advance(ExportPhase::Error, 0.0, e.to_string());
                }
                Err(e)
            }
        }
    }

    async fn preflight(&self, timeline: &Timeline, settings: &ExportSettings) -> CutlineResult<Preflight> {
        let video = VideoEncoderConfig {
            codec: settings.video_codec.clone(),
            width: settings.width,
            height: settings.height,
            fps: settings.fps.max(1),
            bitrate_kbps: settings.video_bitrate_kbps,
        };
        if !self.encoders.is_video_supported(&video).await {
            return Err(CutlineError::unsupported(format!(
                "Video codec {} at {}x{} {}fps is not supported",
                video.codec, video.width, video.height, video.fps
            )));
        }
        let video_track = VideoTrackConfig::from_encoder(&video)?;

        let wants_audio = self.audio_loader.is_some() && timeline.audio_items().next().is_some();
        let audio = if wants_audio {
            let config = AudioEncoderConfig {
                codec: settings.audio_codec.clone(),
                sample_rate: settings.sample_rate,
                channels: settings.channels,
            };
            let supported = self.encoders.is_audio_supported(&config).await;
            match AudioTrackConfig::from_encoder(&config) {
                Ok(track) if supported => Some((config, track)),
                _ => {
                    warn!(codec = %config.codec, "Audio codec not supported, exporting without audio");
                    None
                }
            }
        } else {
            None
        };

        Ok(Preflight {
            video,
            video_track,
            audio,
        })
    }

    async fn run(
        &self,
        timeline: &Timeline,
        settings: &ExportSettings,
        output: &Path,
        frames: &mut dyn FrameProvider,
        abort: &AbortSignal,
        reporter: &mut JobReporter,
    ) -> CutlineResult<ExportOutcome> {
        let total_frames = reporter.job.total_frames;
        if total_frames == 0 {
            return Err(CutlineError::export("Timeline is empty"));
        }
        let preflight = self.preflight(timeline, settings).await?;
        abort.check()?;

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut muxer = Mp4Muxer::create(
            output,
            settings.mux_mode,
            Some(preflight.video_track),
            preflight.audio.as_ref().map(|(_, track)| *track),
        )?;
        let mut encoders = Encoders {
            video: self.encoders.create_video(&preflight.video)?,
            audio: match &preflight.audio {
                Some((config, _)) => Some(self.encoders.create_audio(config)?),
                None => None,
            },
        };

        let fps = preflight.video.fps;
        let keyframe_interval = settings.keyframe_interval.max(1);
        let frame_duration = frame_duration_micros(fps);
        let mut background: Option<RgbaImage> = None;
        let mut frames_encoded = 0u64;
        let mut encode_errors = 0u64;

        for index in 0..total_frames {
            abort.check()?;
            let time = index as f64 / fps as f64;
            let number = index + 1;
            let frame_progress = FRAME_PROGRESS_END * index as f64 / total_frames as f64;

            reporter.job.set_frame(number);
            reporter.advance(
                ExportPhase::Rendering,
                frame_progress,
                format!("Rendering frame {number}/{total_frames}"),
            );
            frames.prepare(time).await?;
            abort.check()?;

            let frame = frames.frame_at(time);
            let timestamp = frame_timestamp_micros(index, fps);
            let key = index % keyframe_interval == 0;
            let encoded = match &frame {
                Some(frame) => encoders.video.encode(frame.image(), timestamp, frame_duration, key),
                None => {
                    let blank = background.get_or_insert_with(|| {
                        RgbaImage::from_pixel(settings.width, settings.height, Rgba([0, 0, 0, 255]))
                    });
                    encoders.video.encode(blank, timestamp, frame_duration, key)
                }
            };
            drop(frame);

            match encoded {
                Ok(chunks) => {
                    for chunk in &chunks {
                        muxer.add_video_chunk(chunk)?;
                    }
                    frames_encoded += 1;
                }
                Err(e) => {
                    encode_errors += 1;
                    warn!(frame = index, error = %e, "Video encode failed, continuing");
                }
            }
            reporter.advance(
                ExportPhase::Encoding,
                FRAME_PROGRESS_END * number as f64 / total_frames as f64,
                format!("Encoding frame {number}/{total_frames}"),
            );
            tokio::task::yield_now().await;
        }

        let audio = match (encoders.audio.as_mut(), &preflight.audio, &self.audio_loader) {
            (Some(encoder), Some((config, _)), Some(loader)) => {
                reporter.advance(ExportPhase::Encoding, FRAME_PROGRESS_END, "Mixing audio");
                let mix = render_timeline_audio(
                    timeline,
                    loader.as_ref(),
                    config.sample_rate,
                    config.channels,
                    abort,
                )
                .await?;

                let channels = config.channels.max(1) as usize;
                for (block, samples) in mix.buffer.samples.chunks(AUDIO_BLOCK_FRAMES * channels).enumerate() {
                    abort.check()?;
                    let first_frame = (block * AUDIO_BLOCK_FRAMES) as i64;
                    let timestamp = first_frame * 1_000_000 / config.sample_rate.max(1) as i64;
                    match encoder.encode(samples, timestamp) {
                        Ok(chunks) => {
                            for chunk in &chunks {
                                muxer.add_audio_chunk(chunk)?;
                            }
                        }
                        Err(e) => warn!(block, error = %e, "Audio encode failed, continuing"),
                    }
                }
                reporter.advance(ExportPhase::Encoding, AUDIO_PROGRESS_END, "Audio encoded");
                Some(AudioSummary {
                    clips_mixed: mix.mixed,
                    clips_skipped: mix.skipped,
                })
            }
            _ => None,
        };

        abort.check()?;
        match encoders.video.flush().await {
            Ok(chunks) => {
                for chunk in &chunks {
                    muxer.add_video_chunk(chunk)?;
                }
            }
            Err(e) => warn!(error = %e, "Video encoder flush failed"),
        }
        if let Some(encoder) = encoders.audio.as_mut() {
            match encoder.flush().await {
                Ok(chunks) => {
                    for chunk in &chunks {
                        muxer.add_audio_chunk(chunk)?;
                    }
                }
                Err(e) => warn!(error = %e, "Audio encoder flush failed"),
            }
        }
        drop(encoders);

        if frames_encoded == 0 {
            return Err(CutlineError::encode("No frame could be encoded"));
        }

        abort.check()?;
        reporter.advance(ExportPhase::Muxing, MUX_PROGRESS, "Muxing");
        abort.check()?;
        reporter.advance(ExportPhase::Finalizing, FINALIZE_PROGRESS, "Finalizing");
        let path = muxer.finalize()?;
        let bytes = std::fs::metadata(&path)?.len();
        reporter.advance(ExportPhase::Complete, 100.0, "Export complete");

        Ok(ExportOutcome {
            path,
            job: reporter.job.clone(),
            frames_encoded,
            encode_errors,
            audio,
            bytes,
            elapsed: Duration::ZERO,
        })
    }
}
