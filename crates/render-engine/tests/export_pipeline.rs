use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use proptest::prelude::*;

use cutline_common::config::{ExportSettings, MuxMode};
use cutline_common::error::{CutlineError, CutlineResult};
use cutline_project_model::{ClipKind, ClipSettings, ExportJob, ExportPhase, Timeline, TimelineItem};
use cutline_render_engine::{
    AudioBuffer, AudioEncoder, AudioEncoderConfig, AudioLoader, AudioSummary, EncodedChunk, EncoderFactory,
    ExportPipeline, FrameProvider, PcmEncoder, RenderedFrame, SoftwareEncoderFactory, VideoEncoder,
    VideoEncoderConfig,
};

fn clip(id: &str, kind: ClipKind, url: Option<&str>, start: f64, duration: f64) -> TimelineItem {
    TimelineItem {
        id: id.to_string(),
        kind,
        url: url.map(str::to_string),
        start_time: start,
        duration,
        order: 0,
        trim: None,
        speed: None,
        settings: ClipSettings::default(),
        transition: None,
        text: None,
        position: None,
    }
}

fn settings(width: u32, height: u32, fps: u32) -> ExportSettings {
    ExportSettings {
        width,
        height,
        fps,
        ..ExportSettings::default()
    }
}

fn temp_output(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("cutline-it-{}-{name}.mp4", std::process::id()))
}

fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap().to_os_string();
    name.push(".partial");
    output.with_file_name(name)
}

fn top_level_boxes(data: &[u8]) -> Vec<String> {
    let mut kinds = Vec::new();
    let mut pos = 0;
    while pos + 8 <= data.len() {
        let size = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        kinds.push(String::from_utf8_lossy(&data[pos + 4..pos + 8]).to_string());
        pos += size;
    }
    kinds
}

fn count_occurrences(data: &[u8], needle: &[u8]) -> usize {
    data.windows(needle.len()).filter(|w| *w == needle).count()
}

/// Video encoder that tracks how many instances are alive and fails on
/// selected frame indices.
struct ScriptedVideoEncoder {
    config: VideoEncoderConfig,
    live: Arc<AtomicIsize>,
    fail: Arc<dyn Fn(u64) -> bool + Send + Sync>,
    index: u64,
}

#[async_trait]
impl VideoEncoder for ScriptedVideoEncoder {
    fn config(&self) -> &VideoEncoderConfig {
        &self.config
    }

    fn encode(
        &mut self,
        _frame: &RgbaImage,
        timestamp_us: i64,
        duration_us: i64,
        key_frame: bool,
    ) -> CutlineResult<Vec<EncodedChunk>> {
        let index = self.index;
        self.index += 1;
        if (self.fail)(index) {
            return Err(CutlineError::encode(format!("scripted failure at {index}")));
        }
        Ok(vec![EncodedChunk {
            data: vec![0xFF, 0xD8, index as u8, 0xD9],
            timestamp_us,
            duration_us,
            is_key: key_frame,
        }])
    }

    async fn flush(&mut self) -> CutlineResult<Vec<EncodedChunk>> {
        Ok(Vec::new())
    }
}

impl Drop for ScriptedVideoEncoder {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ScriptedFactory {
    live: Arc<AtomicIsize>,
    created: Arc<AtomicUsize>,
    fail: Arc<dyn Fn(u64) -> bool + Send + Sync>,
}

impl ScriptedFactory {
    fn new(fail: impl Fn(u64) -> bool + Send + Sync + 'static) -> Self {
        Self {
            live: Arc::new(AtomicIsize::new(0)),
            created: Arc::new(AtomicUsize::new(0)),
            fail: Arc::new(fail),
        }
    }
}

#[async_trait]
impl EncoderFactory for ScriptedFactory {
    async fn is_video_supported(&self, config: &VideoEncoderConfig) -> bool {
        config.codec == "mjpeg"
    }

    async fn is_audio_supported(&self, config: &AudioEncoderConfig) -> bool {
        config.codec == "pcm-s16"
    }

    fn create_video(&self, config: &VideoEncoderConfig) -> CutlineResult<Box<dyn VideoEncoder>> {
        self.live.fetch_add(1, Ordering::SeqCst);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedVideoEncoder {
            config: config.clone(),
            live: self.live.clone(),
            fail: self.fail.clone(),
            index: 0,
        }))
    }

    fn create_audio(&self, config: &AudioEncoderConfig) -> CutlineResult<Box<dyn AudioEncoder>> {
        Ok(Box::new(PcmEncoder::new(config.clone())?))
    }
}

/// Serves a constant tone for known URLs.
struct ToneLoader;

#[async_trait]
impl AudioLoader for ToneLoader {
    async fn load(&self, url: &str, sample_rate: u32, channels: u16) -> CutlineResult<AudioBuffer> {
        if !url.starts_with("tone://") {
            return Err(CutlineError::audio(format!("cannot fetch {url}")));
        }
        Ok(AudioBuffer {
            sample_rate,
            channels,
            samples: vec![0.25; sample_rate as usize * channels as usize],
        })
    }
}

fn record_jobs(sink: Arc<Mutex<Vec<ExportJob>>>) -> Box<dyn Fn(&ExportJob) + Send + Sync> {
    Box::new(move |job: &ExportJob| sink.lock().unwrap().push(job.clone()))
}

#[tokio::test]
async fn cancelling_three_clip_export_midway_leaves_nothing_behind() {
    let timeline = Timeline::new(vec![
        clip("a", ClipKind::Video, Some("synthetic://16x9@30/3"), 0.0, 3.0),
        clip("b", ClipKind::Video, Some("synthetic://16x9@30/3"), 3.0, 3.0),
        clip("c", ClipKind::Video, Some("synthetic://16x9@30/3"), 6.0, 3.0),
    ]);
    let factory = ScriptedFactory::new(|_| false);
    let live = factory.live.clone();
    let created = factory.created.clone();
    let pipeline = Arc::new(ExportPipeline::new(Arc::new(factory)));

    let rendered = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicUsize::new(0));
    let mut provider = {
        let pipeline = pipeline.clone();
        let rendered = rendered.clone();
        let released = released.clone();
        move |time: f64| {
            let index = (time * 30.0).round() as u64;
            if index == 135 {
                pipeline.cancel();
            }
            rendered.fetch_add(1, Ordering::SeqCst);
            let released = released.clone();
            Some(
                RenderedFrame::new(RgbaImage::from_pixel(16, 9, Rgba([9, 9, 9, 255]))).with_release(move || {
                    released.fetch_add(1, Ordering::SeqCst);
                }),
            )
        }
    };

    let jobs = Arc::new(Mutex::new(Vec::new()));
    let output = temp_output("cancel");
    let err = pipeline
        .export(
            &timeline,
            &settings(16, 9, 30),
            &output,
            &mut provider,
            Some(record_jobs(jobs.clone())),
        )
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(rendered.load(Ordering::SeqCst), 136);
    assert_eq!(released.load(Ordering::SeqCst), 136);
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(live.load(Ordering::SeqCst), 0, "encoder released before return");
    assert!(!output.exists());
    assert!(!partial_path(&output).exists());
    assert!(!pipeline.is_exporting());

    let jobs = jobs.lock().unwrap();
    assert_eq!(jobs[0].total_frames, 270);
    let last = jobs.last().unwrap();
    assert_eq!(last.phase, ExportPhase::Error);
    assert_eq!(last.message, "Export cancelled");
    assert_eq!(last.current_frame, 136);
}

#[tokio::test]
async fn unsupported_codec_fails_before_any_frame() {
    let timeline = Timeline::new(vec![clip("a", ClipKind::Text, None, 0.0, 2.0)]);
    let pipeline = ExportPipeline::new(Arc::new(SoftwareEncoderFactory));
    let calls = Arc::new(AtomicUsize::new(0));
    let mut provider = {
        let calls = calls.clone();
        move |_time: f64| -> Option<RenderedFrame> {
            calls.fetch_add(1, Ordering::SeqCst);
            None
        }
    };

    let mut config = settings(16, 9, 30);
    config.video_codec = "avc1.42001f".to_string();
    let jobs = Arc::new(Mutex::new(Vec::new()));
    let output = temp_output("unsupported");
    let err = pipeline
        .export(&timeline, &config, &output, &mut provider, Some(record_jobs(jobs.clone())))
        .await
        .unwrap_err();

    assert!(err.is_unsupported());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!partial_path(&output).exists());
    let jobs = jobs.lock().unwrap();
    assert_eq!(jobs.last().unwrap().phase, ExportPhase::Error);
    assert!(jobs.iter().all(|job| job.current_frame == 0));
}

/// Starts a second export on the same pipeline from inside the first.
struct ReentrantProvider {
    pipeline: Arc<ExportPipeline>,
    nested: Option<bool>,
}

#[async_trait]
impl FrameProvider for ReentrantProvider {
    async fn prepare(&mut self, _time: f64) -> CutlineResult<()> {
        if self.nested.is_none() {
            let timeline = Timeline::new(vec![clip("x", ClipKind::Text, None, 0.0, 1.0)]);
            let mut inner = |_time: f64| -> Option<RenderedFrame> { None };
            let result = self
                .pipeline
                .export(&timeline, &settings(16, 9, 10), &temp_output("nested"), &mut inner, None)
                .await;
            self.nested = Some(matches!(result, Err(CutlineError::ExportInProgress)));
        }
        Ok(())
    }

    fn frame_at(&mut self, _time: f64) -> Option<RenderedFrame> {
        None
    }
}

#[tokio::test]
async fn concurrent_export_is_rejected_not_queued() {
    let pipeline = Arc::new(ExportPipeline::new(Arc::new(SoftwareEncoderFactory)));
    let timeline = Timeline::new(vec![clip("a", ClipKind::Text, None, 0.0, 0.5)]);
    let mut provider = ReentrantProvider {
        pipeline: pipeline.clone(),
        nested: None,
    };
    let output = temp_output("reentrant");
    let outcome = pipeline
        .export(&timeline, &settings(16, 9, 10), &output, &mut provider, None)
        .await
        .unwrap();
    assert_eq!(provider.nested, Some(true));
    assert!(!temp_output("nested").exists());
    assert_eq!(outcome.frames_encoded, 5);
    std::fs::remove_file(&outcome.path).unwrap();

    // The guard is released, so the pipeline is reusable.
    let mut provider = |_time: f64| -> Option<RenderedFrame> { None };
    let outcome = pipeline
        .export(&timeline, &settings(16, 9, 10), &output, &mut provider, None)
        .await
        .unwrap();
    std::fs::remove_file(&outcome.path).unwrap();
}

#[tokio::test]
async fn fragmented_export_mixes_audio_and_skips_broken_clips() {
    let timeline = Timeline::new(vec![
        clip("v", ClipKind::Video, Some("tone://video"), 0.0, 2.0),
        clip("music", ClipKind::Audio, Some("tone://music"), 0.5, 1.0),
        clip("broken", ClipKind::Audio, Some("https://example.invalid/a.mp3"), 1.0, 1.0),
    ]);
    let pipeline = ExportPipeline::new(Arc::new(SoftwareEncoderFactory)).with_audio_loader(Arc::new(ToneLoader));
    let mut config = settings(32, 18, 15);
    config.mux_mode = MuxMode::Fragmented;
    let mut provider = |_time: f64| Some(RenderedFrame::new(RgbaImage::from_pixel(32, 18, Rgba([0, 128, 255, 255]))));

    let output = temp_output("fragmented-audio");
    let outcome = pipeline
        .export(&timeline, &config, &output, &mut provider, None)
        .await
        .unwrap();

    assert_eq!(outcome.frames_encoded, 30);
    assert_eq!(
        outcome.audio,
        Some(AudioSummary {
            clips_mixed: 2,
            clips_skipped: 1
        })
    );
    assert_eq!(outcome.job.phase, ExportPhase::Complete);
    assert_eq!(outcome.job.progress, 100.0);

    let data = std::fs::read(&outcome.path).unwrap();
    let kinds = top_level_boxes(&data);
    assert_eq!(&kinds[..2], &["ftyp".to_string(), "moov".to_string()]);
    assert!(kinds.iter().filter(|kind| *kind == "moof").count() >= 2);
    assert_eq!(
        kinds.iter().filter(|kind| *kind == "moof").count(),
        kinds.iter().filter(|kind| *kind == "mdat").count()
    );
    assert_eq!(count_occurrences(&data, b"trex"), 2);
    assert_eq!(count_occurrences(&data, b"sowt"), 1);
    std::fs::remove_file(&outcome.path).unwrap();
}

fn run_with_failures(pattern: Vec<bool>) -> (CutlineResult<u64>, usize, usize) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async move {
        let frames = pattern.len();
        let timeline = Timeline::new(vec![clip("t", ClipKind::Text, None, 0.0, frames as f64 / 10.0)]);
        let failures = Arc::new(pattern);
        let factory = ScriptedFactory::new({
            let failures = failures.clone();
            move |index| failures.get(index as usize).copied().unwrap_or(false)
        });
        let live = factory.live.clone();
        let pipeline = ExportPipeline::new(Arc::new(factory));

        let provided = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicUsize::new(0));
        let mut provider = {
            let provided = provided.clone();
            let released = released.clone();
            move |_time: f64| {
                provided.fetch_add(1, Ordering::SeqCst);
                let released = released.clone();
                Some(RenderedFrame::new(RgbaImage::new(8, 8)).with_release(move || {
                    released.fetch_add(1, Ordering::SeqCst);
                }))
            }
        };
        let output = std::env::temp_dir().join(format!(
            "cutline-it-{}-fuzz-{}.mp4",
            std::process::id(),
            frames
        ));
        let result = pipeline
            .export(&timeline, &settings(8, 8, 10), &output, &mut provider, None)
            .await;
        assert_eq!(live.load(Ordering::SeqCst), 0);
        let result = result.map(|outcome| {
            let _ = std::fs::remove_file(&outcome.path);
            outcome.encode_errors
        });
        (
            result,
            provided.load(Ordering::SeqCst),
            released.load(Ordering::SeqCst),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn every_rendered_frame_is_released_exactly_once(pattern in proptest::collection::vec(any::<bool>(), 1..40)) {
        let frames = pattern.len();
        let failures = pattern.iter().filter(|failed| **failed).count();
        let (result, provided, released) = run_with_failures(pattern);

        prop_assert_eq!(provided, frames);
        prop_assert_eq!(released, provided);
        if failures == frames {
            prop_assert!(result.is_err());
        } else {
            prop_assert_eq!(result.ok(), Some(failures as u64));
        }
    }
}
