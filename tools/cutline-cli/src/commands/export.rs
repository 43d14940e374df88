//! Export a timeline to video.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cutline_common::config::{CompositorConfig, EngineConfig, MuxMode};
use cutline_decode_engine::DecodeCoordinator;
use cutline_project_model::{ClipKind, ExportJob, ExportPhase, Timeline};
use cutline_render_engine::{
    CompositorFrameProvider, ExportPipeline, ExportProgressCallback, FfmpegAudioLoader, LayerCompositor,
    RgbaCanvas, SoftwareEncoderFactory,
};

/// How long a frame may take to decode before the closest cached one is used.
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Command-line overrides of the configured export settings.
#[derive(Debug, Clone, Copy)]
pub struct Overrides {
    pub fps: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fragmented: bool,
    pub audio: bool,
}

pub async fn run(config: &EngineConfig, path: PathBuf, output: PathBuf, overrides: Overrides) -> anyhow::Result<()> {
    println!("Exporting timeline: {}", path.display());

    let json = std::fs::read_to_string(&path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;
    let timeline = Timeline::from_json(&json).map_err(|e| anyhow::anyhow!("Failed to load timeline: {e}"))?;

    let mut settings = config.export.clone();
    settings.fps = overrides.fps.unwrap_or(settings.fps);
    settings.width = overrides.width.unwrap_or(settings.width);
    settings.height = overrides.height.unwrap_or(settings.height);
    if overrides.fragmented {
        settings.mux_mode = MuxMode::Fragmented;
    }
    if settings.fps == 0 || settings.width == 0 || settings.height == 0 {
        return Err(anyhow::anyhow!("fps, width and height must be > 0"));
    }

    println!("  Output: {}", output.display());
    println!(
        "  Resolution: {}x{} @ {}fps ({:?})",
        settings.width, settings.height, settings.fps, settings.mux_mode
    );
    println!(
        "  Items: {} ({:.2}s)",
        timeline.items.len(),
        timeline.total_duration()
    );

    let coordinator = Arc::new(DecodeCoordinator::new(
        Arc::new(super::CliDecoderFactory::new(&config.decode)),
        config.clone(),
    ));
    for item in timeline.items.iter().filter(|item| item.kind == ClipKind::Video) {
        let Some(url) = item.url.as_deref() else {
            continue;
        };
        match coordinator.load_video(&item.id, url).await {
            Some(metadata) => tracing::info!(
                item = %item.id,
                width = metadata.width,
                height = metadata.height,
                duration = metadata.duration,
                "Video source loaded"
            ),
            None => {
                let detail = coordinator.load_error(&item.id).unwrap_or_default();
                println!("  [WARN] {}: could not load {url} {detail}", item.id);
            }
        }
    }

    let compositor_config = CompositorConfig {
        width: settings.width,
        height: settings.height,
        fps: settings.fps,
        ..config.compositor.clone()
    };
    let mut compositor = LayerCompositor::new(RgbaCanvas::new(settings.width, settings.height), compositor_config)
        .with_frame_source(coordinator.clone());
    compositor.set_layers(timeline.layers());
    let mut provider = CompositorFrameProvider::new(compositor).with_coordinator(coordinator.clone(), FRAME_TIMEOUT);

    let mut pipeline = ExportPipeline::new(Arc::new(SoftwareEncoderFactory));
    if overrides.audio {
        pipeline = pipeline.with_audio_loader(Arc::new(FfmpegAudioLoader::new(&config.decode)));
    }
    let pipeline = Arc::new(pipeline);

    let cancel = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\n  Cancelling...");
                pipeline.cancel();
            }
        })
    };

    let progress_cb: ExportProgressCallback = Box::new(|job: &ExportJob| {
        if job.phase == ExportPhase::Error {
            return;
        }
        print!(
            "\r  Progress: {:5.1}% ({}/{} frames) {:<40}",
            job.progress, job.current_frame, job.total_frames, job.message
        );
        std::io::stdout().flush().ok();
    });

    let result = pipeline
        .export(&timeline, &settings, &output, &mut provider, Some(progress_cb))
        .await;
    cancel.abort();
    coordinator.destroy().await;

    match result {
        Ok(outcome) => {
            println!("\nExport complete: {}", outcome.path.display());
            println!(
                "  Frames: {} encoded, {} failed",
                outcome.frames_encoded, outcome.encode_errors
            );
            match outcome.audio {
                Some(audio) => println!(
                    "  Audio: {} clips mixed, {} skipped",
                    audio.clips_mixed, audio.clips_skipped
                ),
                None => println!("  Audio: none"),
            }
            println!(
                "  Size: {:.2} MiB in {:.1}s",
                outcome.bytes as f64 / (1024.0 * 1024.0),
                outcome.elapsed.as_secs_f64()
            );
            Ok(())
        }
        Err(e) if e.is_cancelled() => {
            println!("\nExport cancelled");
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("Export failed: {e}")),
    }
}
