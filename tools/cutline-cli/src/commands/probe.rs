//! Load one source and print its metadata.

use std::sync::Arc;
use std::time::Duration;

use cutline_common::config::EngineConfig;
use cutline_decode_engine::{CoordinatorCallbacks, DecodeCoordinator};

use super::CliDecoderFactory;

const PROBE_SOURCE_ID: &str = "probe";
const FRAME_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run(config: &EngineConfig, url: String, frame_at: Option<f64>, json: bool) -> anyhow::Result<()> {
    let errors = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
    let sink = errors.clone();
    let coordinator = DecodeCoordinator::builder(Arc::new(CliDecoderFactory::new(&config.decode)))
        .config(config.clone())
        .callbacks(CoordinatorCallbacks::default().on_error(move |_, message| {
            if let Ok(mut errors) = sink.lock() {
                errors.push(message.to_string());
            }
        }))
        .build();

    let Some(metadata) = coordinator.load_video(PROBE_SOURCE_ID, &url).await else {
        let detail = coordinator
            .load_error(PROBE_SOURCE_ID)
            .or_else(|| errors.lock().ok().and_then(|errors| errors.last().cloned()))
            .unwrap_or_else(|| "unknown error".to_string());
        coordinator.destroy().await;
        return Err(anyhow::anyhow!("Failed to load {url}: {detail}"));
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&metadata)?);
    } else {
        println!("Source: {url}");
        println!("  Duration: {:.3}s", metadata.duration);
        println!("  Resolution: {}x{}", metadata.width, metadata.height);
        println!("  Frame rate: {:.3} fps ({} frames)", metadata.frame_rate, metadata.frame_count());
        println!("  Video stream: {}", if metadata.has_video { "yes" } else { "no" });
        println!("  Audio stream: {}", if metadata.has_audio { "yes" } else { "no" });
    }

    if let Some(time) = frame_at {
        let time = metadata.clamp_time(time);
        match coordinator.ensure_frame(PROBE_SOURCE_ID, time, FRAME_TIMEOUT).await {
            Some(frame) => {
                let center = frame.image().get_pixel(frame.width() / 2, frame.height() / 2);
                println!(
                    "  Frame @ {time:.3}s: {}x{} (decoded at {:.3}s, center rgba {:?})",
                    frame.width(),
                    frame.height(),
                    frame.timestamp(),
                    center.0
                );
            }
            None => println!("  Frame @ {time:.3}s: not decoded within {}s", FRAME_TIMEOUT.as_secs()),
        }
        let stats = coordinator.cache_stats();
        tracing::debug!(?stats, "Frame cache after probe");
    }

    coordinator.destroy().await;
    Ok(())
}
