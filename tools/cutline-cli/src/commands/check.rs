//! Check system capabilities.

use serde::Serialize;

use cutline_common::config::EngineConfig;
use cutline_decode_engine::binary_available;
use cutline_render_engine::{AudioEncoderConfig, EncoderFactory, SoftwareEncoderFactory, VideoEncoderConfig};

#[derive(Debug, Serialize)]
struct Capability {
    name: String,
    available: bool,
    required: bool,
    detail: String,
}

#[derive(Debug, Serialize)]
struct CheckReport {
    capabilities: Vec<Capability>,
    ready: bool,
}

pub async fn run(config: &EngineConfig, json: bool) -> anyhow::Result<()> {
    let mut capabilities = Vec::new();

    for (name, binary) in [
        ("ffmpeg", &config.decode.ffmpeg_path),
        ("ffprobe", &config.decode.ffprobe_path),
    ] {
        let available = binary_available(binary).await;
        capabilities.push(Capability {
            name: name.to_string(),
            available,
            required: true,
            detail: if available {
                format!("{binary} runs")
            } else {
                format!("{binary} not found; install ffmpeg or set decode.{name}_path")
            },
        });
    }

    let factory = SoftwareEncoderFactory;
    let export = &config.export;
    let video = VideoEncoderConfig {
        codec: export.video_codec.clone(),
        width: export.width,
        height: export.height,
        fps: export.fps,
        bitrate_kbps: export.video_bitrate_kbps,
    };
    let video_ok = factory.is_video_supported(&video).await;
    capabilities.push(Capability {
        name: "video encoder".to_string(),
        available: video_ok,
        required: true,
        detail: format!("{} {}x{} @ {}fps", video.codec, video.width, video.height, video.fps),
    });

    let audio = AudioEncoderConfig {
        codec: export.audio_codec.clone(),
        sample_rate: export.sample_rate,
        channels: export.channels,
    };
    let audio_ok = factory.is_audio_supported(&audio).await;
    capabilities.push(Capability {
        name: "audio encoder".to_string(),
        available: audio_ok,
        required: false,
        detail: format!("{} {} Hz x{}", audio.codec, audio.sample_rate, audio.channels),
    });

    let ready = capabilities.iter().filter(|c| c.required).all(|c| c.available);
    let report = CheckReport { capabilities, ready };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Cutline System Check");
    println!("{}", "=".repeat(50));
    for capability in &report.capabilities {
        let tag = match (capability.available, capability.required) {
            (true, _) => "[OK]  ",
            (false, true) => "[FAIL]",
            (false, false) => "[WARN]",
        };
        println!("{tag} {}: {}", capability.name, capability.detail);
    }

    println!();
    if report.ready {
        println!("All required capabilities are available. Cutline is ready.");
    } else {
        println!("Some required capabilities are missing. See above for fixes.");
    }

    Ok(())
}
