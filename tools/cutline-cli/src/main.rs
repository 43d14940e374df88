//! Cutline CLI: command-line access to the decode, render, and export core.
//!
//! Usage:
//!   cutline probe <URL>                    Load a source and print its metadata
//!   cutline export <TIMELINE> -o <OUT>     Export a timeline JSON to MP4
//!   cutline check                          Check system capabilities
//!   cutline poll <JOB_ID>                  Poll a server-side export job
//!   cutline generate <KIND> <PROMPT>       Submit a generation and wait for it

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use cutline_common::config::EngineConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "cutline",
    about = "Timeline decoding, compositing, and MP4 export",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to $XDG_CONFIG_HOME/cutline/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a media source through the decode coordinator and print its metadata
    Probe {
        /// Media URL or path (`synthetic://WxH@FPS/SECS` for a generated source)
        url: String,

        /// Also decode the frame at this time (seconds)
        #[arg(long)]
        frame_at: Option<f64>,

        /// Print metadata as JSON
        #[arg(long)]
        json: bool,
    },

    /// Export a timeline to an MP4 file
    Export {
        /// Path to the timeline JSON
        timeline: PathBuf,

        /// Output file path
        #[arg(short, long, default_value = "output.mp4")]
        output: PathBuf,

        /// Output frame rate (defaults to config)
        #[arg(long)]
        fps: Option<u32>,

        /// Output width (defaults to config)
        #[arg(long)]
        width: Option<u32>,

        /// Output height (defaults to config)
        #[arg(long)]
        height: Option<u32>,

        /// Write a fragmented MP4 (moof/mdat) instead of a single moov
        #[arg(long)]
        fragmented: bool,

        /// Skip the audio track
        #[arg(long)]
        no_audio: bool,
    },

    /// Check system capabilities
    Check {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Poll a server-side export job until it finishes
    Poll {
        /// Export job id
        job_id: String,

        /// API base URL (defaults to config)
        #[arg(long)]
        api: Option<String>,
    },

    /// Submit a generation request and wait for the result
    Generate {
        /// Kind of media: video, image, music, voice
        kind: String,

        /// Generation prompt
        prompt: String,

        /// API base URL (defaults to config)
        #[arg(long)]
        api: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load_from(path),
        None => EngineConfig::load(),
    };

    // Initialize logging
    let mut logging = config.logging.clone();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    cutline_common::logging::init_logging(&logging);

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid config: {e}"))?;

    match cli.command {
        Commands::Probe {
            url,
            frame_at,
            json,
        } => commands::probe::run(&config, url, frame_at, json).await,
        Commands::Export {
            timeline,
            output,
            fps,
            width,
            height,
            fragmented,
            no_audio,
        } => {
            commands::export::run(
                &config,
                timeline,
                output,
                commands::export::Overrides {
                    fps,
                    width,
                    height,
                    fragmented,
                    audio: !no_audio,
                },
            )
            .await
        }
        Commands::Check { json } => commands::check::run(&config, json).await,
        Commands::Poll { job_id, api } => commands::poll::run_export(&config, job_id, api).await,
        Commands::Generate { kind, prompt, api } => {
            commands::poll::run_generation(&config, kind, prompt, api).await
        }
    }
}
