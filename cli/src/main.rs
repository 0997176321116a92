use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use jersey_core::{
    attribution::AttributionConfig,
    events::{read_events, write_submission},
    pipeline::{EventProcessor, ModelPaths, Mode, Models},
    runtime::{configure_ort_dylib, Device},
    tracking::TrackerConfig,
    video::FfmpegVideo,
};

/// Recognizer picked up from the working directory when none is given.
const DEFAULT_OCR_MODEL: &str = "parseq.onnx";

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "jersey-attrib",
    version,
    about = "Attribute match events to players by jersey number",
    long_about = None
)]
struct Cli {
    /// Event log CSV with `timestamp` and `event` columns
    events: PathBuf,

    /// Match video
    #[arg(short, long, default_value = "match_clip_01.mp4")]
    video: PathBuf,

    /// Output submission CSV
    #[arg(short, long, default_value = "submission.csv")]
    output: PathBuf,

    /// YOLOv8 ONNX model path
    #[arg(long, default_value = "yolov8n.onnx")]
    detector_model: PathBuf,

    /// PARSeq ONNX model path (defaults to ./parseq.onnx when present)
    #[arg(long)]
    ocr_model: Option<PathBuf>,

    /// ViTPose ONNX model path; enables torso-guided crops
    #[arg(long)]
    pose_model: Option<PathBuf>,

    /// Inference device: cpu, cuda or coreml
    #[arg(long, default_value = "cpu")]
    device: Device,

    /// Seconds of video on each side of an event
    #[arg(long, default_value_t = 1.0)]
    window: f64,

    /// Tracker association gate in pixels
    #[arg(long, default_value_t = 30.0)]
    distance_threshold: f32,

    /// Use one frame per event without tracking
    #[arg(long)]
    single_frame: bool,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    configure_ort_dylib();

    let cli = Cli::parse();
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    info!("Jersey attribution");
    info!("  events : {}", cli.events.display());
    info!("  video  : {}", cli.video.display());
    info!("  output : {}", cli.output.display());

    let log = read_events(&cli.events)?;

    let paths = ModelPaths {
        detector: cli.detector_model.clone(),
        recognizer: cli.ocr_model.clone().or_else(|| existing(DEFAULT_OCR_MODEL)),
        pose: cli.pose_model.clone(),
        device: cli.device,
    };
    let config = AttributionConfig {
        half_window: cli.window,
        tracker: TrackerConfig {
            distance_threshold: cli.distance_threshold,
            ..TrackerConfig::default()
        },
    };
    let engine = Models::load(&paths)
        .with_context(|| format!("failed to load models from {}", paths.detector.display()))?
        .into_engine(config)?;

    let mode = if cli.single_frame {
        Mode::SingleFrame
    } else {
        Mode::Window
    };
    let video = FfmpegVideo::new(&cli.video);
    let mut processor = EventProcessor::new(engine, &video, mode);

    let pb = progress(log.events.len() as u64)?;
    let rows = processor.process_all(&log.events, |row| {
        pb.set_message(format!("{} {}", row.timestamp, row.event));
        pb.inc(1);
    });
    pb.finish_with_message("Done.");

    write_submission(&cli.output, &rows)?;
    processor.log_summary();
    if log.skipped > 0 {
        tracing::warn!(skipped = log.skipped, "rows with malformed timestamps were skipped");
    }
    info!("Predictions written to {}", cli.output.display());
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn existing(path: &str) -> Option<PathBuf> {
    let path = Path::new(path);
    path.is_file().then(|| path.to_path_buf())
}

fn progress(len: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} [{elapsed_precise}] {bar:30.cyan/blue} {pos}/{len} {msg}",
        )
        .context("invalid progress template")?
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    Ok(pb)
}
