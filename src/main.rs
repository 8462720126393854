use camrelay::{
    camera::SystemStreamOpener,
    common::Config,
    core::{FaceDetect, OnnxFaceDetector, QualityReport},
    service::{CameraSupervisor, HttpTransport, Shutdown},
    OnnxDetectorFactory, StreamOpener,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "camrelay")]
#[command(about = "Samples camera streams and relays frames with faces to a collector")]
struct Cli {
    /// Path to the configuration file (.json or .toml)
    #[arg(short, long, global = true, default_value = "config.json")]
    config: PathBuf,

    /// Verbose logging with source locations and thread ids
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every configured camera until interrupted
    Run,
    /// Load and validate the configuration, then exit
    CheckConfig,
    /// Grab one frame from a camera and report its quality
    Probe {
        #[arg(short = 'i', long)]
        camera: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = Config::load_from_path(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    match cli.command {
        Commands::Run => run(config),
        Commands::CheckConfig => {
            println!("Configuration OK: {}", cli.config.display());
            println!("  server_url:  {}", config.settings.server_url);
            println!("  sample_rate: {}", config.settings.sample_rate);
            println!("  frames_dir:  {}", config.settings.frames_dir.display());
            println!("  cameras:     {}", config.cameras.len());
            for camera in &config.cameras {
                println!("    - {} ({})", camera.id, camrelay::camera::ffmpeg::redact(&camera.url));
            }
            Ok(())
        }
        Commands::Probe { camera } => probe(config, &camera),
    }
}

fn run(config: Config) -> Result<()> {
    let (cameras, settings) = config.into_parts();

    let opener = Arc::new(SystemStreamOpener::new(settings.capture.clone()));
    let detectors = Arc::new(OnnxDetectorFactory::new(settings.detector.clone()));
    let transport = Arc::new(HttpTransport::new(&settings.upload)?);
    let shutdown = Shutdown::new();

    let handler_shutdown = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown requested");
        handler_shutdown.request();
    })
    .context("Failed to install signal handler")?;

    let supervisor = CameraSupervisor::new(cameras, settings, opener, detectors, transport, shutdown)?;
    supervisor.run()?;

    tracing::info!("All camera workers stopped");
    Ok(())
}

fn probe(config: Config, camera_id: &str) -> Result<()> {
    let (cameras, settings) = config.into_parts();
    let Some(camera) = cameras.iter().find(|c| c.id == camera_id) else {
        bail!("No camera with id '{}' in config", camera_id);
    };

    println!("Opening {}...", camrelay::camera::ffmpeg::redact(&camera.url));
    let opener = SystemStreamOpener::new(settings.capture.clone());
    let mut stream = opener.open(&camera.url)?;

    let Some(frame) = stream.read_frame()? else {
        bail!("Stream ended before the first frame");
    };
    println!("Frame: {}x{}", frame.width(), frame.height());

    let report = QualityReport::assess(&frame, &settings.quality)?;
    println!("  blur score: {:.1} (threshold {}){}",
        report.blur_score,
        settings.quality.blur_threshold,
        if report.blurry { " BLURRY" } else { "" });
    println!("  brightness: {:.1} (threshold {}){}",
        report.brightness,
        settings.quality.low_light_threshold,
        if report.low_light { " LOW LIGHT" } else { "" });

    match OnnxFaceDetector::new(&settings.detector) {
        Ok(mut detector) => {
            let faces = detector.detect(&frame)?;
            println!("  faces:      {}", faces.len());
            for face in &faces {
                println!("    [{:.0}, {:.0}, {:.0}, {:.0}] confidence {:.2}",
                    face.x1, face.y1, face.x2, face.y2, face.confidence);
            }
        }
        Err(e) => println!("  faces:      skipped ({})", e),
    }

    Ok(())
}

fn setup_logging(verbose: bool) {
    if verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camrelay=info")),
            )
            .init();
    }
}
