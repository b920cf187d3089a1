use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use thermofuse_core::detector::DEFAULT_SCORE_THRESHOLD;
use thermofuse_core::{Detector, NoDetector, ScrfdDetector};
use thermofuse_hw::{UvcThermal, V4lColorCamera};
use tracing_subscriber::EnvFilter;

mod capture;
mod config;
mod display;
mod fusion;
mod ir_capture;
mod persist;
mod published;
mod rgb_capture;
mod shutdown;

use capture::CaptureError;
use config::Config;
use display::{Display, HeadlessDisplay, TerminalDisplay};
use fusion::FusionLoop;
use ir_capture::{spawn_ir_capture, IrOptions};
use persist::FramePersister;
use rgb_capture::spawn_rgb_capture;
use shutdown::{ExitHandler, ShutdownCoordinator};

#[derive(Parser, Debug)]
#[command(name = "thermofuse", about = "Thermal + RGB capture and fusion pipeline")]
struct Args {
    /// TOML config file
    #[arg(short, long, env = "THERMOFUSE_CONFIG")]
    config: Option<PathBuf>,
    /// Loop rate cap in Hz
    #[arg(long)]
    hz: Option<f64>,
    /// Run without the display
    #[arg(long)]
    no_display: bool,
    /// Save every rendered RGB/IR view under <log_dir>/frames
    #[arg(long)]
    save: bool,
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// Stop after this many loop iterations
    #[arg(long)]
    frames: Option<u64>,
    /// Thermal device path (default: find by USB id)
    #[arg(long)]
    ir_device: Option<String>,
    #[arg(long)]
    rgb_device: Option<String>,
    /// SCRFD ONNX model for detection
    #[arg(long)]
    model: Option<PathBuf>,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(hz) = self.hz {
            config.hz_cap = hz;
        }
        if self.no_display {
            config.show_display = false;
        }
        if self.save {
            config.save_frames = true;
        }
        if let Some(dir) = &self.log_dir {
            config.log_dir = dir.clone();
        }
        if self.frames.is_some() {
            config.max_iterations = self.frames;
        }
        if let Some(dev) = &self.ir_device {
            config.ir_device = Some(dev.clone());
        }
        if let Some(dev) = &self.rgb_device {
            config.rgb_device = dev.clone();
        }
        if let Some(model) = &self.model {
            config.detector_model = Some(model.clone());
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "thermofuse failed");
            eprintln!("thermofuse: {e:#}");
            let code = e
                .downcast_ref::<CaptureError>()
                .map(CaptureError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    tracing::info!(
        hz_cap = config.hz_cap,
        show_display = config.show_display,
        save_frames = config.save_frames,
        "thermofuse starting"
    );

    let coordinator = Arc::new(ShutdownCoordinator::new());
    // Stops and joins whatever capture threads were started, on every exit path.
    let exit = ExitHandler(Arc::clone(&coordinator));

    let (width, height) = config.frame_size;
    let camera = V4lColorCamera::open(&config.rgb_device, width, height)
        .map_err(CaptureError::camera("RGB"))?;
    let rgb = spawn_rgb_capture(camera, load_detector(&config), &coordinator)?;

    let driver = match &config.ir_device {
        Some(path) => UvcThermal::with_path(path),
        None => UvcThermal::default(),
    };
    let ir = spawn_ir_capture(driver, IrOptions::from(&config), &coordinator)?;

    let display: Box<dyn Display + Send> = if config.show_display {
        Box::new(TerminalDisplay::new().context("failed to start key reader")?)
    } else {
        Box::new(HeadlessDisplay)
    };
    let persister = if config.save_frames {
        Some(FramePersister::new(
            &config.frames_dir(),
            config.persist_workers,
            config.max_file_queue,
        )?)
    } else {
        None
    };

    let interrupt = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received");
                coordinator.stop();
            }
        })
    };

    let ir_published = Arc::clone(ir.published());
    let rgb_published = Arc::clone(rgb.published());
    let token = coordinator.token();
    let mut fusion = FusionLoop::new(config, display, persister);
    let outcome = tokio::task::spawn_blocking(move || {
        let outcome = fusion.run(&ir_published, &rgb_published, &token);
        // Drains pending frame writes before returning.
        drop(fusion);
        outcome
    })
    .await
    .context("fusion loop panicked")?;
    interrupt.abort();

    drop(exit);
    tracing::info!(
        exit = ?outcome.exit,
        iterations = outcome.iterations,
        ir = ?ir.state(),
        rgb = ?rgb.state(),
        "thermofuse stopped"
    );
    Ok(())
}

fn load_detector(config: &Config) -> Box<dyn Detector> {
    let Some(path) = &config.detector_model else {
        tracing::info!("no detector model configured; detection disabled");
        return Box::new(NoDetector);
    };
    match ScrfdDetector::load(&path.to_string_lossy(), DEFAULT_SCORE_THRESHOLD) {
        Ok(detector) => {
            tracing::info!(path = %path.display(), "SCRFD detector loaded");
            Box::new(detector)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "detector unavailable; continuing without detections");
            Box::new(NoDetector)
        }
    }
}
