use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;
use thermofuse_core::{TemperatureBand, TemperatureFrame, TemperatureSummary};
use thermofuse_hw::{camera, profiles};
use thermofuse_hw::{
    HandoffQueue, QueueError, StreamFormat, TelemetryPosition, ThermalDriver, UvcThermal, Y16Buffer,
};

/// Consecutive queue timeouts before `temps` gives up.
const MAX_STALLS: u32 = 10;

#[derive(Parser)]
#[command(name = "thermofuse-diag", about = "Thermofuse sensor diagnostics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List video4linux capture devices
    Devices {
        #[arg(long)]
        json: bool,
    },
    /// List the built-in thermal sensor profiles
    Profiles,
    /// List the pixel formats a device advertises
    Formats {
        /// Device path, e.g. /dev/video0
        device: String,
    },
    /// Summarize calibrated temperatures from the thermal sensor
    Temps {
        /// Lower bound of the accepted band (°C)
        #[arg(long, default_value_t = 5.0, allow_negative_numbers = true)]
        low: f32,
        /// Upper bound of the accepted band (°C)
        #[arg(long, default_value_t = 45.0, allow_negative_numbers = true)]
        high: f32,
        /// Number of frames to summarize
        #[arg(long, default_value_t = 4)]
        frames: usize,
        /// Thermal device path (default: find by USB id)
        #[arg(long)]
        device: Option<String>,
        /// Telemetry rows per frame (default: from the sensor profile)
        #[arg(long)]
        telemetry_rows: Option<u32>,
        /// Telemetry row placement, `top` or `bottom` (default: from the sensor profile)
        #[arg(long, value_parser = parse_position)]
        telemetry_position: Option<TelemetryPosition>,
        #[arg(long, default_value_t = 500)]
        timeout_ms: u64,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices { json } => {
            let devices = camera::list_devices();
            if json {
                let rows: Vec<_> = devices
                    .iter()
                    .map(|d| {
                        serde_json::json!({
                            "path": d.path,
                            "name": d.name,
                            "driver": d.driver,
                            "bus": d.bus,
                            "usb_id": d.usb_id.map(|(v, p)| format!("{v:04x}:{p:04x}")),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if devices.is_empty() {
                println!("No video devices found");
            } else {
                for d in &devices {
                    let usb = d
                        .usb_id
                        .map(|(v, p)| format!("{v:04x}:{p:04x}"))
                        .unwrap_or_else(|| "-".into());
                    println!("{:<14} {:<10} {:<12} {}", d.path, usb, d.driver, d.name);
                }
            }
        }
        Commands::Profiles => {
            for p in profiles::list_profiles() {
                println!(
                    "{:04x}:{:04x}  {:<4} {}x{}  telemetry={} rows ({:?})  {}",
                    p.device.vendor_id,
                    p.device.product_id,
                    p.stream.fourcc.trim_end(),
                    p.stream.width,
                    p.stream.height,
                    p.stream.telemetry_rows,
                    p.stream.telemetry_position,
                    p.device.name
                );
            }
        }
        Commands::Formats { device } => {
            let formats = camera::list_formats(&device)?;
            println!("{device}:");
            for f in formats {
                println!("  {}  {}", f.fourcc, f.description);
            }
        }
        Commands::Temps {
            low,
            high,
            frames,
            device,
            telemetry_rows,
            telemetry_position,
            timeout_ms,
            json,
        } => {
            if low > high {
                bail!("--low ({low}) must not exceed --high ({high})");
            }
            let driver = match &device {
                Some(path) => UvcThermal::with_path(path),
                None => UvcThermal::default(),
            };
            let band = TemperatureBand::new(low, high);
            let timeout = Duration::from_millis(timeout_ms);
            let overrides = (telemetry_rows, telemetry_position);
            let summaries = tokio::task::spawn_blocking(move || {
                summarize_frames(driver, band, frames, overrides, timeout)
            })
            .await
            .context("temperature task panicked")??;

            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else {
                for (i, s) in summaries.iter().enumerate() {
                    match s {
                        Some(s) => println!(
                            "frame {i}: values={} min={:.2} max={:.2} mean={:.2} median={:.2} p5={:.2} p95={:.2}",
                            s.count, s.min, s.max, s.mean, s.median, s.p5, s.p95
                        ),
                        None => println!("frame {i}: no values within [{low}, {high}] °C"),
                    }
                }
            }
        }
    }

    Ok(())
}

fn parse_position(s: &str) -> Result<TelemetryPosition, String> {
    match s.to_ascii_lowercase().as_str() {
        "top" => Ok(TelemetryPosition::Top),
        "bottom" => Ok(TelemetryPosition::Bottom),
        other => Err(format!("expected `top` or `bottom`, got `{other}`")),
    }
}

/// Command-line overrides first, then the layout the driver negotiated.
fn telemetry_layout(
    format: &StreamFormat,
    overrides: (Option<u32>, Option<TelemetryPosition>),
) -> (u32, TelemetryPosition) {
    (
        overrides.0.unwrap_or(format.telemetry_rows),
        overrides.1.unwrap_or(format.telemetry_position),
    )
}

/// Stream `frames` thermal frames and summarize each one's in-band temperatures.
///
/// A frame that fails to arrive within `timeout` is reported and waited for
/// again, up to [`MAX_STALLS`] times in a row.
fn summarize_frames(
    mut driver: UvcThermal,
    band: TemperatureBand,
    frames: usize,
    overrides: (Option<u32>, Option<TelemetryPosition>),
    timeout: Duration,
) -> Result<Vec<Option<TemperatureSummary>>> {
    driver.open()?;
    let format = driver.negotiate_format()?;
    let (telemetry_rows, telemetry_position) = telemetry_layout(&format, overrides);
    println!(
        "streaming Y16 {}x{}, {telemetry_rows} telemetry rows ({telemetry_position:?})",
        format.width, format.height
    );

    let queue = HandoffQueue::<Y16Buffer>::new(thermofuse_hw::queue::DEFAULT_CAPACITY);
    let producer = queue.producer();
    driver.start_streaming(Box::new(move |frame| {
        if let Ok(buffer) = Y16Buffer::copy_from(frame.data, frame.width, frame.height) {
            producer.put(buffer);
        }
    }))?;

    let mut summaries = Vec::with_capacity(frames);
    let mut stalls = 0;
    while summaries.len() < frames {
        let raw = match queue.get(timeout) {
            Ok(buffer) => {
                stalls = 0;
                buffer.decode()
            }
            Err(QueueError::Timeout(t)) => {
                stalls += 1;
                if stalls >= MAX_STALLS {
                    bail!("no thermal frames after {stalls} waits of {t:?}");
                }
                tracing::warn!(timeout_ms = t.as_millis() as u64, "thermal sensor stalled");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let image = raw.strip_telemetry(telemetry_rows, telemetry_position)?;
        let Some(temps) = TemperatureFrame::from_raw(&image.data, image.width, image.height) else {
            continue;
        };
        summaries.push(TemperatureSummary::compute(&temps.celsius, band));
    }

    // Dropping the driver on an error path above performs the same teardown.
    driver.stop_streaming();
    driver.close();
    Ok(summaries)
}
