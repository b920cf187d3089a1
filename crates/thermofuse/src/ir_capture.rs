//! IR capture thread: thermal driver → hand-off queue → calibration → publish.

use crate::capture::{CaptureError, SensorState, StateCell};
use crate::config::Config;
use crate::published::{Published, Snapshot};
use crate::shutdown::{ShutdownCoordinator, StopToken};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thermofuse_core::TemperatureFrame;
use thermofuse_hw::{
    DriverFrame, FrameError, HandoffQueue, Producer, QueueError, RawFrame, StreamFormat,
    TelemetryPosition, ThermalDriver, Y16Buffer,
};

const SENSOR: &str = "IR";

/// Latest processed thermal frame.
#[derive(Debug, Clone)]
pub struct IrSnapshot {
    /// Image rows of the raw frame, telemetry removed.
    pub raw: RawFrame,
    pub temperatures: TemperatureFrame,
    /// Wall-clock time of the capture iteration that produced this frame.
    pub latency: Duration,
}

#[derive(Debug, Clone)]
pub struct IrOptions {
    pub queue_capacity: usize,
    pub timeout: Duration,
    /// Overrides for the layout the driver reports after negotiation.
    pub telemetry_rows: Option<u32>,
    pub telemetry_position: Option<TelemetryPosition>,
}

/// Where the telemetry rows sit in each delivered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TelemetryLayout {
    rows: u32,
    position: TelemetryPosition,
}

impl TelemetryLayout {
    /// Configured overrides win; anything unset follows the negotiated format.
    fn resolve(options: &IrOptions, format: &StreamFormat) -> Self {
        Self {
            rows: options.telemetry_rows.unwrap_or(format.telemetry_rows),
            position: options.telemetry_position.unwrap_or(format.telemetry_position),
        }
    }
}

impl From<&Config> for IrOptions {
    fn from(config: &Config) -> Self {
        Self {
            queue_capacity: config.ir_queue_capacity,
            timeout: config.ir_timeout(),
            telemetry_rows: config.telemetry_rows,
            telemetry_position: config.telemetry_position,
        }
    }
}

/// Reader handle for the IR capture thread.
pub struct IrCapture {
    published: Arc<Published<IrSnapshot>>,
    state: StateCell,
}

impl IrCapture {
    pub fn latest(&self) -> Option<Arc<Snapshot<IrSnapshot>>> {
        self.published.latest()
    }

    pub fn published(&self) -> &Arc<Published<IrSnapshot>> {
        &self.published
    }

    pub fn state(&self) -> SensorState {
        self.state.get()
    }
}

/// Owns the driver and tears it down exactly once, whichever way the
/// capture thread (or startup) exits.
struct DeviceGuard<D: ThermalDriver> {
    driver: D,
    state: StateCell,
}

impl<D: ThermalDriver> Drop for DeviceGuard<D> {
    fn drop(&mut self) {
        self.driver.stop_streaming();
        self.driver.close();
        self.state.set(SensorState::Closed);
        tracing::info!("IR device released");
    }
}

/// Open the thermal sensor, start streaming and spawn the capture thread.
///
/// Device open, format negotiation and stream start happen on the calling
/// thread; any failure is returned and the device is released.
pub fn spawn_ir_capture<D>(
    driver: D,
    options: IrOptions,
    coordinator: &ShutdownCoordinator,
) -> Result<IrCapture, CaptureError>
where
    D: ThermalDriver + 'static,
{
    let state = StateCell::new();
    let mut device = DeviceGuard {
        driver,
        state: state.clone(),
    };

    state.set(SensorState::DeviceOpening);
    device.driver.open().map_err(CaptureError::camera(SENSOR))?;

    state.set(SensorState::FormatNegotiating);
    let format = device
        .driver
        .negotiate_format()
        .map_err(CaptureError::camera(SENSOR))?;
    let layout = TelemetryLayout::resolve(&options, &format);
    if format.height <= layout.rows {
        return Err(CaptureError::Geometry {
            sensor: SENSOR,
            detail: format!(
                "{}x{} stream leaves no image rows after {} telemetry rows",
                format.width, format.height, layout.rows
            ),
        });
    }

    let queue = HandoffQueue::new(options.queue_capacity);
    let producer = queue.producer();
    device
        .driver
        .start_streaming(Box::new(move |frame| enqueue_frame(&producer, frame)))
        .map_err(CaptureError::camera(SENSOR))?;
    state.set(SensorState::Streaming);
    tracing::info!(
        width = format.width,
        height = format.height,
        telemetry_rows = layout.rows,
        telemetry_position = ?layout.position,
        capacity = queue.capacity(),
        "IR streaming"
    );

    let published = Arc::new(Published::new());
    let token = coordinator.token();
    let handle = {
        let published = Arc::clone(&published);
        let state = state.clone();
        std::thread::Builder::new()
            .name("ir-capture".into())
            .spawn(move || {
                let device = device;
                capture_loop(&queue, &published, options.timeout, layout, &token);
                state.set(SensorState::Stopping);
                tracing::info!(dropped = queue.dropped(), "IR capture loop exited");
                drop(device);
            })
            .map_err(|e| CaptureError::Spawn(SENSOR, e))?
    };
    coordinator.register("ir-capture", handle);

    Ok(IrCapture { published, state })
}

/// Frame-arrival callback body. Runs on the driver's thread: check the
/// length, copy out of the driver buffer, and enqueue without blocking.
/// Sample decoding happens on the capture thread.
fn enqueue_frame(producer: &Producer<Y16Buffer>, frame: DriverFrame<'_>) {
    match Y16Buffer::copy_from(frame.data, frame.width, frame.height) {
        Ok(buffer) => {
            if !producer.put(buffer) {
                tracing::trace!(seq = frame.sequence, "IR queue full; frame dropped");
            }
        }
        Err(e) => tracing::debug!(seq = frame.sequence, error = %e, "corrupt IR frame discarded"),
    }
}

fn capture_loop(
    queue: &HandoffQueue<Y16Buffer>,
    published: &Published<IrSnapshot>,
    timeout: Duration,
    layout: TelemetryLayout,
    token: &StopToken,
) {
    while !token.is_stopped() {
        let start = Instant::now();

        let raw = match queue.get(timeout) {
            Ok(buffer) => buffer.decode(),
            Err(QueueError::Timeout(t)) => {
                tracing::warn!(timeout_ms = t.as_millis() as u64, "IR sensor stalled");
                continue;
            }
            Err(QueueError::Disconnected) => {
                tracing::error!("IR frame source disconnected");
                break;
            }
        };

        match calibrate(&raw, layout) {
            Ok((image, temperatures)) => published.publish(IrSnapshot {
                raw: image,
                temperatures,
                latency: start.elapsed(),
            }),
            Err(e) => tracing::warn!(error = %e, "IR frame dropped"),
        }
    }
}

/// Strip telemetry rows, then convert the image rows to Celsius.
fn calibrate(raw: &RawFrame, layout: TelemetryLayout) -> Result<(RawFrame, TemperatureFrame), FrameError> {
    let image = raw.strip_telemetry(layout.rows, layout.position)?;
    let temperatures = TemperatureFrame::from_raw(&image.data, image.width, image.height)
        .ok_or(FrameError::InvalidLength {
            expected: image.width as usize * image.height as usize,
            actual: image.data.len(),
        })?;
    Ok((image, temperatures))
}
