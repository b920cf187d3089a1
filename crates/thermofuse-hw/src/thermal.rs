//! Thermal sensor driver: UVC Y16 streaming with frame-arrival callbacks.
//!
//! The driver owns a streaming thread that dequeues buffers and hands each
//! one to the registered callback. The callback runs on that thread and
//! must return promptly.

use crate::camera::{self, CameraError, FormatInfo};
use crate::frame::TelemetryPosition;
use crate::profiles::{self, SensorProfile, PURETHERMAL_PID, PURETHERMAL_VID};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use v4l::buffer::Type as BufType;
use v4l::io::traits::{CaptureStream, Stream as _};
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const Y16: &[u8; 4] = b"Y16 ";
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(250);
const STREAM_BUFFERS: u32 = 4;

/// A buffer as delivered by the driver, valid only for the callback's duration.
#[derive(Debug, Clone, Copy)]
pub struct DriverFrame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
}

/// Frame-arrival callback registered with [`ThermalDriver::start_streaming`].
pub type FrameCallback = Box<dyn FnMut(DriverFrame<'_>) + Send + 'static>;

/// Negotiated stream parameters.
///
/// `height` counts every delivered row; `telemetry_rows` of them at
/// `telemetry_position` carry sensor metadata rather than image data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFormat {
    pub fourcc: String,
    pub width: u32,
    pub height: u32,
    pub telemetry_rows: u32,
    pub telemetry_position: TelemetryPosition,
}

/// Lifecycle operations of a thermal sensor driver.
///
/// Call order: `open` → `negotiate_format` → `start_streaming` → … →
/// `stop_streaming` → `close`. `stop_streaming` and `close` must tolerate
/// being called on a partially started driver.
pub trait ThermalDriver: Send {
    fn open(&mut self) -> Result<(), CameraError>;
    fn negotiate_format(&mut self) -> Result<StreamFormat, CameraError>;
    fn start_streaming(&mut self, on_frame: FrameCallback) -> Result<(), CameraError>;
    fn stop_streaming(&mut self);
    fn close(&mut self);
}

/// PureThermal-style UVC thermal camera exposed through V4L2.
pub struct UvcThermal {
    device_hint: Option<String>,
    usb_id: (u16, u16),
    device_path: Option<String>,
    device: Option<Device>,
    format: Option<StreamFormat>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl UvcThermal {
    /// Driver for an explicit `/dev/videoN` path.
    pub fn with_path(path: &str) -> Self {
        Self::new(Some(path.to_string()), (PURETHERMAL_VID, PURETHERMAL_PID))
    }

    /// Driver that locates the device by USB VID:PID at open time.
    pub fn with_usb_id(vid: u16, pid: u16) -> Self {
        Self::new(None, (vid, pid))
    }

    fn new(device_hint: Option<String>, usb_id: (u16, u16)) -> Self {
        Self {
            device_hint,
            usb_id,
            device_path: None,
            device: None,
            format: None,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn device_path(&self) -> Option<&str> {
        self.device_path.as_deref()
    }

    fn profile(&self) -> Option<&'static SensorProfile> {
        let (vid, pid) = self
            .device_path
            .as_deref()
            .and_then(profiles::usb_ids)
            .unwrap_or(self.usb_id);
        profiles::lookup_profile(vid, pid)
    }
}

impl Default for UvcThermal {
    fn default() -> Self {
        Self::with_usb_id(PURETHERMAL_VID, PURETHERMAL_PID)
    }
}

impl ThermalDriver for UvcThermal {
    fn open(&mut self) -> Result<(), CameraError> {
        let path = match &self.device_hint {
            Some(p) => p.clone(),
            None => {
                let (vid, pid) = self.usb_id;
                profiles::find_by_usb_id(vid, pid).ok_or_else(|| {
                    CameraError::DeviceNotFound(format!("no USB video device {vid:04x}:{pid:04x}"))
                })?
            }
        };
        let device = camera::open_device(&path)?;
        if let Ok(caps) = device.query_caps() {
            tracing::info!(
                device = %path,
                driver = %caps.driver,
                card = %caps.card,
                bus = %caps.bus,
                "thermal device opened"
            );
        }
        self.device_path = Some(path);
        self.device = Some(device);
        Ok(())
    }

    fn negotiate_format(&mut self) -> Result<StreamFormat, CameraError> {
        let device = self.device.as_ref().ok_or(CameraError::NotOpen)?;

        let formats: Vec<FormatInfo> = camera::enum_formats(device)?;
        for f in &formats {
            tracing::info!(fourcc = %f.fourcc, description = %f.description, "thermal format");
        }
        if !formats.iter().any(|f| f.fourcc.as_bytes() == Y16) {
            return Err(CameraError::FormatNegotiationFailed(
                "device does not support Y16".to_string(),
            ));
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(Y16);
        let profile = self.profile();
        match profile {
            Some(profile) => {
                tracing::info!(profile = %profile.device.name, "using sensor profile");
                fmt.width = profile.stream.width;
                fmt.height = profile.stream.height;
            }
            None => tracing::warn!("no sensor profile; assuming no telemetry rows"),
        }
        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;
        if negotiated.fourcc != FourCC::new(Y16) {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "driver negotiated {} instead of Y16",
                camera::fourcc_string(negotiated.fourcc)
            )));
        }

        let format = StreamFormat {
            fourcc: camera::fourcc_string(negotiated.fourcc),
            width: negotiated.width,
            height: negotiated.height,
            telemetry_rows: profile.map_or(0, |p| p.stream.telemetry_rows),
            telemetry_position: profile.map(|p| p.stream.telemetry_position).unwrap_or_default(),
        };
        tracing::info!(
            width = format.width,
            height = format.height,
            telemetry_rows = format.telemetry_rows,
            telemetry_position = ?format.telemetry_position,
            "negotiated Y16"
        );
        self.format = Some(format.clone());
        Ok(format)
    }

    fn start_streaming(&mut self, mut on_frame: FrameCallback) -> Result<(), CameraError> {
        let device = self.device.as_ref().ok_or(CameraError::NotOpen)?;
        let format = self.format.clone().ok_or_else(|| {
            CameraError::FormatNegotiationFailed("format not negotiated".to_string())
        })?;

        let mut stream = MmapStream::with_buffers(device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(CameraError::StreamStartFailed)?;
        stream.set_timeout(DEQUEUE_TIMEOUT);
        // First dequeue issues STREAMON; surface failure here rather than on the worker.
        match stream.next() {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => return Err(CameraError::StreamStartFailed(e)),
        }

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let worker = std::thread::Builder::new()
            .name("thermal-driver".into())
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    match stream.next() {
                        Ok((buf, meta)) => {
                            let used = (meta.bytesused as usize).min(buf.len());
                            on_frame(DriverFrame {
                                data: &buf[..used],
                                width: format.width,
                                height: format.height,
                                sequence: meta.sequence,
                            });
                        }
                        Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                        Err(e) => {
                            tracing::error!(error = %e, "thermal dequeue failed; streaming halted");
                            break;
                        }
                    }
                }
                if let Err(e) = stream.stop() {
                    tracing::warn!(error = %e, "thermal stream stop failed");
                }
            })
            .map_err(CameraError::StreamStartFailed)?;
        self.worker = Some(worker);
        Ok(())
    }

    fn stop_streaming(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("thermal driver thread panicked");
            }
            tracing::info!("thermal streaming stopped");
        }
    }

    fn close(&mut self) {
        self.format = None;
        if self.device.take().is_some() {
            tracing::info!(device = ?self.device_path, "thermal device closed");
        }
    }
}

impl Drop for UvcThermal {
    fn drop(&mut self) {
        self.stop_streaming();
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_path() {
        let mut driver = UvcThermal::with_path("/dev/video-does-not-exist");
        assert!(matches!(driver.open(), Err(CameraError::DeviceNotFound(_))));
    }

    #[test]
    fn test_negotiate_before_open() {
        let mut driver = UvcThermal::default();
        assert!(matches!(driver.negotiate_format(), Err(CameraError::NotOpen)));
    }

    #[test]
    fn test_stop_and_close_idempotent_when_never_started() {
        let mut driver = UvcThermal::default();
        driver.stop_streaming();
        driver.stop_streaming();
        driver.close();
        driver.close();
        assert!(driver.device_path().is_none());
    }
}
