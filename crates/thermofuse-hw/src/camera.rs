//! V4L2 device access and the visible-light (RGB) camera.

use crate::frame::{self, ColorFrame};
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::{CaptureStream, Stream as _};
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Dequeue timeout so a stalled camera surfaces as an error instead of a hang.
const GRAB_TIMEOUT: Duration = Duration::from_millis(1000);
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("failed to open {path}: {source}")]
    OpenFailed { path: String, source: io::Error },
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported by {0}")]
    StreamingNotSupported(String),
    #[error("failed to start streaming: {0}")]
    StreamStartFailed(io::Error),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device is not open")]
    NotOpen,
}

impl CameraError {
    /// OS error code behind this error, if any.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            CameraError::OpenFailed { source, .. } => source.raw_os_error(),
            CameraError::StreamStartFailed(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

/// Info about a discovered V4L2 capture node.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
    pub usb_id: Option<(u16, u16)>,
}

/// One pixel format advertised by a device.
#[derive(Debug, Clone)]
pub struct FormatInfo {
    pub fourcc: String,
    pub description: String,
}

/// Pixel formats the RGB camera knows how to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion-JPEG, one JPEG per buffer.
    Mjpg,
    /// Packed RGB24 (3 bytes/pixel).
    Rgb3,
}

impl ColorFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"MJPG") {
            Some(Self::Mjpg)
        } else if fourcc == FourCC::new(b"RGB3") {
            Some(Self::Rgb3)
        } else {
            None
        }
    }
}

pub(crate) fn fourcc_string(fourcc: FourCC) -> String {
    String::from_utf8_lossy(&fourcc.repr).into_owned()
}

pub(crate) fn open_device(device_path: &str) -> Result<Device, CameraError> {
    if !Path::new(device_path).exists() {
        return Err(CameraError::DeviceNotFound(device_path.to_string()));
    }
    Device::with_path(device_path).map_err(|e| {
        if e.raw_os_error() == Some(16) {
            CameraError::DeviceBusy(device_path.to_string())
        } else {
            CameraError::OpenFailed {
                path: device_path.to_string(),
                source: e,
            }
        }
    })
}

/// List available V4L2 video capture devices.
pub fn list_devices() -> Vec<DeviceInfo> {
    let mut devices = Vec::new();

    for i in 0..16 {
        let path = format!("/dev/video{i}");
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            continue;
        }
        let usb_id = crate::profiles::usb_ids(&path);
        devices.push(DeviceInfo {
            path,
            name: caps.card.clone(),
            driver: caps.driver.clone(),
            bus: caps.bus.clone(),
            usb_id,
        });
    }

    devices
}

/// Enumerate the pixel formats a device advertises.
pub fn list_formats(device_path: &str) -> Result<Vec<FormatInfo>, CameraError> {
    let device = open_device(device_path)?;
    enum_formats(&device)
}

pub(crate) fn enum_formats(device: &Device) -> Result<Vec<FormatInfo>, CameraError> {
    let formats = device.enum_formats().map_err(|e| {
        CameraError::FormatNegotiationFailed(format!("failed to enumerate formats: {e}"))
    })?;
    Ok(formats
        .into_iter()
        .map(|f| FormatInfo {
            fourcc: fourcc_string(f.fourcc),
            description: f.description,
        })
        .collect())
}

/// Frame-grab interface for the visible-light sensor.
pub trait ColorSensor: Send {
    /// Begin streaming. Failure here is fatal at startup.
    fn start_streaming(&mut self) -> Result<(), CameraError>;
    /// Block for the next decoded frame.
    fn grab(&mut self) -> Result<ColorFrame, CameraError>;
    /// Stop streaming and release the device. Called once on shutdown.
    fn stop_streaming(&mut self);
}

/// V4L2 RGB camera.
pub struct V4lColorCamera {
    device: Device,
    stream: Option<MmapStream<'static>>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub format: ColorFormat,
}

impl V4lColorCamera {
    /// Open a V4L2 camera by path and negotiate a decodable format at `width`x`height`.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        let device = open_device(device_path)?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened RGB camera"
        );
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(CameraError::StreamingNotSupported(device_path.to_string()));
        }

        // Prefer YUYV; many webcams only reach full frame rate in MJPG, which
        // the driver substitutes when YUYV is unavailable at this size.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let format = ColorFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {} (need YUYV, MJPG, or RGB3)",
                fourcc_string(negotiated.fourcc)
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            ?format,
            "negotiated RGB format"
        );

        Ok(Self {
            device,
            stream: None,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            format,
        })
    }

    fn decode(&self, buf: &[u8]) -> Result<Vec<u8>, CameraError> {
        let pixels = (self.width * self.height) as usize;
        match self.format {
            ColorFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height)
                .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
            ColorFormat::Mjpg => frame::mjpeg_to_rgb(buf, self.width, self.height)
                .map_err(|e| CameraError::CaptureFailed(format!("MJPG decode failed: {e}"))),
            ColorFormat::Rgb3 => {
                if buf.len() < pixels * 3 {
                    return Err(CameraError::CaptureFailed(format!(
                        "RGB3 buffer too short: expected {}, got {}",
                        pixels * 3,
                        buf.len()
                    )));
                }
                Ok(buf[..pixels * 3].to_vec())
            }
        }
    }
}

impl ColorSensor for V4lColorCamera {
    fn start_streaming(&mut self) -> Result<(), CameraError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(CameraError::StreamStartFailed)?;
        stream.set_timeout(GRAB_TIMEOUT);
        // The first dequeue queues all buffers and issues STREAMON; the frame
        // itself is discarded as warmup.
        stream.next().map_err(CameraError::StreamStartFailed)?;
        self.stream = Some(stream);
        tracing::info!(device = %self.device_path, "RGB streaming started");
        Ok(())
    }

    fn grab(&mut self) -> Result<ColorFrame, CameraError> {
        let stream = self.stream.as_mut().ok_or(CameraError::NotOpen)?;
        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let used = (meta.bytesused as usize).min(buf.len());
        let sequence = meta.sequence;
        // Copy out before the buffer is re-queued on the next dequeue.
        let raw = buf[..used].to_vec();
        let data = self.decode(&raw)?;

        Ok(ColorFrame {
            data,
            width: self.width,
            height: self.height,
            timestamp: Instant::now(),
            sequence,
        })
    }

    fn stop_streaming(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.stop() {
                tracing::warn!(device = %self.device_path, error = %e, "RGB stream stop failed");
            }
        }
        tracing::info!(device = %self.device_path, "RGB streaming stopped");
    }
}
