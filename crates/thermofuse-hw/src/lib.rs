//! thermofuse-hw — Hardware abstraction for the thermal and RGB sensors.
//!
//! Provides V4L2-based capture for a UVC Y16 thermal camera (driven through
//! a frame-arrival callback) and a visible-light camera, plus the bounded
//! hand-off queue that moves frames out of the driver's callback context.

pub mod camera;
pub mod frame;
pub mod profiles;
pub mod queue;
pub mod thermal;

pub use camera::{CameraError, ColorSensor, DeviceInfo, FormatInfo, V4lColorCamera};
pub use frame::{ColorFrame, FrameError, RawFrame, TelemetryPosition, Y16Buffer};
pub use queue::{HandoffQueue, Producer, QueueError};
pub use thermal::{DriverFrame, FrameCallback, StreamFormat, ThermalDriver, UvcThermal};
