//! thermofuse-core — Temperature calibration, detection handling and view composition.
//!
//! Detection runs SCRFD via ONNX Runtime behind the [`Detector`] trait;
//! everything else here is pure computation over frame buffers.

pub mod calibration;
pub mod detector;
pub mod stats;
pub mod types;
pub mod views;

pub use calibration::{kelvin_centi_to_celsius, TemperatureFrame};
pub use detector::{Detector, DetectorError, NoDetector, ScrfdDetector};
pub use stats::{TemperatureBand, TemperatureSummary};
pub use types::{BoundingBox, Detection, DetectionSet, Landmarks};
