//! State and errors shared by the IR and RGB capture threads.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thermofuse_hw::CameraError;
use thiserror::Error;

/// Capture thread lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SensorState {
    Uninitialized = 0,
    DeviceOpening = 1,
    FormatNegotiating = 2,
    Streaming = 3,
    Stopping = 4,
    Closed = 5,
}

impl SensorState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::DeviceOpening,
            2 => Self::FormatNegotiating,
            3 => Self::Streaming,
            4 => Self::Stopping,
            5 => Self::Closed,
            _ => Self::Uninitialized,
        }
    }
}

/// Shared, lock-free view of a capture thread's [`SensorState`].
#[derive(Debug, Clone)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(SensorState::Uninitialized as u8)))
    }

    pub fn get(&self) -> SensorState {
        SensorState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: SensorState) {
        let prev = SensorState::from_u8(self.0.swap(state as u8, Ordering::AcqRel));
        if prev != state {
            tracing::debug!(from = ?prev, to = ?state, "sensor state");
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Startup failures. Any of these is fatal to the process.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("{sensor} sensor: {source}")]
    Camera {
        sensor: &'static str,
        #[source]
        source: CameraError,
    },
    #[error("{sensor} sensor: {detail}")]
    Geometry { sensor: &'static str, detail: String },
    #[error("failed to spawn {0} capture thread: {1}")]
    Spawn(&'static str, std::io::Error),
}

impl CaptureError {
    pub(crate) fn camera(sensor: &'static str) -> impl FnOnce(CameraError) -> Self {
        move |source| CaptureError::Camera { sensor, source }
    }

    /// Process exit status: the OS error code when known, otherwise 1.
    pub fn exit_code(&self) -> u8 {
        let code = match self {
            CaptureError::Camera { source, .. } => source.os_code(),
            CaptureError::Spawn(_, e) => e.raw_os_error(),
            CaptureError::Geometry { .. } => None,
        };
        code.map(|c| c.clamp(1, 255) as u8).unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), SensorState::Uninitialized);
        for s in [
            SensorState::DeviceOpening,
            SensorState::FormatNegotiating,
            SensorState::Streaming,
            SensorState::Stopping,
            SensorState::Closed,
        ] {
            cell.set(s);
            assert_eq!(cell.get(), s);
        }
    }

    #[test]
    fn test_exit_code_surfaces_os_error() {
        let err = CaptureError::Camera {
            sensor: "IR",
            source: CameraError::OpenFailed {
                path: "/dev/video2".into(),
                source: std::io::Error::from_raw_os_error(19),
            },
        };
        assert_eq!(err.exit_code(), 19);

        let err = CaptureError::Camera {
            sensor: "IR",
            source: CameraError::FormatNegotiationFailed("no Y16".into()),
        };
        assert_eq!(err.exit_code(), 1);
    }
}
