//! RGB capture thread: grab → detect → publish.

use crate::capture::{CaptureError, SensorState, StateCell};
use crate::published::{Published, Snapshot};
use crate::shutdown::{ShutdownCoordinator, StopToken};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thermofuse_core::{DetectionSet, Detector};
use thermofuse_hw::{ColorFrame, ColorSensor};

const SENSOR: &str = "RGB";

/// Pause after a failed grab before retrying.
const GRAB_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Latest decoded RGB frame and its unfiltered detections.
#[derive(Debug, Clone)]
pub struct RgbSnapshot {
    pub frame: ColorFrame,
    pub detections: DetectionSet,
    pub latency: Duration,
}

/// Reader handle for the RGB capture thread.
pub struct RgbCapture {
    published: Arc<Published<RgbSnapshot>>,
    state: StateCell,
}

impl RgbCapture {
    pub fn latest(&self) -> Option<Arc<Snapshot<RgbSnapshot>>> {
        self.published.latest()
    }

    pub fn published(&self) -> &Arc<Published<RgbSnapshot>> {
        &self.published
    }

    pub fn state(&self) -> SensorState {
        self.state.get()
    }
}

struct SensorGuard<S: ColorSensor> {
    sensor: S,
    state: StateCell,
}

impl<S: ColorSensor> Drop for SensorGuard<S> {
    fn drop(&mut self) {
        self.sensor.stop_streaming();
        self.state.set(SensorState::Closed);
    }
}

/// Start streaming on an opened sensor and spawn the capture thread.
///
/// The sensor arrives already opened with its format negotiated, so only
/// stream start can fail here.
pub fn spawn_rgb_capture<S>(
    sensor: S,
    detector: Box<dyn Detector>,
    coordinator: &ShutdownCoordinator,
) -> Result<RgbCapture, CaptureError>
where
    S: ColorSensor + 'static,
{
    let state = StateCell::new();
    state.set(SensorState::DeviceOpening);
    let mut device = SensorGuard {
        sensor,
        state: state.clone(),
    };
    device
        .sensor
        .start_streaming()
        .map_err(CaptureError::camera(SENSOR))?;
    state.set(SensorState::Streaming);

    let published = Arc::new(Published::new());
    let token = coordinator.token();
    let handle = {
        let published = Arc::clone(&published);
        let state = state.clone();
        std::thread::Builder::new()
            .name("rgb-capture".into())
            .spawn(move || {
                let mut device = device;
                let mut detector = detector;
                capture_loop(&mut device.sensor, detector.as_mut(), &published, &token);
                state.set(SensorState::Stopping);
                tracing::info!("RGB capture loop exited");
            })
            .map_err(|e| CaptureError::Spawn(SENSOR, e))?
    };
    coordinator.register("rgb-capture", handle);

    Ok(RgbCapture { published, state })
}

fn capture_loop<S: ColorSensor>(
    sensor: &mut S,
    detector: &mut dyn Detector,
    published: &Published<RgbSnapshot>,
    token: &StopToken,
) {
    while !token.is_stopped() {
        let start = Instant::now();

        let frame = match sensor.grab() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "RGB grab failed");
                token.sleep(GRAB_RETRY_DELAY);
                continue;
            }
        };

        let detections = match detector.detect(&frame.data, frame.width, frame.height) {
            Ok(set) => set,
            Err(e) => {
                tracing::warn!(seq = frame.sequence, error = %e, "detection failed; publishing frame without detections");
                DetectionSet::empty()
            }
        };

        published.publish(RgbSnapshot {
            frame,
            detections,
            latency: start.elapsed(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use thermofuse_core::{BoundingBox, DetectorError};
    use thermofuse_hw::CameraError;

    struct FakeSensor {
        calls: Arc<Mutex<Vec<&'static str>>>,
        seq: u32,
        fail_every: Option<u32>,
        fail_start: bool,
    }

    impl FakeSensor {
        fn new() -> Self {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                seq: 0,
                fail_every: None,
                fail_start: false,
            }
        }
    }

    impl ColorSensor for FakeSensor {
        fn start_streaming(&mut self) -> Result<(), CameraError> {
            self.calls.lock().unwrap().push("start");
            if self.fail_start {
                return Err(CameraError::StreamStartFailed(std::io::Error::from_raw_os_error(16)));
            }
            Ok(())
        }

        fn grab(&mut self) -> Result<ColorFrame, CameraError> {
            std::thread::sleep(Duration::from_millis(5));
            self.seq += 1;
            if self.fail_every.is_some_and(|n| self.seq % n == 0) {
                return Err(CameraError::CaptureFailed("dequeue timed out".into()));
            }
            Ok(ColorFrame {
                data: vec![self.seq as u8; 4 * 4 * 3],
                width: 4,
                height: 4,
                timestamp: Instant::now(),
                sequence: self.seq,
            })
        }

        fn stop_streaming(&mut self) {
            self.calls.lock().unwrap().push("stop");
        }
    }

    struct OneBox;

    impl Detector for OneBox {
        fn detect(&mut self, _rgb: &[u8], w: u32, h: u32) -> Result<DetectionSet, DetectorError> {
            let mut set = DetectionSet::empty();
            set.push(0.9, BoundingBox::from_corners(0.0, 0.0, w as f32 / 2.0, h as f32 / 2.0), [(1.0, 1.0); 5]);
            Ok(set)
        }
    }

    struct Broken;

    impl Detector for Broken {
        fn detect(&mut self, _rgb: &[u8], _w: u32, _h: u32) -> Result<DetectionSet, DetectorError> {
            Err(DetectorError::InferenceFailed("no session".into()))
        }
    }

    fn wait_for_version(capture: &RgbCapture, version: u64) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if capture.published().version() >= version {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_publishes_frames_with_detections() {
        let sensor = FakeSensor::new();
        let calls = Arc::clone(&sensor.calls);
        let coordinator = ShutdownCoordinator::new();
        let capture = spawn_rgb_capture(sensor, Box::new(OneBox), &coordinator).unwrap();
        assert!(wait_for_version(&capture, 3));

        let snap = capture.latest().unwrap();
        assert_eq!(snap.value.detections.len(), 1);
        assert_eq!(snap.value.frame.data.len(), 48);
        assert_eq!(snap.value.frame.data[0], snap.value.frame.sequence as u8);

        assert_eq!(coordinator.shutdown(), 1);
        assert_eq!(capture.state(), SensorState::Closed);
        assert_eq!(*calls.lock().unwrap(), vec!["start", "stop"]);
    }

    #[test]
    fn test_detector_failure_publishes_empty_set() {
        let coordinator = ShutdownCoordinator::new();
        let capture = spawn_rgb_capture(FakeSensor::new(), Box::new(Broken), &coordinator).unwrap();
        assert!(wait_for_version(&capture, 2));
        assert!(capture.latest().unwrap().value.detections.is_empty());
        coordinator.shutdown();
    }

    #[test]
    fn test_grab_errors_do_not_stop_capture() {
        let mut sensor = FakeSensor::new();
        sensor.fail_every = Some(2);
        let coordinator = ShutdownCoordinator::new();
        let capture = spawn_rgb_capture(sensor, Box::new(OneBox), &coordinator).unwrap();
        assert!(wait_for_version(&capture, 4));
        // Only odd sequence numbers succeed.
        assert_eq!(capture.latest().unwrap().value.frame.sequence % 2, 1);
        coordinator.shutdown();
    }

    #[test]
    fn test_stream_start_failure_is_fatal() {
        let mut sensor = FakeSensor::new();
        sensor.fail_start = true;
        let calls = Arc::clone(&sensor.calls);
        let coordinator = ShutdownCoordinator::new();
        let err = spawn_rgb_capture(sensor, Box::new(OneBox), &coordinator).err().unwrap();
        assert_eq!(err.exit_code(), 16);
        assert_eq!(*calls.lock().unwrap(), vec!["start", "stop"]);
        assert_eq!(coordinator.join_all(), 0);
    }
}
