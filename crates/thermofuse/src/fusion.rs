//! Rate-capped fusion/render loop over the latest IR and RGB snapshots.

use crate::config::Config;
use crate::display::{Display, QUIT_KEY};
use crate::ir_capture::IrSnapshot;
use crate::persist::{FramePersister, PersistError};
use crate::published::Published;
use crate::rgb_capture::RgbSnapshot;
use crate::shutdown::StopToken;
use std::time::{Duration, Instant};
use thermofuse_core::views;

/// Poll interval while waiting for the first snapshot from each sensor.
const STARTUP_POLL: Duration = Duration::from_millis(50);
const STARTUP_LOG_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The display reported the quit key.
    Quit,
    /// Stop was requested through the shutdown token.
    Stopped,
    /// `max_iterations` was reached.
    IterationLimit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub exit: LoopExit,
    pub iterations: u64,
    /// Iterations whose save was skipped because of persistence backlog.
    pub skipped_saves: u64,
}

pub struct FusionLoop {
    config: Config,
    display: Box<dyn Display + Send>,
    persister: Option<FramePersister>,
}

impl FusionLoop {
    pub fn new(config: Config, display: Box<dyn Display + Send>, persister: Option<FramePersister>) -> Self {
        Self {
            config,
            display,
            persister,
        }
    }

    /// Run until quit, stop, or the iteration limit.
    ///
    /// Both sensors must have published once before the first iteration.
    /// After that each iteration renders whatever each sensor published
    /// most recently, so the two views may be up to one capture interval
    /// apart.
    pub fn run(
        &mut self,
        ir: &Published<IrSnapshot>,
        rgb: &Published<RgbSnapshot>,
        token: &StopToken,
    ) -> LoopOutcome {
        let mut outcome = LoopOutcome {
            exit: LoopExit::Stopped,
            iterations: 0,
            skipped_saves: 0,
        };
        if !wait_for_first_frames(ir, rgb, token) {
            return outcome;
        }

        let period = self.config.frame_period();
        for i in 0u64.. {
            if token.is_stopped() {
                outcome.exit = LoopExit::Stopped;
                break;
            }
            let start = Instant::now();
            outcome.iterations += 1;

            match self.render(i, ir, rgb) {
                Ok(Step::Quit) => {
                    outcome.exit = LoopExit::Quit;
                    break;
                }
                Ok(Step::Continue { saved }) => {
                    if !saved {
                        outcome.skipped_saves += 1;
                    }
                }
                Err(e) => tracing::warn!(iteration = i, error = %e, "iteration skipped"),
            }

            if self
                .config
                .max_iterations
                .is_some_and(|max| outcome.iterations >= max)
            {
                outcome.exit = LoopExit::IterationLimit;
                break;
            }
            if token.sleep(period.saturating_sub(start.elapsed())) {
                outcome.exit = LoopExit::Stopped;
                break;
            }
        }

        tracing::info!(
            exit = ?outcome.exit,
            iterations = outcome.iterations,
            skipped_saves = outcome.skipped_saves,
            "fusion loop finished"
        );
        outcome
    }

    fn render(
        &mut self,
        iteration: u64,
        ir: &Published<IrSnapshot>,
        rgb: &Published<RgbSnapshot>,
    ) -> Result<Step, views::ViewError> {
        let start = Instant::now();
        let (Some(ir_snap), Some(rgb_snap)) = (ir.latest(), rgb.latest()) else {
            return Err(views::ViewError::Empty);
        };
        let cfg = &self.config;

        let detections = rgb_snap
            .value
            .detections
            .filter_by_confidence(cfg.detection_threshold);
        let frame = &rgb_snap.value.frame;
        let rgb_arr = views::rgb_image(&frame.data, frame.width, frame.height)?;

        let rgb_view = views::make_rgb_view(&rgb_arr, &detections, cfg.vis_window_size, cfg.vis_bbox_color);
        // IR rendered at the RGB frame size so detection boxes land proportionally.
        let ir_arr = views::make_ir_view(&ir_snap.value.temperatures, rgb_arr.dimensions());
        let ir_view = views::make_rgb_view(&ir_arr, &detections, cfg.ir_window_size, cfg.ir_bbox_color);
        let combined = views::make_combined_view(&rgb_arr, &views::zoom_out(&ir_arr, cfg.ir_zoom_out));

        if cfg.show_display {
            self.display.show(&cfg.vis_window, &rgb_view);
            self.display.show(&cfg.ir_window, &ir_view);
            self.display.show(&cfg.combined_window, &combined);
            if self.display.poll_key() == Some(QUIT_KEY) {
                tracing::info!("quit requested from display");
                return Ok(Step::Quit);
            }
        }

        let mut saved = true;
        if let Some(persister) = &self.persister {
            match persister.submit_pair(iteration, rgb_view, ir_view) {
                Ok(()) => {}
                Err(PersistError::Backlog { pending, limit }) => {
                    tracing::warn!(pending, limit, "too many files in file queue; not saving frames from this iteration");
                    saved = false;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "frame save failed");
                    saved = false;
                }
            }
        }

        tracing::info!(
            rgb_ms = ms(rgb_snap.value.latency),
            ir_ms = ms(ir_snap.value.latency),
            main_ms = ms(start.elapsed()),
            "latency"
        );
        Ok(Step::Continue { saved })
    }
}

enum Step {
    Continue { saved: bool },
    Quit,
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Block until both sensors have published. Returns `false` on stop.
fn wait_for_first_frames(ir: &Published<IrSnapshot>, rgb: &Published<RgbSnapshot>, token: &StopToken) -> bool {
    let mut last_log: Option<Instant> = None;
    loop {
        let rgb_ready = rgb.version() > 0;
        let ir_ready = ir.version() > 0;
        if rgb_ready && ir_ready {
            return true;
        }
        if last_log.map_or(true, |t| t.elapsed() >= STARTUP_LOG_INTERVAL) {
            if !rgb_ready {
                tracing::info!("waiting for RGB frames");
            }
            if !ir_ready {
                tracing::info!("waiting for IR frames");
            }
            last_log = Some(Instant::now());
        }
        if token.sleep(STARTUP_POLL) {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::tests::RecordingDisplay;
    use crate::display::HeadlessDisplay;
    use image::RgbImage;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use thermofuse_core::{BoundingBox, DetectionSet, TemperatureFrame};
    use thermofuse_hw::{ColorFrame, RawFrame};

    fn ir_snapshot() -> IrSnapshot {
        let data: Vec<u16> = (0..16).map(|i| 29315 + i * 50).collect();
        let temperatures = TemperatureFrame::from_raw(&data, 4, 4).unwrap();
        IrSnapshot {
            raw: RawFrame {
                data,
                width: 4,
                height: 4,
                captured_at: Instant::now(),
            },
            temperatures,
            latency: Duration::from_millis(2),
        }
    }

    fn rgb_snapshot() -> RgbSnapshot {
        let mut detections = DetectionSet::empty();
        detections.push(0.9, BoundingBox::from_corners(2.0, 2.0, 10.0, 10.0), [(4.0, 4.0); 5]);
        detections.push(0.2, BoundingBox::from_corners(0.0, 0.0, 4.0, 4.0), [(1.0, 1.0); 5]);
        RgbSnapshot {
            frame: ColorFrame {
                data: vec![90; 16 * 12 * 3],
                width: 16,
                height: 12,
                timestamp: Instant::now(),
                sequence: 1,
            },
            detections,
            latency: Duration::from_millis(3),
        }
    }

    fn published() -> (Published<IrSnapshot>, Published<RgbSnapshot>) {
        let ir = Published::new();
        ir.publish(ir_snapshot());
        let rgb = Published::new();
        rgb.publish(rgb_snapshot());
        (ir, rgb)
    }

    fn small_config() -> Config {
        Config {
            vis_window_size: (32, 24),
            ir_window_size: (32, 24),
            ..Config::default()
        }
    }

    #[test]
    fn test_rate_cap_spacing() {
        let (ir, rgb) = published();
        let display = RecordingDisplay::default();
        let shows = Arc::clone(&display.shows);
        let config = Config {
            hz_cap: 10.0,
            max_iterations: Some(4),
            ..small_config()
        };
        let mut fusion = FusionLoop::new(config, Box::new(display), None);
        let outcome = fusion.run(&ir, &rgb, &StopToken::new());
        assert_eq!(outcome.exit, LoopExit::IterationLimit);
        assert_eq!(outcome.iterations, 4);

        let shows = shows.lock().unwrap();
        let rgb_times: Vec<Instant> = shows.iter().filter(|s| s.0 == "RGB").map(|s| s.2).collect();
        assert_eq!(rgb_times.len(), 4);
        for pair in rgb_times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(95));
        }
        let names: Vec<&str> = shows.iter().take(3).map(|s| s.0.as_str()).collect();
        assert_eq!(names, ["RGB", "IR", "Combined"]);
        assert_eq!(shows[0].1, (32, 24));
        // Combined: 16x12 RGB frame beside the 16x12 zoomed IR canvas.
        assert_eq!(shows[2].1, (32, 12));
    }

    #[test]
    fn test_quit_key_ends_loop() {
        let (ir, rgb) = published();
        let display = RecordingDisplay {
            keys: VecDeque::from([None, Some('x'), Some(QUIT_KEY)]),
            ..Default::default()
        };
        let config = Config {
            hz_cap: 200.0,
            ..small_config()
        };
        let mut fusion = FusionLoop::new(config, Box::new(display), None);
        let outcome = fusion.run(&ir, &rgb, &StopToken::new());
        assert_eq!(outcome.exit, LoopExit::Quit);
        assert_eq!(outcome.iterations, 3);
    }

    #[test]
    fn test_stop_interrupts_rate_sleep() {
        let (ir, rgb) = published();
        let token = StopToken::new();
        let remote = token.clone();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            remote.stop();
        });
        let config = Config {
            hz_cap: 0.5,
            ..small_config()
        };
        let mut fusion = FusionLoop::new(config, Box::new(HeadlessDisplay), None);
        let start = Instant::now();
        let outcome = fusion.run(&ir, &rgb, &token);
        assert_eq!(outcome.exit, LoopExit::Stopped);
        assert_eq!(outcome.iterations, 1);
        assert!(start.elapsed() < Duration::from_secs(1));
        stopper.join().unwrap();
    }

    #[test]
    fn test_waits_for_first_frames() {
        let ir: Published<IrSnapshot> = Published::new();
        let rgb = Published::new();
        rgb.publish(rgb_snapshot());
        let token = StopToken::new();
        let remote = token.clone();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(120));
            remote.stop();
        });
        let display = RecordingDisplay::default();
        let shows = Arc::clone(&display.shows);
        let mut fusion = FusionLoop::new(small_config(), Box::new(display), None);
        let outcome = fusion.run(&ir, &rgb, &token);
        assert_eq!(outcome.exit, LoopExit::Stopped);
        assert_eq!(outcome.iterations, 0);
        assert!(shows.lock().unwrap().is_empty());
        stopper.join().unwrap();
    }

    #[test]
    fn test_saves_named_frame_pairs() {
        let (ir, rgb) = published();
        let dir = tempfile::tempdir().unwrap();
        let persister = FramePersister::new(dir.path(), 2, 20).unwrap();
        let config = Config {
            hz_cap: 100.0,
            max_iterations: Some(2),
            show_display: false,
            ..small_config()
        };
        let mut fusion = FusionLoop::new(config, Box::new(HeadlessDisplay), Some(persister));
        let outcome = fusion.run(&ir, &rgb, &StopToken::new());
        assert_eq!(outcome.skipped_saves, 0);
        drop(fusion);

        for name in ["00000-rgb.jpg", "00000-ir.png", "00001-rgb.jpg", "00001-ir.png"] {
            assert!(dir.path().join(name).exists(), "{name} missing");
        }
        let ir_img = image::open(dir.path().join("00001-ir.png")).unwrap();
        assert_eq!((ir_img.width(), ir_img.height()), (32, 24));
    }

    #[test]
    fn test_backlog_counts_skipped_saves() {
        let (ir, rgb) = published();
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        let writer: crate::persist::ImageWriter = {
            let gate = Arc::clone(&gate);
            Arc::new(move |_path: &Path, _image: &RgbImage| {
                drop(gate.lock());
                Ok(())
            })
        };
        // Limit 1: the first pair puts 2 writes in flight, so later pairs are skipped.
        let persister = FramePersister::with_writer(dir.path(), 1, 1, writer).unwrap();
        let config = Config {
            hz_cap: 200.0,
            max_iterations: Some(3),
            show_display: false,
            ..small_config()
        };
        let mut fusion = FusionLoop::new(config, Box::new(HeadlessDisplay), Some(persister));
        let outcome = fusion.run(&ir, &rgb, &StopToken::new());
        assert_eq!(outcome.exit, LoopExit::IterationLimit);
        assert_eq!(outcome.skipped_saves, 2);
        drop(held);
        drop(fusion);
    }
}
