use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thermofuse_hw::TelemetryPosition;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value: {0}")]
    Invalid(String),
}

/// Pipeline configuration.
///
/// Loaded from an optional TOML file, then `THERMOFUSE_*` environment
/// overrides, then command-line flags (applied by `main`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upper bound on fusion loop iterations per second.
    pub hz_cap: f64,
    pub show_display: bool,
    pub save_frames: bool,
    /// Skip saving once this many writes are pending.
    pub max_file_queue: usize,
    pub persist_workers: usize,
    pub log_dir: PathBuf,
    /// RGB capture size (width, height).
    pub frame_size: (u32, u32),
    /// Explicit thermal device; when unset the sensor is found by USB VID:PID.
    pub ir_device: Option<String>,
    pub rgb_device: String,
    pub ir_queue_capacity: usize,
    pub ir_timeout_ms: u64,
    /// Telemetry layout overrides; unset fields follow the sensor profile.
    pub telemetry_rows: Option<u32>,
    pub telemetry_position: Option<TelemetryPosition>,
    /// SCRFD ONNX model; detection is disabled when unset.
    pub detector_model: Option<PathBuf>,
    pub detection_threshold: f32,
    /// Scale applied to the IR view before placing it in the combined view.
    pub ir_zoom_out: f32,
    pub vis_window: String,
    pub vis_window_size: (u32, u32),
    pub ir_window: String,
    pub ir_window_size: (u32, u32),
    pub combined_window: String,
    pub vis_bbox_color: [u8; 3],
    pub ir_bbox_color: [u8; 3],
    pub max_iterations: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hz_cap: 10.0,
            show_display: true,
            save_frames: false,
            max_file_queue: 20,
            persist_workers: 4,
            log_dir: PathBuf::from("log"),
            frame_size: (640, 480),
            ir_device: None,
            rgb_device: "/dev/video0".to_string(),
            ir_queue_capacity: thermofuse_hw::queue::DEFAULT_CAPACITY,
            ir_timeout_ms: 500,
            telemetry_rows: None,
            telemetry_position: None,
            detector_model: None,
            detection_threshold: 0.5,
            ir_zoom_out: 0.75,
            vis_window: "RGB".to_string(),
            vis_window_size: (640, 480),
            ir_window: "IR".to_string(),
            ir_window_size: (640, 480),
            combined_window: "Combined".to_string(),
            vis_bbox_color: [0, 255, 0],
            ir_bbox_color: [255, 255, 255],
            max_iterations: None,
        }
    }
}

impl Config {
    /// Load from `path` (if given), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    fn apply_env(&mut self) {
        self.hz_cap = env_parse("THERMOFUSE_HZ_CAP", self.hz_cap);
        self.show_display = env_flag("THERMOFUSE_SHOW_DISPLAY", self.show_display);
        self.save_frames = env_flag("THERMOFUSE_SAVE_FRAMES", self.save_frames);
        self.max_file_queue = env_parse("THERMOFUSE_MAX_FILE_QUEUE", self.max_file_queue);
        if let Ok(dir) = std::env::var("THERMOFUSE_LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Ok(dev) = std::env::var("THERMOFUSE_IR_DEVICE") {
            self.ir_device = Some(dev);
        }
        if let Ok(dev) = std::env::var("THERMOFUSE_RGB_DEVICE") {
            self.rgb_device = dev;
        }
        if let Ok(model) = std::env::var("THERMOFUSE_DETECTOR_MODEL") {
            self.detector_model = Some(PathBuf::from(model));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.hz_cap.is_finite() && self.hz_cap > 0.0) {
            return Err(ConfigError::Invalid(format!("hz_cap must be > 0, got {}", self.hz_cap)));
        }
        if Duration::try_from_secs_f64(1.0 / self.hz_cap).is_err() {
            return Err(ConfigError::Invalid(format!(
                "hz_cap {} gives a frame period too long to represent",
                self.hz_cap
            )));
        }
        if self.ir_timeout_ms == 0 {
            return Err(ConfigError::Invalid("ir_timeout_ms must be > 0".into()));
        }
        if self.persist_workers == 0 {
            return Err(ConfigError::Invalid("persist_workers must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.detection_threshold) {
            return Err(ConfigError::Invalid(format!(
                "detection_threshold must be in [0, 1], got {}",
                self.detection_threshold
            )));
        }
        Ok(())
    }

    /// Minimum spacing between fusion loop iterations.
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.hz_cap)
    }

    pub fn ir_timeout(&self) -> Duration {
        Duration::from_millis(self.ir_timeout_ms)
    }

    pub fn frames_dir(&self) -> PathBuf {
        self.log_dir.join("frames")
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0").unwrap_or(default)
}
