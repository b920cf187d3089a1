//! Radiometric calibration: Kelvin-hundredths to degrees Celsius.

/// Raw value of 0 °C in hundredths of a Kelvin.
pub const KELVIN_CENTI_OFFSET: f32 = 27315.0;

/// `celsius = (raw - 27315) / 100`.
///
/// The raw value is widened to float before subtracting so sub-zero
/// temperatures do not underflow.
pub fn kelvin_centi_to_celsius(raw: u16) -> f32 {
    (raw as f32 - KELVIN_CENTI_OFFSET) / 100.0
}

/// Per-pixel Celsius grid derived from a telemetry-stripped raw frame.
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureFrame {
    pub celsius: Vec<f32>,
    pub width: u32,
    pub height: u32,
}

impl TemperatureFrame {
    /// Calibrate a row-major Kelvin-hundredths grid.
    ///
    /// Returns `None` if `samples` does not hold exactly `width * height` values.
    pub fn from_raw(samples: &[u16], width: u32, height: u32) -> Option<Self> {
        if samples.len() != width as usize * height as usize {
            return None;
        }
        Some(Self {
            celsius: samples.iter().copied().map(kelvin_centi_to_celsius).collect(),
            width,
            height,
        })
    }

    /// Temperature at (x, y), if in bounds.
    pub fn at(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.celsius.get((y * self.width + x) as usize).copied()
    }

    /// (min, max) over the grid, or `None` when empty.
    pub fn range(&self) -> Option<(f32, f32)> {
        self.celsius.iter().fold(None, |acc, &t| match acc {
            None => Some((t, t)),
            Some((lo, hi)) => Some((lo.min(t), hi.max(t))),
        })
    }
}
