//! Temperature summary statistics for diagnostics and telemetry.

use serde::Serialize;

/// Inclusive Celsius band used to reject implausible readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureBand {
    pub low: f32,
    pub high: f32,
}

impl TemperatureBand {
    pub fn new(low: f32, high: f32) -> Self {
        Self { low, high }
    }

    pub fn contains(&self, t: f32) -> bool {
        t >= self.low && t <= self.high
    }
}

impl Default for TemperatureBand {
    fn default() -> Self {
        Self::new(0.0, 50.0)
    }
}

/// Summary of the in-band samples.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemperatureSummary {
    pub count: usize,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub median: f32,
    pub p5: f32,
    pub p95: f32,
}

impl TemperatureSummary {
    /// Summarize `samples` after dropping values outside `band`.
    ///
    /// Returns `None` when no sample falls inside the band (or all are NaN).
    pub fn compute(samples: &[f32], band: TemperatureBand) -> Option<Self> {
        let mut kept: Vec<f32> = samples.iter().copied().filter(|&t| band.contains(t)).collect();
        if kept.is_empty() {
            return None;
        }
        kept.sort_by(|a, b| a.total_cmp(b));

        let count = kept.len();
        let mean = (kept.iter().map(|&t| t as f64).sum::<f64>() / count as f64) as f32;
        Some(Self {
            count,
            min: kept[0],
            max: kept[count - 1],
            mean,
            median: percentile_sorted(&kept, 50.0),
            p5: percentile_sorted(&kept, 5.0),
            p95: percentile_sorted(&kept, 95.0),
        })
    }
}

/// Linear-interpolated percentile over sorted data (`q` in 0..=100).
fn percentile_sorted(sorted: &[f32], q: f32) -> f32 {
    let rank = (q / 100.0) as f64 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    (sorted[lo] as f64 + (sorted[hi] as f64 - sorted[lo] as f64) * frac) as f32
}
