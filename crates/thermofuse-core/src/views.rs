//! View composition: RGB overlays, false-colour IR, zoom-out and side-by-side.

use crate::calibration::TemperatureFrame;
use crate::types::DetectionSet;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use thiserror::Error;

/// Landmark marker half-size in view pixels.
const LANDMARK_RADIUS: i64 = 2;
const BOX_THICKNESS: i64 = 2;

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("RGB buffer is {actual} bytes, expected {expected}")]
    BadBuffer { expected: usize, actual: usize },
    #[error("empty frame")]
    Empty,
}

/// Wrap an interleaved RGB8 buffer as an image.
pub fn rgb_image(data: &[u8], width: u32, height: u32) -> Result<RgbImage, ViewError> {
    let expected = width as usize * height as usize * 3;
    if width == 0 || height == 0 {
        return Err(ViewError::Empty);
    }
    if data.len() != expected {
        return Err(ViewError::BadBuffer {
            expected,
            actual: data.len(),
        });
    }
    RgbImage::from_raw(width, height, data.to_vec()).ok_or(ViewError::Empty)
}

/// Resize the RGB frame to `size` and draw boxes and landmarks on it.
///
/// Detection coordinates are in source-frame pixels and are rescaled.
pub fn make_rgb_view(
    frame: &RgbImage,
    detections: &DetectionSet,
    size: (u32, u32),
    color: [u8; 3],
) -> RgbImage {
    let mut view = if frame.dimensions() == size {
        frame.clone()
    } else {
        imageops::resize(frame, size.0, size.1, FilterType::Triangle)
    };
    let sx = size.0 as f32 / frame.width().max(1) as f32;
    let sy = size.1 as f32 / frame.height().max(1) as f32;

    for det in detections.iter() {
        let b = det.bbox.scaled(sx, sy);
        draw_rect(
            &mut view,
            b.x.round() as i64,
            b.y.round() as i64,
            (b.x + b.width).round() as i64,
            (b.y + b.height).round() as i64,
            Rgb(color),
        );
        for &(lx, ly) in det.landmarks {
            fill_square(
                &mut view,
                (lx * sx).round() as i64,
                (ly * sy).round() as i64,
                LANDMARK_RADIUS,
                Rgb([255 - color[0], 255 - color[1], 255 - color[2]]),
            );
        }
    }
    view
}

/// False-colour rendering of a temperature grid, normalised to its own range.
pub fn make_ir_view(temps: &TemperatureFrame, size: (u32, u32)) -> RgbImage {
    let (lo, hi) = temps.range().unwrap_or((0.0, 1.0));
    let span = if hi - lo > f32::EPSILON { hi - lo } else { 1.0 };

    let img = RgbImage::from_fn(temps.width, temps.height, |x, y| {
        let t = temps.at(x, y).unwrap_or(lo);
        ironbow(((t - lo) / span).clamp(0.0, 1.0))
    });
    if img.dimensions() == size || temps.width == 0 || temps.height == 0 {
        img
    } else {
        imageops::resize(&img, size.0, size.1, FilterType::Nearest)
    }
}

/// Black-purple-red-yellow-white ramp, `v` in 0..=1.
fn ironbow(v: f32) -> Rgb<u8> {
    const STOPS: [(f32, [f32; 3]); 5] = [
        (0.0, [0.0, 0.0, 0.0]),
        (0.3, [90.0, 0.0, 140.0]),
        (0.6, [220.0, 40.0, 20.0]),
        (0.85, [255.0, 200.0, 0.0]),
        (1.0, [255.0, 255.0, 255.0]),
    ];
    let upper = STOPS.iter().position(|&(p, _)| v <= p).unwrap_or(STOPS.len() - 1).max(1);
    let (p0, c0) = STOPS[upper - 1];
    let (p1, c1) = STOPS[upper];
    let f = ((v - p0) / (p1 - p0)).clamp(0.0, 1.0);
    Rgb(std::array::from_fn(|i| (c0[i] + (c1[i] - c0[i]) * f).round() as u8))
}

/// Shrink `img` by `factor` (0 < factor <= 1) and centre it on a black
/// canvas of the input size, widening the apparent field of view.
pub fn zoom_out(img: &RgbImage, factor: f32) -> RgbImage {
    let (w, h) = img.dimensions();
    let factor = factor.clamp(0.05, 1.0);
    let nw = ((w as f32 * factor).round() as u32).max(1);
    let nh = ((h as f32 * factor).round() as u32).max(1);
    if (nw, nh) == (w, h) {
        return img.clone();
    }
    let small = imageops::resize(img, nw, nh, FilterType::Triangle);
    let mut canvas = RgbImage::new(w, h);
    imageops::replace(&mut canvas, &small, ((w - nw) / 2) as i64, ((h - nh) / 2) as i64);
    canvas
}

/// Place `left` and `right` side by side; `right` is rescaled to `left`'s height.
pub fn make_combined_view(left: &RgbImage, right: &RgbImage) -> RgbImage {
    let h = left.height();
    let right = if right.height() == h || right.height() == 0 {
        right.clone()
    } else {
        let w = ((right.width() as f32 * h as f32 / right.height() as f32).round() as u32).max(1);
        imageops::resize(right, w, h, FilterType::Triangle)
    };
    let mut out = RgbImage::new(left.width() + right.width(), h.max(right.height()));
    imageops::replace(&mut out, left, 0, 0);
    imageops::replace(&mut out, &right, left.width() as i64, 0);
    out
}

fn put(img: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
        img.put_pixel(x as u32, y as u32, color);
    }
}

/// Outline a box; loops only cover the part that intersects `img`.
fn draw_rect(img: &mut RgbImage, x1: i64, y1: i64, x2: i64, y2: i64, color: Rgb<u8>) {
    let (w, h) = (i64::from(img.width()), i64::from(img.height()));
    if x2 < x1 || y2 < y1 || x2 < 0 || y2 < 0 || x1 >= w || y1 >= h {
        return;
    }
    let (cx1, cx2) = (x1.max(0), x2.min(w - 1));
    let (cy1, cy2) = (y1.max(0), y2.min(h - 1));
    for t in 0..BOX_THICKNESS {
        for x in cx1..=cx2 {
            put(img, x, y1.saturating_add(t), color);
            put(img, x, y2.saturating_sub(t), color);
        }
        for y in cy1..=cy2 {
            put(img, x1.saturating_add(t), y, color);
            put(img, x2.saturating_sub(t), y, color);
        }
    }
}

fn fill_square(img: &mut RgbImage, cx: i64, cy: i64, r: i64, color: Rgb<u8>) {
    let (w, h) = (i64::from(img.width()), i64::from(img.height()));
    let (x1, x2) = (cx.saturating_sub(r).max(0), cx.saturating_add(r).min(w - 1));
    let (y1, y2) = (cy.saturating_sub(r).max(0), cy.saturating_add(r).min(h - 1));
    for y in y1..=y2 {
        for x in x1..=x2 {
            put(img, x, y, color);
        }
    }
}
