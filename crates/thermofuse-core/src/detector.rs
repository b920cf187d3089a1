//! Detection collaborator: the [`Detector`] trait and an SCRFD ONNX implementation.
//!
//! SCRFD is anchor-free over three strides; each stride yields score, box
//! and five-point landmark tensors. Decoded candidates are merged with NMS.

use crate::types::{BoundingBox, DetectionSet, Landmarks};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Candidates below this score are discarded before NMS. Kept below the
/// fusion loop's display threshold so that filter still has work to do.
pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.3;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("frame buffer is {actual} bytes, expected {expected} for RGB {width}x{height}")]
    BadFrame {
        expected: usize,
        actual: usize,
        width: u32,
        height: u32,
    },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Black-box object detector over interleaved RGB8 frames.
pub trait Detector: Send {
    fn detect(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<DetectionSet, DetectorError>;
}

/// Stand-in used when no model is configured: always returns an empty set.
pub struct NoDetector;

impl Detector for NoDetector {
    fn detect(&mut self, _rgb: &[u8], _width: u32, _height: u32) -> Result<DetectionSet, DetectorError> {
        Ok(DetectionSet::empty())
    }
}

/// Maps letterboxed model coordinates back to the source frame.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(src_w: usize, src_h: usize, dst: usize) -> Self {
        let scale = (dst as f32 / src_w as f32).min(dst as f32 / src_h as f32);
        let new_w = (src_w as f32 * scale).round();
        let new_h = (src_h as f32 * scale).round();
        Self {
            scale,
            pad_x: (dst as f32 - new_w) / 2.0,
            pad_y: (dst as f32 - new_h) / 2.0,
        }
    }

    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Tensor positions (score, bbox, kps) for one stride.
type StrideSlots = (usize, usize, usize);

#[derive(Debug, Clone)]
struct Candidate {
    score: f32,
    bbox: BoundingBox,
    landmarks: Landmarks,
}

/// SCRFD face detector running on ONNX Runtime.
pub struct ScrfdDetector {
    session: Session,
    slots: [StrideSlots; 3],
    score_threshold: f32,
}

impl ScrfdDetector {
    pub fn load(model_path: &str, score_threshold: f32) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        tracing::info!(path = model_path, outputs = ?names, "loaded SCRFD model");

        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (3 strides x score/bbox/kps), model has {}",
                names.len()
            )));
        }

        Ok(Self {
            slots: output_slots(&names),
            session,
            score_threshold,
        })
    }

    fn tensor(&self, rgb: &[u8], width: usize, height: usize) -> (Array4<f32>, Letterbox) {
        let lb = Letterbox::fit(width, height, SCRFD_INPUT_SIZE);
        let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
        let inv = 1.0 / lb.scale;

        for ty in 0..SCRFD_INPUT_SIZE {
            for tx in 0..SCRFD_INPUT_SIZE {
                let (sx, sy) = ((tx as f32 - lb.pad_x + 0.5) * inv - 0.5, (ty as f32 - lb.pad_y + 0.5) * inv - 0.5);
                let inside = sx >= -0.5 && sy >= -0.5 && sx <= width as f32 - 0.5 && sy <= height as f32 - 0.5;
                for c in 0..3 {
                    let value = if inside {
                        sample_bilinear(rgb, width, height, c, sx, sy)
                    } else {
                        SCRFD_MEAN
                    };
                    tensor[[0, c, ty, tx]] = (value - SCRFD_MEAN) / SCRFD_STD;
                }
            }
        }
        (tensor, lb)
    }
}

impl Detector for ScrfdDetector {
    fn detect(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<DetectionSet, DetectorError> {
        let expected = width as usize * height as usize * 3;
        if rgb.len() != expected || width == 0 || height == 0 {
            return Err(DetectorError::BadFrame {
                expected,
                actual: rgb.len(),
                width,
                height,
            });
        }

        let (input, lb) = self.tensor(rgb, width as usize, height as usize);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (s, b, k) = self.slots[pos];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(s, "scores")?;
            let boxes = extract(b, "boxes")?;
            let kps = extract(k, "kps")?;
            decode_stride(scores, boxes, kps, stride, &lb, self.score_threshold, &mut candidates);
        }

        let mut set = DetectionSet::empty();
        for c in suppress(candidates, SCRFD_NMS_THRESHOLD) {
            set.push(c.score, c.bbox, c.landmarks);
        }
        Ok(set)
    }
}

/// Bilinear sample of channel `c` at fractional source coordinates.
fn sample_bilinear(rgb: &[u8], width: usize, height: usize, c: usize, x: f32, y: f32) -> f32 {
    let x = x.clamp(0.0, (width - 1) as f32);
    let y = y.clamp(0.0, (height - 1) as f32);
    let (x0, y0) = (x.floor() as usize, y.floor() as usize);
    let (x1, y1) = ((x0 + 1).min(width - 1), (y0 + 1).min(height - 1));
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);
    let px = |xx: usize, yy: usize| rgb[(yy * width + xx) * 3 + c] as f32;

    let top = px(x0, y0) * (1.0 - fx) + px(x1, y0) * fx;
    let bottom = px(x0, y1) * (1.0 - fx) + px(x1, y1) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Find tensor slots by name ("score_8", "bbox_16", "kps_32", ...), falling
/// back to the standard export order [scores 8/16/32, boxes 8/16/32, kps 8/16/32].
fn output_slots(names: &[String]) -> [StrideSlots; 3] {
    let find = |prefix: &str, stride: usize| {
        let want = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == want)
    };
    let by_name: Option<Vec<StrideSlots>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match by_name {
        Some(v) => {
            tracing::debug!(slots = ?v, "SCRFD outputs mapped by name");
            [v[0], v[1], v[2]]
        }
        None => {
            tracing::debug!(?names, "SCRFD output names not recognized; using positional order");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    lb: &Letterbox,
    threshold: f32,
    out: &mut Vec<Candidate>,
) {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let step = stride as f32;

    for idx in 0..grid_w * grid_h * SCRFD_ANCHORS_PER_CELL {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }
        let (Some(d), Some(k)) = (boxes.get(idx * 4..idx * 4 + 4), kps.get(idx * 10..idx * 10 + 10))
        else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let ax = (cell % grid_w) as f32 * step;
        let ay = (cell / grid_w) as f32 * step;

        let (x1, y1) = lb.to_source(ax - d[0] * step, ay - d[1] * step);
        let (x2, y2) = lb.to_source(ax + d[2] * step, ay + d[3] * step);

        let mut landmarks = [(0.0, 0.0); 5];
        for (i, point) in landmarks.iter_mut().enumerate() {
            *point = lb.to_source(ax + k[i * 2] * step, ay + k[i * 2 + 1] * step);
        }

        out.push(Candidate {
            score,
            bbox: BoundingBox::from_corners(x1, y1, x2, y2),
            landmarks,
        });
    }
}

/// Greedy NMS; output is sorted by descending score.
fn suppress(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for c in candidates {
        if kept.iter().all(|k| k.bbox.iou(&c.bbox) <= iou_threshold) {
            kept.push(c);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(x: f32, y: f32, w: f32, h: f32, score: f32) -> Candidate {
        Candidate {
            score,
            bbox: BoundingBox { x, y, width: w, height: h },
            landmarks: [(0.0, 0.0); 5],
        }
    }

    #[test]
    fn test_suppress_overlapping() {
        let kept = suppress(
            vec![
                cand(5.0, 5.0, 100.0, 100.0, 0.8),
                cand(0.0, 0.0, 100.0, 100.0, 0.9),
                cand(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        let scores: Vec<f32> = kept.iter().map(|c| c.score).collect();
        assert_eq!(scores, vec![0.9, 0.7]);
    }

    #[test]
    fn test_suppress_empty() {
        assert!(suppress(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_roundtrip() {
        let lb = Letterbox::fit(320, 240, 640);
        assert_eq!(lb.scale, 2.0);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 80.0);
        let (x, y) = lb.to_source(100.0 * 2.0 + lb.pad_x, 50.0 * 2.0 + lb.pad_y);
        assert!((x - 100.0).abs() < 1e-4 && (y - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_output_slots_named_shuffled() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(output_slots(&names), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_output_slots_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| (428 + i).to_string()).collect();
        assert_eq!(output_slots(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_decode_stride_single_anchor() {
        // One confident anchor at cell (1, 0) of stride 32 with unit offsets.
        let grid = SCRFD_INPUT_SIZE / 32;
        let n = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0; n];
        scores[2] = 0.95; // cell 1, first anchor
        let boxes = vec![1.0; n * 4];
        let kps = vec![0.0; n * 10];
        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };

        let mut out = Vec::new();
        decode_stride(&scores, &boxes, &kps, 32, &lb, 0.5, &mut out);
        assert_eq!(out.len(), 1);
        let bbox = out[0].bbox;
        assert_eq!((bbox.x, bbox.y, bbox.width, bbox.height), (0.0, -32.0, 64.0, 64.0));
        assert_eq!(out[0].landmarks[0], (32.0, 0.0));
    }

    #[test]
    fn test_bilinear_uniform() {
        let rgb = vec![200u8; 4 * 4 * 3];
        for &(x, y) in &[(0.0, 0.0), (1.3, 2.7), (3.0, 3.0), (-0.4, 3.4)] {
            assert!((sample_bilinear(&rgb, 4, 4, 1, x, y) - 200.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_no_detector_is_empty() {
        assert!(NoDetector.detect(&[0; 12], 2, 2).unwrap().is_empty());
    }
}
