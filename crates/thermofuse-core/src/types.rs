use serde::{Deserialize, Serialize};

/// Axis-aligned box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Build from corner coordinates (x1, y1, x2, y2).
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter_w = ((self.x + self.width).min(other.x + other.width) - self.x.max(other.x)).max(0.0);
        let inter_h =
            ((self.y + self.height).min(other.y + other.height) - self.y.max(other.y)).max(0.0);
        let inter = inter_w * inter_h;
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Scale both axes, e.g. when mapping detections onto a resized view.
    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self {
            x: self.x * sx,
            y: self.y * sy,
            width: self.width * sx,
            height: self.height * sy,
        }
    }
}

/// Five-point landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
pub type Landmarks = [(f32, f32); 5];

/// One detection, borrowed out of a [`DetectionSet`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection<'a> {
    pub score: f32,
    pub bbox: &'a BoundingBox,
    pub landmarks: &'a Landmarks,
}

/// Index-aligned detection results for one RGB frame.
///
/// `scores[i]`, `boxes[i]` and `landmarks[i]` always describe the same object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionSet {
    scores: Vec<f32>,
    boxes: Vec<BoundingBox>,
    landmarks: Vec<Landmarks>,
}

impl DetectionSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Assemble a set from the three collections a detector returns.
    ///
    /// Mismatched lengths are tolerated: every collection is truncated to the
    /// shortest one so correspondence is preserved, and a warning is logged.
    pub fn from_parts(
        mut scores: Vec<f32>,
        mut boxes: Vec<BoundingBox>,
        mut landmarks: Vec<Landmarks>,
    ) -> Self {
        let n = scores.len().min(boxes.len()).min(landmarks.len());
        if scores.len() != n || boxes.len() != n || landmarks.len() != n {
            tracing::warn!(
                scores = scores.len(),
                boxes = boxes.len(),
                landmarks = landmarks.len(),
                kept = n,
                "detection collections differ in length; truncating"
            );
            scores.truncate(n);
            boxes.truncate(n);
            landmarks.truncate(n);
        }
        Self {
            scores,
            boxes,
            landmarks,
        }
    }

    pub fn push(&mut self, score: f32, bbox: BoundingBox, landmarks: Landmarks) {
        self.scores.push(score);
        self.boxes.push(bbox);
        self.landmarks.push(landmarks);
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn scores(&self) -> &[f32] {
        &self.scores
    }

    pub fn boxes(&self) -> &[BoundingBox] {
        &self.boxes
    }

    pub fn landmarks(&self) -> &[Landmarks] {
        &self.landmarks
    }

    pub fn iter(&self) -> impl Iterator<Item = Detection<'_>> {
        self.scores
            .iter()
            .zip(&self.boxes)
            .zip(&self.landmarks)
            .map(|((&score, bbox), landmarks)| Detection {
                score,
                bbox,
                landmarks,
            })
    }

    /// Keep detections with `score > threshold`.
    ///
    /// One mask is computed from the scores and applied to all three
    /// collections.
    pub fn filter_by_confidence(&self, threshold: f32) -> DetectionSet {
        let keep: Vec<bool> = self.scores.iter().map(|&s| s > threshold).collect();
        DetectionSet {
            scores: apply_mask(&self.scores, &keep),
            boxes: apply_mask(&self.boxes, &keep),
            landmarks: apply_mask(&self.landmarks, &keep),
        }
    }
}

fn apply_mask<T: Clone>(items: &[T], keep: &[bool]) -> Vec<T> {
    items
        .iter()
        .zip(keep)
        .filter(|(_, &k)| k)
        .map(|(item, _)| item.clone())
        .collect()
}
