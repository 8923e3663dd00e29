use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Axis-aligned box in integer pixel coordinates, `(x1, y1)` top-left and
/// `(x2, y2)` bottom-right. Serialized as `[x1, y1, x2, y2]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub const fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i64 {
        (self.x2 as i64 - self.x1 as i64).max(0)
    }

    pub fn height(&self) -> i64 {
        (self.y2 as i64 - self.y1 as i64).max(0)
    }

    /// Area in pixels; inverted or zero-size boxes have area 0.
    pub fn area(&self) -> i64 {
        self.width() * self.height()
    }

    /// Intersection over Union. Symmetric, 1.0 for identical non-degenerate
    /// boxes, 0.0 for disjoint boxes or when the union is empty.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1) as i64;
        let iy1 = self.y1.max(other.y1) as i64;
        let ix2 = self.x2.min(other.x2) as i64;
        let iy2 = self.y2.min(other.y2) as i64;

        let intersection = (ix2 - ix1).max(0) * (iy2 - iy1).max(0);
        let union = self.area() + other.area() - intersection;
        if union <= 0 {
            return 0.0;
        }
        (intersection as f64 / union as f64) as f32
    }

    /// Clamp into a `width` x `height` frame.
    pub fn clamped(&self, width: u32, height: u32) -> Self {
        let max_x = width.saturating_sub(1) as i32;
        let max_y = height.saturating_sub(1) as i32;
        Self {
            x1: self.x1.clamp(0, max_x),
            y1: self.y1.clamp(0, max_y),
            x2: self.x2.clamp(0, max_x),
            y2: self.y2.clamp(0, max_y),
        }
    }
}

impl From<[i32; 4]> for BoundingBox {
    fn from(v: [i32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [i32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// One detector output for one frame. Produced fresh per inference call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(class_name: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class_name: class_name.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bbox,
        }
    }
}

/// Per-inference statistics delivered to clients in `stats` messages.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionStats {
    pub total_detections: usize,
    pub violations_count: usize,
    pub processing_time_ms: f64,
    #[serde(default)]
    pub counts_by_class: BTreeMap<String, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
}

impl DetectionStats {
    pub fn from_detections(detections: &[Detection], processing_time_ms: f64) -> Self {
        let mut counts_by_class = BTreeMap::new();
        for det in detections {
            *counts_by_class.entry(det.class_name.clone()).or_insert(0) += 1;
        }
        Self {
            total_detections: detections.len(),
            violations_count: super::classes::violations(detections).len(),
            processing_time_ms,
            counts_by_class,
            fps: None,
        }
    }
}

/// Result of one `Detector::detect` call.
#[derive(Clone, Debug, Default)]
pub struct DetectionOutput {
    pub detections: Vec<Detection>,
    pub stats: DetectionStats,
}
