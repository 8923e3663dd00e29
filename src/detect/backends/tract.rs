#![cfg(feature = "backend-tract")]

use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::Detector;
use crate::detect::classes::KNOWN_CLASSES;
use crate::detect::result::{BoundingBox, Detection, DetectionOutput, DetectionStats};
use crate::frame::Frame;

const CXYWH: usize = 4;
const DEFAULT_NMS_IOU: f32 = 0.45;

/// Tract-based backend for YOLOv8-style ONNX detection models.
///
/// The model is expected to take a `1x3xHxW` RGB tensor scaled to `0..1` and
/// produce `1x(4+nc)xN` predictions (`cx, cy, w, h` in model pixels followed
/// by per-class scores). Frames are stretched to the model size and boxes are
/// scaled back to frame coordinates.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
    confidence_threshold: f32,
    nms_iou: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        log::info!(
            "TractBackend: loaded {} ({}x{})",
            model_path.display(),
            width,
            height
        );
        Ok(Self {
            model,
            width,
            height,
            confidence_threshold: 0.5,
            nms_iou: DEFAULT_NMS_IOU,
        })
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let image = frame.to_rgb_image().map_err(|e| anyhow!(e))?;
        let resized = image::imageops::resize(
            &image,
            self.width,
            self.height,
            image::imageops::FilterType::Triangle,
        );
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        );
        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>, frame: &Frame) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let preds = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = preds.shape();
        if shape.len() != 3 || shape[0] != 1 || shape[1] <= CXYWH {
            return Err(anyhow!("unexpected model output shape {:?}", shape));
        }
        let num_classes = (shape[1] - CXYWH).min(KNOWN_CLASSES.len());
        let scale_x = frame.width as f32 / self.width as f32;
        let scale_y = frame.height as f32 / self.height as f32;

        let mut candidates: Vec<Detection> = Vec::new();
        for anchor in 0..shape[2] {
            let (class_id, score) = (0..num_classes)
                .map(|c| (c, preds[[0, CXYWH + c, anchor]]))
                .fold((0, f32::NEG_INFINITY), |best, x| if x.1 > best.1 { x } else { best });
            if score < self.confidence_threshold {
                continue;
            }
            let cx = preds[[0, 0, anchor]] * scale_x;
            let cy = preds[[0, 1, anchor]] * scale_y;
            let w = preds[[0, 2, anchor]] * scale_x;
            let h = preds[[0, 3, anchor]] * scale_y;
            let bbox = BoundingBox::new(
                (cx - w / 2.0) as i32,
                (cy - h / 2.0) as i32,
                (cx + w / 2.0) as i32,
                (cy + h / 2.0) as i32,
            )
            .clamped(frame.width, frame.height);
            if bbox.area() == 0 {
                continue;
            }
            candidates.push(Detection::new(KNOWN_CLASSES[class_id], score, bbox));
        }
        Ok(non_max_suppression(candidates, self.nms_iou))
    }
}

/// Greedy per-class NMS, highest confidence first.
fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        let suppressed = kept.iter().any(|k| {
            k.class_name == det.class_name && k.bbox.iou(&det.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(det);
        }
    }
    kept
}

impl Detector for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionOutput> {
        let started = Instant::now();
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let detections = self.decode(outputs, frame)?;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        Ok(DetectionOutput {
            stats: DetectionStats::from_detections(&detections, elapsed_ms),
            detections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_keeps_best_box_per_class() {
        let a = Detection::new("Person", 0.9, BoundingBox::new(0, 0, 100, 100));
        let b = Detection::new("Person", 0.6, BoundingBox::new(5, 5, 100, 100));
        let c = Detection::new("Hardhat", 0.5, BoundingBox::new(5, 5, 100, 100));
        let kept = non_max_suppression(vec![b, a.clone(), c.clone()], 0.45);
        assert_eq!(kept, vec![a, c]);
    }
}
