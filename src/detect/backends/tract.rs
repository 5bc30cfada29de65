#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::RawDetection;

const BOX_FIELDS: usize = 4;

/// Tract-based backend for YOLOv8-style ONNX detection models.
///
/// Expects a single `[1, 4 + classes, anchors]` output with center-format
/// boxes in model input pixels. Frames are resized to the square model
/// input and boxes are scaled back to frame coordinates.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    input_size: u32,
    iou_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            iou_threshold: 0.45,
        })
    }

    /// Override the default IoU threshold used for non-max suppression.
    pub fn with_iou(mut self, iou_threshold: f32) -> Self {
        self.iou_threshold = iou_threshold;
        self
    }

    fn build_input(&self, frame: &RgbImage) -> Tensor {
        let side = self.input_size;
        let resized = image::imageops::resize(frame, side, side, FilterType::Triangle);
        let side = side as usize;
        tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, channel, y, x)| {
            resized.get_pixel(x as u32, y as u32).0[channel] as f32 / 255.0
        })
        .into_tensor()
    }

    fn decode(
        &self,
        outputs: TVec<TValue>,
        frame: &RgbImage,
        confidence_threshold: f32,
        class_filter: &[u32],
    ) -> Result<Vec<RawDetection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let preds = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output is not [batch, fields, anchors]")?;
        let (_, fields, anchors) = preds.dim();
        if fields <= BOX_FIELDS {
            return Err(anyhow!("model output has {} fields per anchor", fields));
        }

        let scale_x = frame.width() as f32 / self.input_size as f32;
        let scale_y = frame.height() as f32 / self.input_size as f32;
        let (w_max, h_max) = (frame.width() as f32, frame.height() as f32);

        let mut candidates = Vec::new();
        for anchor in 0..anchors {
            let mut best = (0usize, f32::NEG_INFINITY);
            for field in BOX_FIELDS..fields {
                let score = preds[[0, field, anchor]];
                if score > best.1 {
                    best = (field - BOX_FIELDS, score);
                }
            }
            let (class_idx, confidence) = best;
            let class_id = class_idx as u32;
            if confidence < confidence_threshold || !class_filter.contains(&class_id) {
                continue;
            }

            let cx = preds[[0, 0, anchor]] * scale_x;
            let cy = preds[[0, 1, anchor]] * scale_y;
            let w = preds[[0, 2, anchor]] * scale_x;
            let h = preds[[0, 3, anchor]] * scale_y;
            candidates.push(RawDetection::new(
                class_id,
                confidence,
                [
                    (cx - w / 2.0).clamp(0.0, w_max),
                    (cy - h / 2.0).clamp(0.0, h_max),
                    (cx + w / 2.0).clamp(0.0, w_max),
                    (cy + h / 2.0).clamp(0.0, h_max),
                ],
            ));
        }

        non_max_suppression(&mut candidates, self.iou_threshold);
        Ok(candidates)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(
        &mut self,
        frame: &RgbImage,
        confidence_threshold: f32,
        class_filter: &[u32],
    ) -> Result<Vec<RawDetection>> {
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, frame, confidence_threshold, class_filter)
    }
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = ix * iy;
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Class-aware NMS: keeps the highest-scoring box of each overlapping group.
fn non_max_suppression(xs: &mut Vec<RawDetection>, iou_threshold: f32) {
    xs.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept = 0;
    for index in 0..xs.len() {
        let drop = (0..kept).any(|prev| {
            xs[prev].class_id == xs[index].class_id
                && iou(&xs[prev].bbox, &xs[index].bbox) > iou_threshold
        });
        if !drop {
            xs.swap(kept, index);
            kept += 1;
        }
    }
    xs.truncate(kept);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_drops_overlapping_boxes_of_same_class() {
        let mut xs = vec![
            RawDetection::new(0, 0.6, [0.0, 0.0, 10.0, 10.0]),
            RawDetection::new(0, 0.9, [1.0, 1.0, 11.0, 11.0]),
            RawDetection::new(2, 0.8, [1.0, 1.0, 11.0, 11.0]),
            RawDetection::new(0, 0.7, [50.0, 50.0, 60.0, 60.0]),
        ];
        non_max_suppression(&mut xs, 0.45);
        assert_eq!(xs.len(), 3);
        assert_eq!(xs[0].confidence, 0.9);
        assert!(xs.iter().any(|d| d.class_id == 2));
    }
}
