use std::path::Path;

use image::RgbImage;
use tract_onnx::prelude::*;
use tracing::debug;

use crate::config;
use crate::error::DeterrentError;
use crate::messages::{BoundingBox, RawDetection};

use super::{ensure_model_readable, Classifier};

/// Scores below this never leave the backend.
const MIN_SCORE: f32 = 0.25;

/// Local YOLOv8 ONNX inference through tract.
pub struct TractClassifier {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>,
    width: u32,
    height: u32,
    class_names: Vec<String>,
    iou_threshold: f32,
}

impl TractClassifier {
    pub fn load(
        settings: &config::Classifier,
        model_path: &Path,
        input_size: (u32, u32),
    ) -> Result<Self, DeterrentError> {
        ensure_model_readable(model_path)?;
        let (width, height) = input_size;
        let model_load_error = |reason: String| DeterrentError::ModelLoad {
            path: model_path.display().to_string(),
            reason,
        };

        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .and_then(|model| {
                model.with_input_fact(
                    0,
                    InferenceFact::dt_shape(
                        f32::datum_type(),
                        tvec!(1, 3, height as usize, width as usize),
                    ),
                )
            })
            .and_then(|model| model.into_optimized())
            .and_then(|model| model.into_runnable())
            .map_err(|err| model_load_error(err.to_string()))?;

        Ok(Self {
            model,
            width,
            height,
            class_names: settings.class_names.clone(),
            iou_threshold: settings.iou_threshold,
        })
    }

    fn build_input(&self, frame: &RgbImage) -> Result<Tensor, DeterrentError> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(DeterrentError::Inference(format!(
                "frame size {}x{} does not match model input {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }

        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| frame.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        );
        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>) -> Result<Vec<RawDetection>, DeterrentError> {
        let output = outputs
            .first()
            .ok_or_else(|| DeterrentError::Inference("model produced no outputs".to_string()))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|err| DeterrentError::Inference(err.to_string()))?;
        let view = view
            .into_dimensionality::<tract_ndarray::Ix3>()
            .map_err(|err| DeterrentError::Inference(format!("unexpected output shape: {}", err)))?;

        // [1, 4 + classes, anchors]
        let rows = view.shape()[1];
        let anchors = view.shape()[2];
        if rows <= 4 {
            return Err(DeterrentError::Inference(format!(
                "output has {} rows, expected box plus class scores",
                rows
            )));
        }

        let mut candidates = Vec::new();
        for anchor in 0..anchors {
            let (class_id, score) = (4..rows)
                .map(|row| (row - 4, view[[0, row, anchor]]))
                .fold((0, f32::NEG_INFINITY), |best, current| {
                    if current.1 > best.1 {
                        current
                    } else {
                        best
                    }
                });
            if score < MIN_SCORE {
                continue;
            }

            let cx = view[[0, 0, anchor]];
            let cy = view[[0, 1, anchor]];
            let w = view[[0, 2, anchor]];
            let h = view[[0, 3, anchor]];
            let bbox = BoundingBox::new(
                (cx - w / 2.0).max(0.0),
                (cy - h / 2.0).max(0.0),
                (cx + w / 2.0).min(self.width as f32),
                (cy + h / 2.0).min(self.height as f32),
            );
            candidates.push((class_id, score, bbox));
        }

        let kept = non_max_suppression(candidates, self.iou_threshold);
        Ok(kept
            .into_iter()
            .map(|(class_id, score, bbox)| RawDetection {
                label: self
                    .class_names
                    .get(class_id)
                    .cloned()
                    .unwrap_or_else(|| format!("class_{}", class_id)),
                confidence: score,
                bounding_box: bbox,
            })
            .collect())
    }
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);
    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width() * a.height() + b.width() * b.height() - intersection;
    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Per-class greedy NMS, highest score first.
fn non_max_suppression(
    mut candidates: Vec<(usize, f32, BoundingBox)>,
    iou_threshold: f32,
) -> Vec<(usize, f32, BoundingBox)> {
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
    let mut kept: Vec<(usize, f32, BoundingBox)> = Vec::new();
    for candidate in candidates {
        let overlaps = kept
            .iter()
            .any(|other| other.0 == candidate.0 && iou(&other.2, &candidate.2) > iou_threshold);
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

impl Classifier for TractClassifier {
    fn infer(&mut self, frame: &RgbImage) -> Result<Vec<RawDetection>, DeterrentError> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .map_err(|err| DeterrentError::Inference(format!("ONNX inference failed: {}", err)))?;
        let detections = self.decode(outputs)?;
        debug!(target: "classifier", "tract produced {} detections", detections.len());
        Ok(detections)
    }

    fn name(&self) -> &'static str {
        "tract"
    }
}
