use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use super::detector::{non_max_suppression, BoundingBox, Detection, ObjectDetector};
use crate::frame::DecodedImage;

const NMS_IOU: f32 = 0.45;
/// Candidates below this score are dropped before suppression.
const MIN_SCORE: f32 = 0.05;

/// YOLOv8-style ONNX detector run with tract.
///
/// Expects one output shaped `[1, 4 + classes, anchors]` with boxes as
/// centre/size in model-input pixels.
pub struct TractDetector {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    iou_threshold: f32,
    labels: Vec<String>,
}

impl TractDetector {
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(0, f32::fact([1, 3, side, side]).into())
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;
        log::info!("loaded detector model {}", model_path.display());

        Ok(Self {
            model,
            input_size,
            iou_threshold: NMS_IOU,
            labels: Vec::new(),
        })
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_iou_threshold(mut self, iou_threshold: f32) -> Self {
        self.iou_threshold = iou_threshold;
        self
    }

    fn label(&self, class: usize) -> String {
        self.labels
            .get(class)
            .cloned()
            .unwrap_or_else(|| format!("class {}", class))
    }

    fn build_input(&self, image: &DecodedImage) -> Tensor {
        let side = self.input_size;
        let resized = imageops::resize(image, side, side, FilterType::Triangle);
        let side = side as usize;
        tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, channel, y, x)| {
            f32::from(resized.get_pixel(x as u32, y as u32)[channel]) / 255.0
        })
        .into_tensor()
    }

    fn decode(&self, outputs: TVec<TValue>, scale_x: f32, scale_y: f32) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output is not [1, 4 + classes, anchors]")?;
        let (_, rows, anchors) = view.dim();
        if rows <= 4 {
            return Err(anyhow!("model output has no class scores"));
        }

        let mut detections = Vec::new();
        for i in 0..anchors {
            let (class, score) = (4..rows)
                .map(|row| (row - 4, view[[0, row, i]]))
                .fold((0, f32::NEG_INFINITY), |best, cur| {
                    if cur.1 > best.1 {
                        cur
                    } else {
                        best
                    }
                });
            if !score.is_finite() || score < MIN_SCORE {
                continue;
            }
            detections.push(Detection {
                label: self.label(class),
                confidence: score,
                bbox: BoundingBox::from_center(
                    view[[0, 0, i]] * scale_x,
                    view[[0, 1, i]] * scale_y,
                    view[[0, 2, i]] * scale_x,
                    view[[0, 3, i]] * scale_y,
                ),
            });
        }
        Ok(non_max_suppression(detections, self.iou_threshold))
    }
}

impl ObjectDetector for TractDetector {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, image: &DecodedImage, input_size: u32) -> Result<Vec<Detection>> {
        if input_size != self.input_size {
            return Err(anyhow!(
                "model was prepared for {0}x{0} input, asked for {1}x{1}",
                self.input_size,
                input_size
            ));
        }
        let input = self.build_input(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let side = self.input_size as f32;
        let scale_x = image.width() as f32 / side;
        let scale_y = image.height() as f32 / side;
        self.decode(outputs, scale_x, scale_y)
    }
}
