use std::path::PathBuf;

use anyhow::{Context, Result};
use image::{Rgb, RgbImage};

use super::vision;
use super::{DriveContext, Perception, PerceptionEngine};
use crate::command::SteeringSignal;
use crate::frame::DecodedImage;

const BOX_COLOR: Rgb<u8> = Rgb([255, 64, 0]);

/// Detector inference parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectorConfig {
    pub model_path: Option<PathBuf>,
    /// Optional newline-separated class names.
    pub labels_path: Option<PathBuf>,
    /// Square model input resolution in pixels.
    pub input_size: u32,
    pub confidence: f32,
    pub iou_threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            labels_path: None,
            input_size: 320,
            confidence: 0.5,
            iou_threshold: 0.45,
        }
    }
}

/// Axis-aligned box in frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x: cx - w / 2.0,
            y: cy - h / 2.0,
            w,
            h,
        }
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.w).min(other.x + other.w);
        let y2 = (self.y + self.h).min(other.y + other.h);
        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// A learned detector. Implementations return boxes in the coordinates of
/// the image they were given, scaled from whatever resolution they run at.
pub trait ObjectDetector: Send {
    fn name(&self) -> &'static str;

    fn detect(&mut self, image: &DecodedImage, input_size: u32) -> Result<Vec<Detection>>;
}

/// Greedy per-label non-maximum suppression, highest confidence first.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let overlaps = kept.iter().any(|k| {
            k.label == candidate.label && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

/// Annotation-only engine around an `ObjectDetector`. It never steers.
pub struct DetectorEngine {
    detector: Box<dyn ObjectDetector>,
    config: DetectorConfig,
}

impl DetectorEngine {
    pub fn new(detector: Box<dyn ObjectDetector>, config: DetectorConfig) -> Self {
        Self { detector, config }
    }
}

impl PerceptionEngine for DetectorEngine {
    fn name(&self) -> &'static str {
        "detector"
    }

    /// One inference on a blank frame, so a model that loads but cannot run
    /// fails at startup instead of on the first video frame.
    fn warm_up(&mut self) -> Result<()> {
        let size = self.config.input_size;
        self.detector
            .detect(&RgbImage::new(size, size), size)
            .with_context(|| format!("{} warm-up inference", self.detector.name()))?;
        Ok(())
    }

    fn analyze(&mut self, image: &DecodedImage, _context: &DriveContext) -> Result<Perception> {
        let raw = self.detector.detect(image, self.config.input_size)?;
        let detections: Vec<Detection> = raw
            .into_iter()
            .filter(|d| d.confidence >= self.config.confidence)
            .collect();

        let mut annotated = image.clone();
        for detection in &detections {
            let b = detection.bbox;
            vision::draw_rect(
                &mut annotated,
                (b.x.round() as i32, b.y.round() as i32),
                ((b.x + b.w).round() as i32, (b.y + b.h).round() as i32),
                BOX_COLOR,
                2,
            );
            log::debug!(
                "{}: {} {:.2} at ({:.0},{:.0} {:.0}x{:.0})",
                self.detector.name(),
                detection.label,
                detection.confidence,
                b.x,
                b.y,
                b.w,
                b.h
            );
        }

        Ok(Perception {
            signal: SteeringSignal::NoSignal,
            mean_angle: None,
            segments: 0,
            detections,
            annotated,
        })
    }
}
