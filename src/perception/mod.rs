//! Frame analysis.
//!
//! A `PerceptionEngine` turns one decoded frame into a steering signal plus an
//! annotated copy for display. Engines are interchangeable:
//!
//! - `LaneFollower`: edge and line-segment geometry on the road-facing half
//!   of the frame, producing a steering signal.
//! - `DetectorEngine`: wraps a learned object detector; annotation only, it
//!   never steers.
//!
//! Engines are pure per frame. Any state they need about the drive (mode,
//! last command) arrives in `DriveContext`.

mod detector;
mod lane;
#[cfg(feature = "backend-tract")]
mod tract;
pub mod vision;

use anyhow::Result;

use crate::command::{Command, SteeringSignal};
use crate::config::{EngineKind, RoverConfig};
use crate::frame::DecodedImage;

pub use detector::{
    non_max_suppression, BoundingBox, Detection, DetectorConfig, DetectorEngine, ObjectDetector,
};
pub use lane::{classify_angle, LaneConfig, LaneFollower};
#[cfg(feature = "backend-tract")]
pub use tract::TractDetector;

/// Drive state visible to perception.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DriveContext {
    pub autonomous: bool,
    pub last_command: Option<Command>,
}

/// Output of one analysis pass.
#[derive(Clone, Debug)]
pub struct Perception {
    pub signal: SteeringSignal,
    /// Mean segment angle in radians, when any segment was found.
    pub mean_angle: Option<f64>,
    pub segments: usize,
    pub detections: Vec<Detection>,
    pub annotated: DecodedImage,
}

impl Perception {
    pub fn no_signal(annotated: DecodedImage) -> Self {
        Self {
            signal: SteeringSignal::NoSignal,
            mean_angle: None,
            segments: 0,
            detections: Vec::new(),
            annotated,
        }
    }
}

pub trait PerceptionEngine: Send {
    fn name(&self) -> &'static str;

    fn analyze(&mut self, image: &DecodedImage, context: &DriveContext) -> Result<Perception>;

    /// Optional warm-up hook, run once before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Build the engine selected in `config`.
pub fn build_engine(config: &RoverConfig) -> Result<Box<dyn PerceptionEngine>> {
    match config.engine {
        EngineKind::Lane => Ok(Box::new(LaneFollower::new(config.lane.clone()))),
        EngineKind::Detector => build_detector_engine(config),
    }
}

#[cfg(feature = "backend-tract")]
fn build_detector_engine(config: &RoverConfig) -> Result<Box<dyn PerceptionEngine>> {
    use anyhow::{anyhow, Context};

    let model_path = config
        .detector
        .model_path
        .as_ref()
        .ok_or_else(|| anyhow!("detector engine needs detector.model_path"))?;
    let mut detector = TractDetector::new(model_path, config.detector.input_size)?
        .with_iou_threshold(config.detector.iou_threshold);
    if let Some(labels_path) = &config.detector.labels_path {
        let raw = std::fs::read_to_string(labels_path)
            .with_context(|| format!("read labels file {}", labels_path.display()))?;
        detector = detector.with_labels(
            raw.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
        );
    }
    Ok(Box::new(DetectorEngine::new(
        Box::new(detector),
        config.detector.clone(),
    )))
}

#[cfg(not(feature = "backend-tract"))]
fn build_detector_engine(_config: &RoverConfig) -> Result<Box<dyn PerceptionEngine>> {
    anyhow::bail!("detector engine requires the backend-tract feature")
}
