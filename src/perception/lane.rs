use anyhow::Result;
use image::Rgb;

use super::vision::{self, HoughParams, Segment};
use super::{DriveContext, Perception, PerceptionEngine};
use crate::command::{Command, SteeringSignal};
use crate::frame::DecodedImage;

const SEGMENT_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

/// Calibration for the lane follower.
#[derive(Clone, Debug, PartialEq)]
pub struct LaneConfig {
    /// Gaussian kernel size (odd).
    pub blur_kernel: u32,
    pub canny_low: f32,
    pub canny_high: f32,
    /// Fraction of the frame height where the analysed region starts.
    pub roi_start: f64,
    pub hough_rho: f64,
    pub hough_theta_deg: f64,
    pub hough_threshold: u32,
    pub min_line_length: u32,
    pub max_line_gap: u32,
    /// Mean angles within `[-deadband, deadband]` radians mean "go straight".
    pub deadband: f64,
    pub seed: u64,
    pub line_thickness: u32,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            blur_kernel: 5,
            canny_low: 45.0,
            canny_high: 80.0,
            roi_start: 0.5,
            hough_rho: 1.0,
            hough_theta_deg: 1.0,
            hough_threshold: 30,
            min_line_length: 20,
            max_line_gap: 20,
            deadband: 0.15,
            seed: 0,
            line_thickness: 2,
        }
    }
}

impl LaneConfig {
    fn hough(&self) -> HoughParams {
        HoughParams {
            rho: self.hough_rho,
            theta: self.hough_theta_deg.to_radians(),
            threshold: self.hough_threshold,
            min_line_length: self.min_line_length,
            max_line_gap: self.max_line_gap,
            seed: self.seed,
        }
    }
}

/// Map a mean segment angle to a steering signal.
///
/// `None` means no segment was found: halt once when driving autonomously,
/// otherwise report no signal.
pub fn classify_angle(
    mean_angle: Option<f64>,
    context: &DriveContext,
    deadband: f64,
) -> SteeringSignal {
    match mean_angle {
        None if context.autonomous && context.last_command != Some(Command::Halt) => {
            SteeringSignal::Halt
        }
        None => SteeringSignal::NoSignal,
        Some(angle) if angle > deadband => SteeringSignal::Left,
        Some(angle) if angle < -deadband => SteeringSignal::Right,
        Some(_) => SteeringSignal::Forward,
    }
}

/// Steers from line segments found in the lower part of the frame.
pub struct LaneFollower {
    config: LaneConfig,
}

impl LaneFollower {
    pub fn new(config: LaneConfig) -> Self {
        Self { config }
    }

    /// Segments in full-frame coordinates.
    pub fn segments(&self, image: &DecodedImage) -> Vec<Segment> {
        let gray = vision::grayscale(image);
        let blurred = vision::gaussian_blur(&gray, self.config.blur_kernel);
        let edges = vision::canny(&blurred, self.config.canny_low, self.config.canny_high);

        let roi_row = (f64::from(edges.height()) * self.config.roi_start.clamp(0.0, 1.0)) as u32;
        let region = vision::crop_rows(&edges, roi_row);
        vision::hough_segments(&region, &self.config.hough())
            .into_iter()
            .map(|segment| segment.offset_y(roi_row as i32))
            .collect()
    }
}

impl PerceptionEngine for LaneFollower {
    fn name(&self) -> &'static str {
        "lane"
    }

    fn analyze(&mut self, image: &DecodedImage, context: &DriveContext) -> Result<Perception> {
        let segments = self.segments(image);
        let mut annotated = image.clone();
        let mut sum = 0.0;
        for segment in &segments {
            sum += segment.angle();
            vision::draw_segment(
                &mut annotated,
                segment,
                SEGMENT_COLOR,
                self.config.line_thickness,
            );
        }
        let mean_angle = (!segments.is_empty()).then(|| sum / segments.len() as f64);
        let signal = classify_angle(mean_angle, context, self.config.deadband);
        log::trace!(
            "lane: {} segments, mean angle {:?}, signal {:?}",
            segments.len(),
            mean_angle,
            signal
        );

        Ok(Perception {
            signal,
            mean_angle,
            segments: segments.len(),
            detections: Vec::new(),
            annotated,
        })
    }
}
