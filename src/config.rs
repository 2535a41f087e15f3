use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::demux::DEFAULT_MAX_BUFFER_BYTES;
use crate::perception::vision::{MIN_HOUGH_RHO, MIN_HOUGH_THETA_DEG};
use crate::perception::{DetectorConfig, LaneConfig};
use crate::status::DEFAULT_QUEUE_CAPACITY;

const DEFAULT_CONTROL_URL: &str = "ws://192.168.31.81:81/ws";
const DEFAULT_VIDEO_URL: &str = "http://192.168.31.81/video";
const DEFAULT_RECONNECT_MS: u64 = 500;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_SEND_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_POLL_MS: u64 = 50;
const DEFAULT_CHUNK_SIZE: usize = 4096;
const DEFAULT_VIDEO_READ_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RoverConfigFile {
    control: Option<ControlConfigFile>,
    video: Option<VideoConfigFile>,
    engine: Option<String>,
    lane: Option<LaneConfigFile>,
    detector: Option<DetectorConfigFile>,
    status_queue: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ControlConfigFile {
    url: Option<String>,
    reconnect_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    send_timeout_ms: Option<u64>,
    poll_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct VideoConfigFile {
    url: Option<String>,
    chunk_size: Option<usize>,
    max_buffer_bytes: Option<usize>,
    read_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct LaneConfigFile {
    blur_kernel: Option<u32>,
    canny_low: Option<f32>,
    canny_high: Option<f32>,
    roi_start: Option<f64>,
    hough_rho: Option<f64>,
    hough_theta_deg: Option<f64>,
    hough_threshold: Option<u32>,
    min_line_length: Option<u32>,
    max_line_gap: Option<u32>,
    deadband: Option<f64>,
    seed: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectorConfigFile {
    model_path: Option<PathBuf>,
    labels_path: Option<PathBuf>,
    input_size: Option<u32>,
    confidence: Option<f32>,
    iou_threshold: Option<f32>,
}

/// Which perception engine drives the pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EngineKind {
    #[default]
    Lane,
    Detector,
}

impl FromStr for EngineKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lane" => Ok(Self::Lane),
            "detector" => Ok(Self::Detector),
            other => Err(anyhow!(
                "unknown engine '{}'; expected 'lane' or 'detector'",
                other
            )),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Lane => "lane",
            Self::Detector => "detector",
        })
    }
}

#[derive(Debug, Clone)]
pub struct RoverConfig {
    pub control: ControlSettings,
    pub video: VideoSettings,
    pub engine: EngineKind,
    pub lane: LaneConfig,
    pub detector: DetectorConfig,
    pub status_queue: usize,
}

#[derive(Debug, Clone)]
pub struct ControlSettings {
    pub url: String,
    pub reconnect_interval: Duration,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    /// Read timeout of the link thread; bounds shutdown latency.
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct VideoSettings {
    pub url: String,
    pub chunk_size: usize,
    pub max_buffer_bytes: usize,
    pub read_timeout: Duration,
}

impl Default for RoverConfig {
    fn default() -> Self {
        Self {
            control: ControlSettings {
                url: DEFAULT_CONTROL_URL.to_string(),
                reconnect_interval: Duration::from_millis(DEFAULT_RECONNECT_MS),
                connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
                send_timeout: Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS),
                poll_interval: Duration::from_millis(DEFAULT_POLL_MS),
            },
            video: VideoSettings {
                url: DEFAULT_VIDEO_URL.to_string(),
                chunk_size: DEFAULT_CHUNK_SIZE,
                max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
                read_timeout: Duration::from_millis(DEFAULT_VIDEO_READ_TIMEOUT_MS),
            },
            engine: EngineKind::default(),
            lane: LaneConfig::default(),
            detector: DetectorConfig::default(),
            status_queue: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl RoverConfig {
    /// Load from the file named by `ROVER_CONFIG` (if any), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ROVER_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RoverConfigFile) -> Result<Self> {
        let defaults = Self::default();
        let control = file.control.unwrap_or_default();
        let video = file.video.unwrap_or_default();
        let lane = file.lane.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let engine = match file.engine {
            Some(engine) => engine.parse()?,
            None => defaults.engine,
        };
        let millis = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_millis).unwrap_or(default)
        };

        Ok(Self {
            control: ControlSettings {
                url: control.url.unwrap_or(defaults.control.url),
                reconnect_interval: millis(
                    control.reconnect_ms,
                    defaults.control.reconnect_interval,
                ),
                connect_timeout: millis(
                    control.connect_timeout_ms,
                    defaults.control.connect_timeout,
                ),
                send_timeout: millis(control.send_timeout_ms, defaults.control.send_timeout),
                poll_interval: millis(control.poll_ms, defaults.control.poll_interval),
            },
            video: VideoSettings {
                url: video.url.unwrap_or(defaults.video.url),
                chunk_size: video.chunk_size.unwrap_or(defaults.video.chunk_size),
                max_buffer_bytes: video
                    .max_buffer_bytes
                    .unwrap_or(defaults.video.max_buffer_bytes),
                read_timeout: millis(video.read_timeout_ms, defaults.video.read_timeout),
            },
            engine,
            lane: LaneConfig {
                blur_kernel: lane.blur_kernel.unwrap_or(defaults.lane.blur_kernel),
                canny_low: lane.canny_low.unwrap_or(defaults.lane.canny_low),
                canny_high: lane.canny_high.unwrap_or(defaults.lane.canny_high),
                roi_start: lane.roi_start.unwrap_or(defaults.lane.roi_start),
                hough_rho: lane.hough_rho.unwrap_or(defaults.lane.hough_rho),
                hough_theta_deg: lane
                    .hough_theta_deg
                    .unwrap_or(defaults.lane.hough_theta_deg),
                hough_threshold: lane
                    .hough_threshold
                    .unwrap_or(defaults.lane.hough_threshold),
                min_line_length: lane
                    .min_line_length
                    .unwrap_or(defaults.lane.min_line_length),
                max_line_gap: lane.max_line_gap.unwrap_or(defaults.lane.max_line_gap),
                deadband: lane.deadband.unwrap_or(defaults.lane.deadband),
                seed: lane.seed.unwrap_or(defaults.lane.seed),
                ..defaults.lane
            },
            detector: DetectorConfig {
                model_path: detector.model_path,
                labels_path: detector.labels_path,
                input_size: detector.input_size.unwrap_or(defaults.detector.input_size),
                confidence: detector.confidence.unwrap_or(defaults.detector.confidence),
                iou_threshold: detector
                    .iou_threshold
                    .unwrap_or(defaults.detector.iou_threshold),
            },
            status_queue: file.status_queue.unwrap_or(defaults.status_queue),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("ROVER_CONTROL_URL") {
            if !url.trim().is_empty() {
                self.control.url = url.trim().to_string();
            }
        }
        if let Ok(url) = std::env::var("ROVER_VIDEO_URL") {
            if !url.trim().is_empty() {
                self.video.url = url.trim().to_string();
            }
        }
        if let Ok(engine) = std::env::var("ROVER_ENGINE") {
            if !engine.trim().is_empty() {
                self.engine = engine.parse()?;
            }
        }
        if let Ok(reconnect) = std::env::var("ROVER_RECONNECT_MS") {
            let millis: u64 = reconnect.trim().parse().map_err(|_| {
                anyhow!("ROVER_RECONNECT_MS must be an integer number of milliseconds")
            })?;
            self.control.reconnect_interval = Duration::from_millis(millis);
        }
        if let Ok(deadband) = std::env::var("ROVER_DEADBAND_RAD") {
            self.lane.deadband = deadband
                .trim()
                .parse()
                .map_err(|_| anyhow!("ROVER_DEADBAND_RAD must be a number of radians"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        check_url(&self.control.url, &["ws"], "control url")?;
        check_url(&self.video.url, &["http", "https"], "video url")?;

        for (name, value) in [
            ("control.reconnect_ms", self.control.reconnect_interval),
            ("control.connect_timeout_ms", self.control.connect_timeout),
            ("control.send_timeout_ms", self.control.send_timeout),
            ("control.poll_ms", self.control.poll_interval),
            ("video.read_timeout_ms", self.video.read_timeout),
        ] {
            if value.is_zero() {
                bail!("{} must be greater than zero", name);
            }
        }

        if self.video.chunk_size == 0 {
            bail!("video.chunk_size must be greater than zero");
        }
        if self.video.max_buffer_bytes < self.video.chunk_size {
            bail!(
                "video.max_buffer_bytes ({}) must be at least video.chunk_size ({})",
                self.video.max_buffer_bytes,
                self.video.chunk_size
            );
        }
        if self.status_queue == 0 {
            bail!("status_queue must be greater than zero");
        }

        let lane = &self.lane;
        if lane.blur_kernel % 2 == 0 {
            bail!("lane.blur_kernel must be odd, got {}", lane.blur_kernel);
        }
        if lane.canny_low < 0.0 || lane.canny_low > lane.canny_high {
            bail!(
                "lane.canny_low ({}) must be between 0 and lane.canny_high ({})",
                lane.canny_low,
                lane.canny_high
            );
        }
        if !(0.0..1.0).contains(&lane.roi_start) {
            bail!("lane.roi_start must be in [0, 1), got {}", lane.roi_start);
        }
        if !(lane.hough_rho >= MIN_HOUGH_RHO) {
            bail!(
                "lane.hough_rho must be at least {} pixels, got {}",
                MIN_HOUGH_RHO,
                lane.hough_rho
            );
        }
        if !(lane.hough_theta_deg >= MIN_HOUGH_THETA_DEG) {
            bail!(
                "lane.hough_theta_deg must be at least {} degrees, got {}",
                MIN_HOUGH_THETA_DEG,
                lane.hough_theta_deg
            );
        }
        if lane.hough_threshold == 0 {
            bail!("lane.hough_threshold must be greater than zero");
        }
        if !lane.deadband.is_finite() || lane.deadband < 0.0 {
            bail!("lane.deadband must be a non-negative number of radians");
        }

        let detector = &self.detector;
        if !(0.0..=1.0).contains(&detector.confidence) {
            bail!(
                "detector.confidence must be in [0, 1], got {}",
                detector.confidence
            );
        }
        if !(0.0..=1.0).contains(&detector.iou_threshold) {
            bail!(
                "detector.iou_threshold must be in [0, 1], got {}",
                detector.iou_threshold
            );
        }
        if detector.input_size == 0 {
            bail!("detector.input_size must be greater than zero");
        }
        Ok(())
    }
}

fn check_url(raw: &str, schemes: &[&str], what: &str) -> Result<()> {
    let url = Url::parse(raw).map_err(|e| anyhow!("invalid {} '{}': {}", what, raw, e))?;
    if !schemes.contains(&url.scheme()) {
        bail!(
            "{} '{}' must use {}",
            what,
            raw,
            schemes.join(" or ")
        );
    }
    if url.host_str().is_none() {
        bail!("{} '{}' has no host", what, raw);
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<RoverConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
