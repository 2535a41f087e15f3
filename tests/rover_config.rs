use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use rover_pilot::config::{EngineKind, RoverConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "ROVER_CONFIG",
        "ROVER_CONTROL_URL",
        "ROVER_VIDEO_URL",
        "ROVER_ENGINE",
        "ROVER_RECONNECT_MS",
        "ROVER_DEADBAND_RAD",
    ] {
        std::env::remove_var(key);
    }
}

fn write_temp(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = RoverConfig::load().expect("load defaults");
    assert_eq!(cfg.control.url, "ws://192.168.31.81:81/ws");
    assert_eq!(cfg.video.url, "http://192.168.31.81/video");
    assert_eq!(cfg.control.reconnect_interval, Duration::from_millis(500));
    assert_eq!(cfg.video.chunk_size, 4096);
    assert_eq!(cfg.engine, EngineKind::Lane);
    assert_eq!(cfg.lane.canny_low, 45.0);
    assert_eq!(cfg.lane.canny_high, 80.0);
    assert_eq!(cfg.lane.hough_threshold, 30);
    assert_eq!(cfg.detector.confidence, 0.5);
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_temp(
        ".json",
        r#"{
            "control": { "url": "ws://10.0.0.5:81/ws", "reconnect_ms": 750, "poll_ms": 25 },
            "video": { "url": "http://10.0.0.5/video", "chunk_size": 8192 },
            "engine": "lane",
            "lane": { "canny_low": 30, "canny_high": 90, "min_line_length": 40 },
            "detector": { "confidence": 0.6 }
        }"#,
    );
    std::env::set_var("ROVER_CONFIG", file.path());
    std::env::set_var("ROVER_VIDEO_URL", "http://10.0.0.9/video");
    std::env::set_var("ROVER_DEADBAND_RAD", "0.2");

    let cfg = RoverConfig::load().expect("load config");
    assert_eq!(cfg.control.url, "ws://10.0.0.5:81/ws");
    assert_eq!(cfg.control.reconnect_interval, Duration::from_millis(750));
    assert_eq!(cfg.control.poll_interval, Duration::from_millis(25));
    assert_eq!(cfg.video.url, "http://10.0.0.9/video");
    assert_eq!(cfg.video.chunk_size, 8192);
    assert_eq!(cfg.lane.canny_low, 30.0);
    assert_eq!(cfg.lane.canny_high, 90.0);
    assert_eq!(cfg.lane.min_line_length, 40);
    assert_eq!(cfg.lane.max_line_gap, 20);
    assert_eq!(cfg.lane.deadband, 0.2);
    assert_eq!(cfg.detector.confidence, 0.6);

    clear_env();
}

#[test]
fn loads_toml_file_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_temp(
        ".toml",
        r#"
engine = "detector"
status_queue = 32

[control]
url = "ws://rover.local:81/ws"

[detector]
input_size = 416
model_path = "/models/yolov8n.onnx"
"#,
    );
    std::env::set_var("ROVER_RECONNECT_MS", "1500");

    let cfg = RoverConfig::load_from(Some(file.path())).expect("load toml");
    assert_eq!(cfg.engine, EngineKind::Detector);
    assert_eq!(cfg.status_queue, 32);
    assert_eq!(cfg.control.url, "ws://rover.local:81/ws");
    assert_eq!(cfg.control.reconnect_interval, Duration::from_millis(1500));
    assert_eq!(cfg.detector.input_size, 416);
    assert_eq!(
        cfg.detector.model_path.as_deref(),
        Some(std::path::Path::new("/models/yolov8n.onnx"))
    );

    clear_env();
}

#[test]
fn env_engine_override_wins() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("ROVER_ENGINE", "detector");
    let cfg = RoverConfig::load().expect("load config");
    assert_eq!(cfg.engine, EngineKind::Detector);

    std::env::set_var("ROVER_ENGINE", "hough");
    assert!(RoverConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("ROVER_RECONNECT_MS", "soon");
    let err = RoverConfig::load().unwrap_err();
    assert!(err.to_string().contains("ROVER_RECONNECT_MS"));
    clear_env();

    std::env::set_var("ROVER_RECONNECT_MS", "0");
    assert!(RoverConfig::load().is_err());
    clear_env();

    std::env::set_var("ROVER_CONTROL_URL", "http://192.168.31.81/ws");
    assert!(RoverConfig::load().is_err());
    clear_env();

    let file = write_temp(".json", r#"{ "lane": { "canny_low": 100, "canny_high": 50 } }"#);
    assert!(RoverConfig::load_from(Some(file.path())).is_err());

    let file = write_temp(".json", r#"{ "lane": { "canny_lo": 10 } }"#);
    let err = RoverConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    clear_env();
}
