use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use ppe_sentinel::config::SentinelConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SENTINEL_CONFIG",
        "SENTINEL_TARGET_FPS",
        "SENTINEL_INFERENCE_INTERVAL",
        "SENTINEL_RECONNECT_DELAY_MS",
        "SENTINEL_MAX_RECONNECT_ATTEMPTS",
        "SENTINEL_ALERT_COOLDOWN_SECS",
        "SENTINEL_MODEL_PATH",
        "SENTINEL_CONFIDENCE_THRESHOLD",
        "SENTINEL_UPLOAD_DIR",
    ] {
        std::env::remove_var(key);
    }
}

fn config_file(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let file = config_file(
        ".json",
        r#"{
            "stream": {
                "reconnect_delay_ms": 2500,
                "max_reconnect_attempts": 4
            },
            "stabilizer": {
                "iou_threshold": 0.4,
                "min_hits": 3
            },
            "alerts": {
                "cooldown_secs": 2.5,
                "history_cap": 50,
                "high_severity": ["NO-Hardhat", "NO-Mask"]
            },
            "processing": {
                "target_fps": 15,
                "inference_interval": 5,
                "upload_dir": "/srv/uploads"
            }
        }"#,
    );

    std::env::set_var("SENTINEL_CONFIG", file.path());
    std::env::set_var("SENTINEL_INFERENCE_INTERVAL", "2");
    std::env::set_var("SENTINEL_MODEL_PATH", "/models/ppe-v2.onnx");

    let cfg = SentinelConfig::load().expect("load config");

    assert_eq!(cfg.stream.reconnect_delay, Duration::from_millis(2500));
    assert_eq!(cfg.stream.max_reconnect_attempts, Some(4));
    assert_eq!(cfg.stabilizer.iou_threshold, 0.4);
    assert_eq!(cfg.stabilizer.min_hits, 3);
    assert_eq!(cfg.stabilizer.max_disappeared, 5);
    assert_eq!(cfg.alerts.cooldown, Duration::from_millis(2500));
    assert_eq!(cfg.alerts.history_cap, 50);
    assert_eq!(cfg.alerts.high_severity, vec!["NO-Hardhat", "NO-Mask"]);
    assert_eq!(cfg.alerts.medium_severity, vec!["NO-Safety Vest"]);
    assert_eq!(cfg.processing.target_fps, 15);
    assert_eq!(cfg.processing.inference_interval, 2);
    assert_eq!(cfg.processing.upload_dir.to_str(), Some("/srv/uploads"));
    assert_eq!(cfg.detector.model_path.to_str(), Some("/models/ppe-v2.onnx"));

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let file = config_file(
        ".toml",
        r#"
[processing]
target_fps = 10
resize_to = [320, 240]
jpeg_quality = 85

[detector]
confidence_threshold = 0.35
"#,
    );

    let cfg = SentinelConfig::load_from(Some(file.path())).expect("load toml");
    assert_eq!(cfg.processing.target_fps, 10);
    assert_eq!(cfg.processing.resize_to, (320, 240));
    assert_eq!(cfg.processing.jpeg_quality, 85);
    assert_eq!(cfg.processing.inference_interval, 3);
    assert_eq!(cfg.detector.confidence_threshold, 0.35);

    clear_env();
}

#[test]
fn zero_reconnect_cap_means_unbounded() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let file = config_file(".json", r#"{"stream": {"max_reconnect_attempts": 3}}"#);
    std::env::set_var("SENTINEL_MAX_RECONNECT_ATTEMPTS", "0");

    let cfg = SentinelConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.stream.max_reconnect_attempts, None);

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    std::env::set_var("SENTINEL_TARGET_FPS", "fast");
    assert!(SentinelConfig::load_from(None).is_err());
    clear_env();

    std::env::set_var("SENTINEL_INFERENCE_INTERVAL", "0");
    assert!(SentinelConfig::load_from(None).is_err());
    clear_env();

    std::env::set_var("SENTINEL_ALERT_COOLDOWN_SECS", "-1");
    assert!(SentinelConfig::load_from(None).is_err());
    clear_env();

    let file = config_file(".json", r#"{"stabilizer": {"iou_threshold": 1.5}}"#);
    assert!(SentinelConfig::load_from(Some(file.path())).is_err());

    let file = config_file(".json", "{ not json");
    assert!(SentinelConfig::load_from(Some(file.path())).is_err());

    clear_env();
}
