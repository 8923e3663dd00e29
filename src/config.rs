use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::alert::AlertConfig;
use crate::ingest::StreamSettings;
use crate::track::StabilizerConfig;

const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;
const DEFAULT_DISCONNECT_GRACE_MS: u64 = 1_000;
const DEFAULT_LIVENESS_POLL_MS: u64 = 500;
const DEFAULT_IOU_THRESHOLD: f32 = 0.3;
const DEFAULT_MAX_DISAPPEARED: u32 = 5;
const DEFAULT_LIVE_MIN_HITS: u32 = 1;
const DEFAULT_COOLDOWN_SECS: f64 = 5.0;
const DEFAULT_HISTORY_CAP: usize = 1000;
const DEFAULT_TARGET_FPS: u32 = 30;
const DEFAULT_INFERENCE_INTERVAL: u32 = 3;
const DEFAULT_MAX_FRAME_WIDTH: u32 = 640;
const DEFAULT_MAX_FRAME_HEIGHT: u32 = 640;
const DEFAULT_RESIZE_TO: (u32, u32) = (640, 480);
const DEFAULT_JPEG_QUALITY: u8 = 70;
const DEFAULT_STREAM_WAIT_MS: u64 = 100;
const DEFAULT_UPLOAD_DIR: &str = "temp_videos";
const DEFAULT_MODEL_PATH: &str = "models/ppe.onnx";
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

#[derive(Debug, Deserialize, Default)]
struct SentinelConfigFile {
    stream: Option<StreamConfigFile>,
    stabilizer: Option<StabilizerConfigFile>,
    alerts: Option<AlertsConfigFile>,
    processing: Option<ProcessingConfigFile>,
    detector: Option<DetectorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    reconnect_delay_ms: Option<u64>,
    disconnect_grace_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    liveness_poll_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StabilizerConfigFile {
    iou_threshold: Option<f32>,
    max_disappeared: Option<u32>,
    min_hits: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertsConfigFile {
    cooldown_secs: Option<f64>,
    history_cap: Option<usize>,
    high_severity: Option<Vec<String>>,
    medium_severity: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct ProcessingConfigFile {
    target_fps: Option<u32>,
    inference_interval: Option<u32>,
    max_frame_width: Option<u32>,
    max_frame_height: Option<u32>,
    resize_to: Option<(u32, u32)>,
    jpeg_quality: Option<u8>,
    stream_wait_ms: Option<u64>,
    upload_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    model_path: Option<PathBuf>,
    confidence_threshold: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct SentinelConfig {
    pub stream: StreamSettings,
    pub stabilizer: StabilizerConfig,
    pub alerts: AlertSettings,
    pub processing: ProcessingSettings,
    pub detector: DetectorSettings,
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub cooldown: Duration,
    pub history_cap: usize,
    pub high_severity: Vec<String>,
    pub medium_severity: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ProcessingSettings {
    pub target_fps: u32,
    /// Run inference on every Nth frame.
    pub inference_interval: u32,
    pub max_frame_width: u32,
    pub max_frame_height: u32,
    pub resize_to: (u32, u32),
    pub jpeg_quality: u8,
    /// Wait before re-polling a live stream that had no fresh frame.
    pub stream_wait: Duration,
    pub upload_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub model_path: PathBuf,
    pub confidence_threshold: f32,
}

impl SentinelConfig {
    /// Load from the file named by `SENTINEL_CONFIG` (if set), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SENTINEL_CONFIG").ok();
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

    fn from_file(file: SentinelConfigFile) -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(stream) = file.stream {
            if let Some(ms) = stream.reconnect_delay_ms {
                cfg.stream.reconnect_delay = Duration::from_millis(ms);
            }
            if let Some(ms) = stream.disconnect_grace_ms {
                cfg.stream.disconnect_grace = Duration::from_millis(ms);
            }
            if let Some(ms) = stream.liveness_poll_ms {
                cfg.stream.liveness_poll = Duration::from_millis(ms);
            }
            cfg.stream.max_reconnect_attempts = stream.max_reconnect_attempts.filter(|max| *max > 0);
        }

        if let Some(stabilizer) = file.stabilizer {
            let defaults = cfg.stabilizer;
            cfg.stabilizer = StabilizerConfig {
                iou_threshold: stabilizer.iou_threshold.unwrap_or(defaults.iou_threshold),
                max_disappeared: stabilizer.max_disappeared.unwrap_or(defaults.max_disappeared),
                min_hits: stabilizer.min_hits.unwrap_or(defaults.min_hits),
            };
        }

        if let Some(alerts) = file.alerts {
            if let Some(secs) = alerts.cooldown_secs {
                cfg.alerts.cooldown = Duration::try_from_secs_f64(secs)
                    .map_err(|_| anyhow!("alerts.cooldown_secs must be a non-negative number"))?;
            }
            if let Some(cap) = alerts.history_cap {
                cfg.alerts.history_cap = cap;
            }
            if let Some(high) = alerts.high_severity {
                cfg.alerts.high_severity = high;
            }
            if let Some(medium) = alerts.medium_severity {
                cfg.alerts.medium_severity = medium;
            }
        }

        if let Some(processing) = file.processing {
            let p = &mut cfg.processing;
            p.target_fps = processing.target_fps.unwrap_or(p.target_fps);
            p.inference_interval = processing.inference_interval.unwrap_or(p.inference_interval);
            p.max_frame_width = processing.max_frame_width.unwrap_or(p.max_frame_width);
            p.max_frame_height = processing.max_frame_height.unwrap_or(p.max_frame_height);
            p.resize_to = processing.resize_to.unwrap_or(p.resize_to);
            p.jpeg_quality = processing.jpeg_quality.unwrap_or(p.jpeg_quality);
            if let Some(ms) = processing.stream_wait_ms {
                p.stream_wait = Duration::from_millis(ms);
            }
            if let Some(dir) = processing.upload_dir {
                p.upload_dir = dir;
            }
        }

        if let Some(detector) = file.detector {
            if let Some(path) = detector.model_path {
                cfg.detector.model_path = path;
            }
            if let Some(threshold) = detector.confidence_threshold {
                cfg.detector.confidence_threshold = threshold;
            }
        }

        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(fps) = env_parse::<u32>("SENTINEL_TARGET_FPS", "an integer frame rate")? {
            self.processing.target_fps = fps;
        }
        if let Some(interval) =
            env_parse::<u32>("SENTINEL_INFERENCE_INTERVAL", "an integer frame count")?
        {
            self.processing.inference_interval = interval;
        }
        if let Some(ms) =
            env_parse::<u64>("SENTINEL_RECONNECT_DELAY_MS", "an integer number of milliseconds")?
        {
            self.stream.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(max) =
            env_parse::<u32>("SENTINEL_MAX_RECONNECT_ATTEMPTS", "an integer attempt count")?
        {
            // 0 restores unbounded retry.
            self.stream.max_reconnect_attempts = (max > 0).then_some(max);
        }
        if let Some(secs) =
            env_parse::<f64>("SENTINEL_ALERT_COOLDOWN_SECS", "a number of seconds")?
        {
            self.alerts.cooldown = Duration::try_from_secs_f64(secs).map_err(|_| {
                anyhow!("SENTINEL_ALERT_COOLDOWN_SECS must be a non-negative number")
            })?;
        }
        if let Ok(path) = std::env::var("SENTINEL_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.detector.model_path = PathBuf::from(path);
            }
        }
        if let Some(threshold) =
            env_parse::<f32>("SENTINEL_CONFIDENCE_THRESHOLD", "a number between 0 and 1")?
        {
            self.detector.confidence_threshold = threshold;
        }
        if let Ok(dir) = std::env::var("SENTINEL_UPLOAD_DIR") {
            if !dir.trim().is_empty() {
                self.processing.upload_dir = PathBuf::from(dir);
            }
        }
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.processing.target_fps == 0 {
            return Err(anyhow!("processing.target_fps must be greater than zero"));
        }
        if self.processing.inference_interval == 0 {
            return Err(anyhow!("processing.inference_interval must be greater than zero"));
        }
        let (w, h) = self.processing.resize_to;
        if w == 0 || h == 0 {
            return Err(anyhow!("processing.resize_to must have non-zero dimensions"));
        }
        if !(1..=100).contains(&self.processing.jpeg_quality) {
            return Err(anyhow!("processing.jpeg_quality must be within 1..=100"));
        }
        let iou = self.stabilizer.iou_threshold;
        if !(iou > 0.0 && iou <= 1.0) {
            return Err(anyhow!("stabilizer.iou_threshold must be within (0, 1]"));
        }
        if self.stabilizer.min_hits == 0 {
            return Err(anyhow!("stabilizer.min_hits must be at least 1"));
        }
        let confidence = self.detector.confidence_threshold;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(anyhow!("detector.confidence_threshold must be within [0, 1]"));
        }
        if self.alerts.history_cap == 0 {
            return Err(anyhow!("alerts.history_cap must be greater than zero"));
        }
        Ok(())
    }

    pub fn alert_config(&self) -> AlertConfig {
        AlertConfig {
            cooldown: self.alerts.cooldown,
            history_cap: self.alerts.history_cap,
            high_severity: self.alerts.high_severity.clone(),
            medium_severity: self.alerts.medium_severity.clone(),
        }
    }
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            stream: StreamSettings {
                reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
                disconnect_grace: Duration::from_millis(DEFAULT_DISCONNECT_GRACE_MS),
                liveness_poll: Duration::from_millis(DEFAULT_LIVENESS_POLL_MS),
                max_reconnect_attempts: None,
            },
            stabilizer: StabilizerConfig {
                iou_threshold: DEFAULT_IOU_THRESHOLD,
                max_disappeared: DEFAULT_MAX_DISAPPEARED,
                min_hits: DEFAULT_LIVE_MIN_HITS,
            },
            alerts: AlertSettings {
                cooldown: Duration::from_secs_f64(DEFAULT_COOLDOWN_SECS),
                history_cap: DEFAULT_HISTORY_CAP,
                high_severity: vec!["NO-Hardhat".to_string()],
                medium_severity: vec!["NO-Safety Vest".to_string()],
            },
            processing: ProcessingSettings {
                target_fps: DEFAULT_TARGET_FPS,
                inference_interval: DEFAULT_INFERENCE_INTERVAL,
                max_frame_width: DEFAULT_MAX_FRAME_WIDTH,
                max_frame_height: DEFAULT_MAX_FRAME_HEIGHT,
                resize_to: DEFAULT_RESIZE_TO,
                jpeg_quality: DEFAULT_JPEG_QUALITY,
                stream_wait: Duration::from_millis(DEFAULT_STREAM_WAIT_MS),
                upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            },
            detector: DetectorSettings {
                model_path: PathBuf::from(DEFAULT_MODEL_PATH),
                confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            },
        }
    }
}

fn read_config_file(path: &Path) -> Result<SentinelConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_parse<T: std::str::FromStr>(key: &str, expected: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be {}", key, expected)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_live_pipeline() {
        let cfg = SentinelConfig::default();
        assert_eq!(cfg.processing.target_fps, 30);
        assert_eq!(cfg.processing.inference_interval, 3);
        assert_eq!(cfg.processing.resize_to, (640, 480));
        assert_eq!(cfg.processing.jpeg_quality, 70);
        assert_eq!(cfg.stabilizer.min_hits, 1);
        assert_eq!(cfg.stabilizer.max_disappeared, 5);
        assert_eq!(cfg.stream.reconnect_delay, Duration::from_secs(5));
        assert_eq!(cfg.stream.max_reconnect_attempts, None);
        assert_eq!(cfg.alerts.cooldown, Duration::from_secs(5));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let mut cfg = SentinelConfig::default();
        cfg.stabilizer.iou_threshold = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = SentinelConfig::default();
        cfg.processing.jpeg_quality = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = SentinelConfig::default();
        cfg.detector.confidence_threshold = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = SentinelConfig::default();
        cfg.alerts.history_cap = 0;
        assert!(cfg.validate().is_err());
    }
}
