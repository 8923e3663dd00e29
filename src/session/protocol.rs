//! Client control protocol.
//!
//! Inbound `ClientCommand`s are tagged by `action`; outbound `ServerMessage`s
//! are tagged by `type`. Both are JSON objects, one per transport message.

use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize};

use crate::alert::AlertEvent;
use crate::detect::{Detection, DetectionStats};

pub const STATUS_STARTED: &str = "started";
pub const STATUS_STOPPED: &str = "stopped";
pub const STATUS_FINISHED: &str = "finished";

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientCommand {
    Ping {
        #[serde(default)]
        timestamp: Option<serde_json::Value>,
    },
    UpdateConfig {
        #[serde(default)]
        config: ConfigPatch,
    },
    StartProcessing {
        #[serde(default)]
        video_id: Option<String>,
        #[serde(default)]
        file_path: Option<String>,
        #[serde(default)]
        stream_url: Option<String>,
    },
    StopProcessing,
}

/// Per-client display configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub show_boxes: bool,
    /// `None` shows every class.
    pub selected_classes: Option<BTreeSet<String>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            show_boxes: true,
            selected_classes: None,
        }
    }
}

impl ClientConfig {
    /// Merge the fields present in `patch`.
    pub fn apply(&mut self, patch: ConfigPatch) {
        if let Some(show_boxes) = patch.show_boxes {
            self.show_boxes = show_boxes;
        }
        if let Some(selected) = patch.selected_classes {
            self.selected_classes = selected;
        }
    }
}

/// Partial `ClientConfig`. An explicit `"selected_classes": null` clears the filter.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_boxes: Option<bool>,
    #[serde(
        default,
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub selected_classes: Option<Option<BTreeSet<String>>>,
}

fn present_or_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FramePayload {
    /// Base64 JPEG.
    pub image: String,
    pub frame_number: u64,
    pub width: u32,
    pub height: u32,
    /// Detections drawn on (or, with boxes off, associated with) this frame.
    pub detections: Vec<Detection>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Frame {
        data: FramePayload,
    },
    Alert {
        data: AlertEvent,
    },
    Stats {
        data: DetectionStats,
    },
    Status {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    Error {
        message: String,
    },
    /// Transport-level reply to `ping`.
    Pong {
        #[serde(default)]
        timestamp: Option<serde_json::Value>,
    },
}

impl ServerMessage {
    pub fn status(message: impl Into<String>) -> Self {
        ServerMessage::Status {
            message: message.into(),
            source: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Frame { .. } => "frame",
            ServerMessage::Alert { .. } => "alert",
            ServerMessage::Stats { .. } => "stats",
            ServerMessage::Status { .. } => "status",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Pong { .. } => "pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_client_commands() {
        let cmd: ClientCommand =
            serde_json::from_value(json!({"action": "ping", "timestamp": 1712})).unwrap();
        assert_eq!(cmd, ClientCommand::Ping { timestamp: Some(json!(1712)) });

        let cmd: ClientCommand = serde_json::from_value(json!({
            "action": "start_processing",
            "stream_url": "rtmp://media/live/cam1"
        }))
        .unwrap();
        assert_eq!(
            cmd,
            ClientCommand::StartProcessing {
                video_id: None,
                file_path: None,
                stream_url: Some("rtmp://media/live/cam1".into()),
            }
        );

        let cmd: ClientCommand =
            serde_json::from_value(json!({"action": "stop_processing"})).unwrap();
        assert_eq!(cmd, ClientCommand::StopProcessing);

        assert!(serde_json::from_value::<ClientCommand>(json!({"action": "reboot"})).is_err());
    }

    #[test]
    fn config_patch_merges_and_null_clears_filter() {
        let mut config = ClientConfig::default();

        let patch: ConfigPatch =
            serde_json::from_value(json!({"selected_classes": ["Hardhat"]})).unwrap();
        config.apply(patch);
        assert!(config.show_boxes);
        assert_eq!(
            config.selected_classes,
            Some(["Hardhat".to_string()].into_iter().collect())
        );

        let patch: ConfigPatch = serde_json::from_value(json!({"show_boxes": false})).unwrap();
        config.apply(patch);
        assert!(!config.show_boxes);
        assert!(config.selected_classes.is_some());

        let patch: ConfigPatch =
            serde_json::from_value(json!({"selected_classes": null})).unwrap();
        config.apply(patch);
        assert_eq!(config.selected_classes, None);
    }

    #[test]
    fn server_messages_are_type_tagged() {
        let json = serde_json::to_value(ServerMessage::status(STATUS_FINISHED)).unwrap();
        assert_eq!(json, json!({"type": "status", "message": "finished"}));

        let json = serde_json::to_value(ServerMessage::error("boom")).unwrap();
        assert_eq!(json, json!({"type": "error", "message": "boom"}));

        let stats = ServerMessage::Stats {
            data: DetectionStats::default(),
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["type"], "stats");
        assert_eq!(json["data"]["total_detections"], 0);
        assert_eq!(stats.kind(), "stats");
    }
}
