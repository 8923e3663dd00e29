//! PPE Sentinel
//!
//! Live video pipeline for personal-protective-equipment monitoring: frames
//! come in from uploaded files or live streams, run through a detector, get
//! stabilized and annotated, and go out to connected clients together with
//! deduplicated safety alerts.
//!
//! # Architecture
//!
//! Two execution domains cooperate:
//!
//! 1. **Scheduler**: a single-threaded tokio runtime drives every client's
//!    processing loop and all outbound delivery.
//! 2. **Background I/O**: each live stream gets a maintenance thread and,
//!    once connected, a reader thread. They share only a single-slot
//!    latest-frame cell and a status record with the scheduler.
//!
//! Blocking work (inference, file decode, JPEG encode) runs on tokio's
//! blocking pool so one slow client never stalls another.
//!
//! # Module Structure
//!
//! - `frame`: immutable frames and the latest-frame cell
//! - `detect`: detections, IoU, PPE classes, detector backends
//! - `ingest`: capture collaborators, upload resolution, `StreamManager`
//! - `track`: `DetectionStabilizer` (IoU tracking with debounce)
//! - `alert`: `AlertDispatcher` (cooldown, severity, bounded history)
//! - `annotate`: box drawing and JPEG/base64 encoding
//! - `session`: control protocol, `SessionRegistry`, processing loop
//! - `config`, `error`: configuration loading and the error taxonomy

pub mod alert;
pub mod annotate;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod session;
pub mod track;

pub use alert::{AlertConfig, AlertDispatcher, AlertEvent, AlertStats, Severity};
pub use config::SentinelConfig;
pub use detect::{BoundingBox, Detection, DetectionOutput, DetectionStats, Detector};
pub use error::{Result, SentinelError};
pub use frame::{Frame, FrameSubscription, LatestFrame};
pub use ingest::{
    CaptureOpener, FrameSource, StreamManager, StreamProtocol, StreamSettings, StreamStatus,
    VideoCapture,
};
pub use session::{ClientCommand, ClientConfig, ServerMessage, SessionRegistry};
pub use track::{DetectionStabilizer, StabilizerConfig, TrackedObject};
