//! Frame ingestion.
//!
//! This module provides:
//! - `VideoCapture` / `CaptureOpener`: the decode collaborator (open, read, release)
//! - synthetic captures (`stub://` test and demo sources)
//! - FFmpeg captures for files and network streams (feature: ffmpeg)
//! - upload file resolution for `start_processing{video_id}`
//! - `FrameSource`: one interface over file and live-stream origins
//! - `StreamManager`: live-stream sessions with automatic reconnection
//!
//! Decoding is blocking. Captures are driven from dedicated threads (live
//! streams) or from blocking tasks (files), never from the scheduler thread.

use std::sync::Arc;

use anyhow::Result;

#[cfg(feature = "ffmpeg")]
mod ffmpeg;
pub mod file;
pub mod source;
pub mod stream;
pub mod synthetic;

#[cfg(feature = "ffmpeg")]
pub use ffmpeg::{FfmpegCapture, FfmpegOpener};
pub use file::{is_upload, resolve_upload, ALLOWED_EXTENSIONS};
pub use source::{FrameFetch, FrameSource};
pub use stream::{StreamInfo, StreamManager, StreamProtocol, StreamSettings, StreamState, StreamStatus};
pub use synthetic::{SyntheticCapture, SyntheticConfig, SyntheticOpener};

use crate::frame::Frame;

/// An opened video source.
pub trait VideoCapture: Send {
    /// Next decoded frame. `Ok(None)` means end of stream.
    fn read(&mut self) -> Result<Option<Frame>>;

    /// Release the underlying handle. Reads after release return `Ok(None)`.
    fn release(&mut self);
}

/// Opens captures for a file path or stream URL.
pub trait CaptureOpener: Send + Sync {
    fn open(&self, location: &str) -> Result<Box<dyn VideoCapture>>;
}

/// Opener used by the daemon.
///
/// `stub://` locations get synthetic frames (tests and demos); everything
/// else goes through FFmpeg, which requires the `ffmpeg` feature.
#[derive(Default)]
pub struct MediaOpener {
    synthetic: SyntheticOpener,
}

impl MediaOpener {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaptureOpener for MediaOpener {
    fn open(&self, location: &str) -> Result<Box<dyn VideoCapture>> {
        if location.starts_with("stub://") {
            return self.synthetic.open(location);
        }
        #[cfg(feature = "ffmpeg")]
        {
            FfmpegOpener::new().open(location)
        }
        #[cfg(not(feature = "ffmpeg"))]
        {
            anyhow::bail!("opening {} requires the ffmpeg feature", location)
        }
    }
}

pub fn default_opener() -> Arc<dyn CaptureOpener> {
    Arc::new(MediaOpener::new())
}
