//! One frame-fetching interface over uploaded files and live streams.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::stream::StreamManager;
use super::{CaptureOpener, VideoCapture};
use crate::error::{Result, SentinelError};
use crate::frame::{Frame, FrameSubscription};

/// Outcome of one fetch.
#[derive(Debug)]
pub enum FrameFetch {
    Frame(Frame),
    /// Live stream without a fresh frame yet. Wait and retry.
    Pending,
    /// End of file.
    Finished,
}

pub struct FrameSource {
    origin: Origin,
}

enum Origin {
    File {
        path: PathBuf,
        capture: Option<OwnedCapture>,
    },
    Stream {
        session_id: String,
        url: String,
        frames: FrameSubscription,
    },
}

/// Releases its capture however it is dropped, including inside a blocking
/// read whose task was cancelled.
struct OwnedCapture(Box<dyn VideoCapture>);

impl Drop for OwnedCapture {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl FrameSource {
    /// Open a local video file. Decoding happens on the blocking pool.
    pub async fn open_file(opener: Arc<dyn CaptureOpener>, path: &Path) -> Result<Self> {
        let location = path.display().to_string();
        let capture = tokio::task::spawn_blocking(move || opener.open(&location))
            .await
            .map_err(|e| SentinelError::Decode(format!("open task failed: {}", e)))?
            .map_err(|e| {
                SentinelError::Decode(format!("cannot open video {}: {:#}", path.display(), e))
            })?;
        Ok(Self {
            origin: Origin::File {
                path: path.to_path_buf(),
                capture: Some(OwnedCapture(capture)),
            },
        })
    }

    /// Attach to the live-stream session registered for `url`.
    pub fn attach_stream(streams: &StreamManager, url: &str) -> Result<Self> {
        let session_id = streams
            .find_by_url(url)
            .ok_or_else(|| SentinelError::NotFound(format!("no stream session for {}", url)))?;
        let frames = streams
            .subscribe(&session_id)
            .ok_or_else(|| SentinelError::NotFound(format!("stream session {}", session_id)))?;
        Ok(Self {
            origin: Origin::Stream {
                session_id,
                url: url.to_string(),
                frames,
            },
        })
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.origin, Origin::Stream { .. })
    }

    pub async fn fetch(&mut self) -> Result<FrameFetch> {
        match &mut self.origin {
            Origin::File { capture, .. } => {
                let Some(mut taken) = capture.take() else {
                    return Ok(FrameFetch::Finished);
                };
                let (taken, read) = tokio::task::spawn_blocking(move || {
                    let read = taken.0.read();
                    (taken, read)
                })
                .await
                .map_err(|e| SentinelError::Decode(format!("decode task failed: {}", e)))?;
                match read {
                    Ok(Some(frame)) => {
                        *capture = Some(taken);
                        Ok(FrameFetch::Frame(frame))
                    }
                    Ok(None) => Ok(FrameFetch::Finished),
                    Err(err) => Err(SentinelError::Decode(format!("{:#}", err))),
                }
            }
            Origin::Stream {
                session_id, frames, ..
            } => {
                if let Some(frame) = frames.try_fresh() {
                    Ok(FrameFetch::Frame(frame))
                } else if frames.is_closed() {
                    Err(SentinelError::NotFound(format!(
                        "stream session {} was disconnected",
                        session_id
                    )))
                } else {
                    Ok(FrameFetch::Pending)
                }
            }
        }
    }

    /// Release the file capture. Live-stream sessions are shared and stay up.
    pub fn release(&mut self) {
        if let Origin::File { capture, path } = &mut self.origin {
            if capture.take().is_some() {
                log::debug!("FrameSource: released {}", path.display());
            }
        }
    }
}

impl fmt::Display for FrameSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.origin {
            Origin::File { path, .. } => write!(f, "file {}", path.display()),
            Origin::Stream {
                session_id, url, ..
            } => write!(f, "stream {} ({})", session_id, url),
        }
    }
}
