//! Frame container and the single-slot latest-frame cell.
//!
//! - `Frame`: immutable RGB24 pixels behind an `Arc`. Cloning is cheap and never
//!   copies pixels; a frame is replaced wholesale, never mutated in place.
//! - `LatestFrame`: one writer (the stream reader thread), any number of readers.
//!   Publishing overwrites unconditionally and never waits on readers.
//! - `FrameSubscription`: reader handle that yields each published frame at most once.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;

use crate::error::{Result, SentinelError};

/// Bytes per pixel for RGB24.
pub const RGB_CHANNELS: usize = 3;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    data: Arc<[u8]>,
    captured_at: Instant,
}

impl Frame {
    /// Wrap RGB24 pixels. The buffer length must match the dimensions exactly.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = expected_len(width, height)?;
        if data.len() != expected {
            return Err(SentinelError::Decode(format!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data: data.into(),
            captured_at: Instant::now(),
        })
    }

    /// Solid-colour frame, handy for synthetic sources and tests.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Result<Self> {
        let len = expected_len(width, height)?;
        let mut data = Vec::with_capacity(len);
        for _ in 0..(len / RGB_CHANNELS) {
            data.extend_from_slice(&rgb);
        }
        Self::new(data, width, height)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn is_oversized(&self, max_width: u32, max_height: u32) -> bool {
        self.width > max_width || self.height > max_height
    }

    /// Resize to `target` when either dimension exceeds the maximum.
    ///
    /// Frames that already fit are returned as-is (shared pixels, no copy).
    pub fn downscale(&self, max_width: u32, max_height: u32, target: (u32, u32)) -> Result<Frame> {
        if !self.is_oversized(max_width, max_height) {
            return Ok(self.clone());
        }
        let (width, height) = target;
        let image = self.to_rgb_image()?;
        let resized =
            image::imageops::resize(&image, width, height, image::imageops::FilterType::Triangle);
        let mut frame = Frame::new(resized.into_raw(), width, height)?;
        frame.captured_at = self.captured_at;
        Ok(frame)
    }

    pub(crate) fn to_rgb_image(&self) -> Result<image::RgbImage> {
        image::RgbImage::from_raw(self.width, self.height, self.data.to_vec())
            .ok_or_else(|| SentinelError::Decode("frame buffer does not match dimensions".into()))
    }
}

fn expected_len(width: u32, height: u32) -> Result<usize> {
    if width == 0 || height == 0 {
        return Err(SentinelError::Decode(format!(
            "frame dimensions must be non-zero (got {}x{})",
            width, height
        )));
    }
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(RGB_CHANNELS))
        .ok_or_else(|| SentinelError::Decode("frame dimensions overflow".into()))
}

// ----------------------------------------------------------------------------
// LatestFrame: single-slot, last-write-wins
// ----------------------------------------------------------------------------

/// Single-slot latest-frame cell shared between a reader thread and the scheduler.
///
/// Backed by a `watch` channel: the slot holds one `Option<Frame>` and `publish`
/// replaces it atomically. Frames nobody read are simply dropped.
#[derive(Debug)]
pub struct LatestFrame {
    slot: watch::Sender<Option<Frame>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    pub fn publish(&self, frame: Frame) {
        self.slot.send_replace(Some(frame));
    }

    pub fn clear(&self) {
        self.slot.send_replace(None);
    }

    /// Most recent frame, if any. Does not mark it as seen for subscribers.
    pub fn latest(&self) -> Option<Frame> {
        self.slot.borrow().clone()
    }

    pub fn subscribe(&self) -> FrameSubscription {
        FrameSubscription {
            rx: self.slot.subscribe(),
        }
    }
}

impl Default for LatestFrame {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader handle on a `LatestFrame`.
#[derive(Debug)]
pub struct FrameSubscription {
    rx: watch::Receiver<Option<Frame>>,
}

impl FrameSubscription {
    /// Frame published since the last call, or `None` when nothing new arrived.
    ///
    /// Also returns `None` once the owning session is gone.
    pub fn try_fresh(&mut self) -> Option<Frame> {
        match self.rx.has_changed() {
            Ok(true) => self.rx.borrow_and_update().clone(),
            _ => None,
        }
    }

    /// True once the session that owned the slot has been removed.
    pub fn is_closed(&self) -> bool {
        self.rx.has_changed().is_err()
    }
}
