//! Synthetic capture for tests and demos.
//!
//! Produces patterned RGB frames paced at a target frame rate. Optionally
//! ends after a fixed number of frames (file-like) or fails a number of open
//! attempts before succeeding (flaky-network-like).

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use super::{CaptureOpener, VideoCapture};
use crate::frame::Frame;

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    /// Pacing of `read`. 0 disables pacing.
    pub target_fps: u32,
    /// End of stream after this many frames; `None` never ends.
    pub frame_limit: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            target_fps: 30,
            frame_limit: None,
        }
    }
}

pub struct SyntheticCapture {
    config: SyntheticConfig,
    frame_count: u64,
    scene_state: u8,
    last_read: Option<Instant>,
    released: bool,
}

impl SyntheticCapture {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            scene_state: 0,
            last_read: None,
            released: false,
        }
    }

    pub fn frames_read(&self) -> u64 {
        self.frame_count
    }

    fn pace(&mut self) {
        if self.config.target_fps == 0 {
            return;
        }
        let interval = Duration::from_secs_f64(1.0 / self.config.target_fps as f64);
        if let Some(last) = self.last_read {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_read = Some(Instant::now());
    }

    /// Mostly static background; the scene shifts every 50 frames.
    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.config.width * self.config.height * 3) as usize;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(rand::random::<u8>() | 1);
        }
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl VideoCapture for SyntheticCapture {
    fn read(&mut self) -> Result<Option<Frame>> {
        if self.released {
            return Ok(None);
        }
        if let Some(limit) = self.config.frame_limit {
            if self.frame_count >= limit {
                return Ok(None);
            }
        }
        self.pace();
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        let frame = Frame::new(pixels, self.config.width, self.config.height)?;
        Ok(Some(frame))
    }

    fn release(&mut self) {
        self.released = true;
    }
}

/// Opens `SyntheticCapture`s for any location.
#[derive(Default)]
pub struct SyntheticOpener {
    config: SyntheticConfig,
    failures_remaining: AtomicU32,
}

impl SyntheticOpener {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            failures_remaining: AtomicU32::new(0),
        }
    }

    /// Fail the first `count` open attempts.
    pub fn failing_first(self, count: u32) -> Self {
        self.failures_remaining.store(count, Ordering::SeqCst);
        self
    }
}

impl CaptureOpener for SyntheticOpener {
    fn open(&self, location: &str) -> Result<Box<dyn VideoCapture>> {
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow!("synthetic open failure for {}", location));
        }
        log::debug!("SyntheticOpener: opened {}", location);
        Ok(Box::new(SyntheticCapture::new(self.config.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unpaced(limit: Option<u64>) -> SyntheticConfig {
        SyntheticConfig {
            width: 8,
            height: 6,
            target_fps: 0,
            frame_limit: limit,
        }
    }

    #[test]
    fn synthetic_capture_produces_frames_until_limit() {
        let mut cap = SyntheticCapture::new(unpaced(Some(2)));
        let frame = cap.read().unwrap().expect("first frame");
        assert_eq!((frame.width, frame.height), (8, 6));
        assert!(cap.read().unwrap().is_some());
        assert!(cap.read().unwrap().is_none());
        assert_eq!(cap.frames_read(), 2);
    }

    #[test]
    fn released_capture_reads_nothing() {
        let mut cap = SyntheticCapture::new(unpaced(None));
        cap.release();
        assert!(cap.read().unwrap().is_none());
    }

    #[test]
    fn opener_fails_requested_number_of_times() {
        let opener = SyntheticOpener::new(unpaced(None)).failing_first(2);
        assert!(opener.open("rtmp://cam/live").is_err());
        assert!(opener.open("rtmp://cam/live").is_err());
        assert!(opener.open("rtmp://cam/live").is_ok());
    }
}
