use anyhow::Result;

use crate::detect::result::DetectionOutput;
use crate::frame::Frame;

/// Inference collaborator: frame in, detections out.
///
/// `detect` is a blocking call of bounded but variable latency. The
/// orchestrator runs it off the scheduler thread and hands ownership of the
/// detector into and back out of the blocking task, so implementations only
/// need to be `Send`.
///
/// Implementations must treat the frame as read-only and must not retain it
/// beyond the call.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<DetectionOutput>;

    /// Optional warm-up hook (model load). Called once before processing starts.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionOutput> {
        (**self).detect(frame)
    }

    fn warm_up(&mut self) -> Result<()> {
        (**self).warm_up()
    }
}
