use std::collections::VecDeque;
use std::time::Instant;

use anyhow::{anyhow, Result};

use crate::detect::backend::Detector;
use crate::detect::result::{Detection, DetectionOutput, DetectionStats};
use crate::frame::Frame;

/// Stub backend. Never detects anything; used when no model is configured.
#[derive(Debug, Default)]
pub struct StubBackend {
    calls: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Detector for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<DetectionOutput> {
        self.calls += 1;
        Ok(DetectionOutput::default())
    }
}

/// One scripted response.
#[derive(Clone, Debug)]
pub enum ScriptStep {
    Detect(Vec<Detection>),
    Fail(String),
}

/// Replays a fixed script of detector responses, one per call.
///
/// Once the script is exhausted the last `Detect` step repeats (or nothing is
/// detected if the script was empty). Used for demos and tests where a real
/// model is not available.
#[derive(Debug, Default)]
pub struct ScriptedDetector {
    script: VecDeque<ScriptStep>,
    last: Vec<Detection>,
    warm_up_error: Option<String>,
    calls: u64,
}

impl ScriptedDetector {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            script: steps.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Script that returns `detections` on every call.
    pub fn repeating(detections: Vec<Detection>) -> Self {
        Self::new([ScriptStep::Detect(detections)])
    }

    pub fn failing_warm_up(mut self, message: impl Into<String>) -> Self {
        self.warm_up_error = Some(message.into());
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Detector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<DetectionOutput> {
        let started = Instant::now();
        self.calls += 1;
        match self.script.pop_front() {
            Some(ScriptStep::Detect(detections)) => self.last = detections,
            Some(ScriptStep::Fail(message)) => return Err(anyhow!(message)),
            None => {}
        }
        let detections = self.last.clone();
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        Ok(DetectionOutput {
            stats: DetectionStats::from_detections(&detections, elapsed_ms),
            detections,
        })
    }

    fn warm_up(&mut self) -> Result<()> {
        match &self.warm_up_error {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    fn frame() -> Frame {
        Frame::filled(4, 4, [0, 0, 0]).unwrap()
    }

    #[test]
    fn stub_backend_detects_nothing() {
        let mut backend = StubBackend::new();
        let out = backend.detect(&frame()).unwrap();
        assert!(out.detections.is_empty());
        assert_eq!(out.stats.total_detections, 0);
        assert_eq!(backend.calls(), 1);
    }

    #[test]
    fn scripted_detector_replays_then_repeats_last() {
        let hardhat = Detection::new("Hardhat", 0.9, BoundingBox::new(0, 0, 2, 2));
        let mut det = ScriptedDetector::new([
            ScriptStep::Detect(vec![]),
            ScriptStep::Detect(vec![hardhat.clone()]),
            ScriptStep::Fail("gpu lost".into()),
        ]);
        assert!(det.detect(&frame()).unwrap().detections.is_empty());
        assert_eq!(det.detect(&frame()).unwrap().detections, vec![hardhat.clone()]);
        assert!(det.detect(&frame()).is_err());
        assert_eq!(det.detect(&frame()).unwrap().detections, vec![hardhat]);
        assert_eq!(det.calls(), 4);
    }

    #[test]
    fn scripted_warm_up_failure_is_reported() {
        let mut det = ScriptedDetector::default().failing_warm_up("model missing");
        assert!(det.warm_up().is_err());
    }
}
