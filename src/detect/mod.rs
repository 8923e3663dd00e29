mod backend;
mod backends;
pub mod classes;
mod result;

pub use backend::Detector;
pub use backends::{ScriptStep, ScriptedDetector, StubBackend};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use result::{BoundingBox, Detection, DetectionOutput, DetectionStats};
