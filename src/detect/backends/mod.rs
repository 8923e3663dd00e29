pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::{ScriptStep, ScriptedDetector, StubBackend};

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;
