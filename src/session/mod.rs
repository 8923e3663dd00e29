//! Client sessions: the control protocol, the process-wide session registry
//! and the per-client processing loop.

mod orchestrator;
pub mod protocol;
mod registry;

pub use protocol::{
    ClientCommand, ClientConfig, ConfigPatch, FramePayload, ServerMessage, STATUS_FINISHED,
    STATUS_STARTED, STATUS_STOPPED,
};
pub use registry::{DetectorFactory, SessionRegistry, OUTBOUND_CAPACITY};
