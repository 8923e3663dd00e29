use thiserror::Error;

/// Failure taxonomy for the live pipeline.
///
/// Only `TransientIo` is retried (by the stream manager's maintenance loop).
/// Everything else is either rejected synchronously or ends the affected
/// client session with a single `error` message.
#[derive(Error, Debug)]
pub enum SentinelError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient i/o failure: {0}")]
    TransientIo(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("delivery failed for client {0}")]
    Delivery(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SentinelError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SentinelError::TransientIo(_))
    }
}

pub type Result<T> = std::result::Result<T, SentinelError>;
