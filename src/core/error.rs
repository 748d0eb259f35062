//! Domain errors

use thiserror::Error;

/// Raised by [`crate::core::batcher::BatchingEngine::admit`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// The engine was never started, or has been stopped.
    #[error("batching engine is not running")]
    NotRunning,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("prompt is too long: {len} characters, at most {max} allowed")]
    TooLong { len: usize, max: usize },
}

/// A payload read from a channel that is not a valid [`crate::core::message::OutMessage`].
#[derive(Debug, Error)]
#[error("malformed out message: {0}")]
pub struct MessageError(#[from] serde_json::Error);
