//! Caller-facing errors.
//!
//! Only resource exhaustion, shutdown and bad arguments reach the caller of
//! [`StoryEngine::generate_unit`](crate::StoryEngine::generate_unit).
//! Generator, validation and timeout failures degrade to a fallback unit
//! instead.

use crate::admission::AdmissionError;
use thiserror::Error;

/// Errors from [`StoryEngine`](crate::StoryEngine) operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("generation capacity exhausted ({queued} requests waiting)")]
    Busy { queued: usize },

    #[error("engine is shut down")]
    ShutDown,

    #[error("invalid position: chapter {chapter}, subchapter {subchapter}")]
    InvalidPosition { chapter: u32, subchapter: u8 },
}

impl EngineError {
    /// Whether the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Busy { .. })
    }
}

impl From<AdmissionError> for EngineError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::QueueFull { depth } => EngineError::Busy { queued: depth },
            _ => EngineError::ShutDown,
        }
    }
}
