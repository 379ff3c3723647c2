//! Request-level error taxonomy.

use serde::Serialize;

use crate::fetch::FetchError;
use crate::gate::{AdmissionRejected, GateTimedOut};
use crate::input_validation::ValidationError;

/// Stable tag carried by every error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    /// Missing, oversized, corrupt or unparseable document.
    InvalidInput,
    /// Too many requests in flight.
    AdmissionTimeout,
    /// Processing slot not available within budget.
    ExtractionTimeout,
    /// The extractor failed on valid-looking input.
    WorkerFailure,
}

impl ErrorKind {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::AdmissionTimeout | ErrorKind::ExtractionTimeout)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("document could not be parsed: {0}")]
    InvalidDocument(String),

    #[error(transparent)]
    Busy(#[from] AdmissionRejected),

    #[error(transparent)]
    SlotTimeout(#[from] GateTimedOut),

    #[error("extraction worker failed: {0}")]
    Worker(String),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Validation(_)
            | ServiceError::Fetch(_)
            | ServiceError::InvalidDocument(_) => ErrorKind::InvalidInput,
            ServiceError::Busy(_) => ErrorKind::AdmissionTimeout,
            ServiceError::SlotTimeout(_) => ErrorKind::ExtractionTimeout,
            ServiceError::Worker(_) => ErrorKind::WorkerFailure,
        }
    }

    /// Message safe to return to the caller. Worker details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            ServiceError::Busy(_) => "service busy, retry later".to_string(),
            ServiceError::SlotTimeout(_) => {
                "timed out waiting for processing, retry later".to_string()
            }
            ServiceError::Worker(_) => "internal error while extracting document".to_string(),
            other => other.to_string(),
        }
    }

    pub fn is_too_large(&self) -> bool {
        match self {
            ServiceError::Validation(e) => e.is_too_large(),
            ServiceError::Fetch(e) => e.is_too_large(),
            _ => false,
        }
    }
}
