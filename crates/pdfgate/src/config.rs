//! Service configuration.

use std::time::Duration;

use crate::gate::AdmissionPolicy;

/// 25 MiB.
pub const DEFAULT_MAX_DOCUMENT_BYTES: usize = 25 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Admission ceiling: requests in flight at once, including the one
    /// holding the processing slot.
    pub max_concurrency: usize,
    /// How long a request waits for admission. Zero rejects immediately.
    pub admission_timeout: Duration,
    /// How long an admitted request waits for the processing slot.
    pub gate_timeout: Duration,
    pub max_document_bytes: usize,
    /// Timeout for `/process/url` downloads.
    pub fetch_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            admission_timeout: Duration::ZERO,
            gate_timeout: Duration::from_secs(30),
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
            fetch_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("max concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("max document size must be at least 1 byte")]
    ZeroDocumentLimit,

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

impl ServiceConfig {
    pub fn admission_policy(&self) -> AdmissionPolicy {
        AdmissionPolicy::from_wait(self.admission_timeout)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.max_document_bytes == 0 {
            return Err(ConfigError::ZeroDocumentLimit);
        }
        Ok(())
    }
}
