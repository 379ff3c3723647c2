//! Health status types.

use serde::{Deserialize, Serialize};

/// Lifecycle state of the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// Constructed, not yet serving
    #[default]
    Starting,
    /// Serving, processing slot free
    Ready,
    /// Serving, an extraction holds the processing slot
    Busy,
    /// Shutdown signal received, finishing in-flight work
    Draining,
}

impl Health {
    /// Live once initialized. Busy and draining instances are still live, so an
    /// orchestrator must not restart them.
    pub fn is_live(&self) -> bool {
        !matches!(self, Health::Starting)
    }
}
