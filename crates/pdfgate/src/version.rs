//! Version information reported by the health endpoint.

/// pdfgate version from Cargo.toml
pub const PDFGATE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub pdfgate: &'static str,
    /// Name of the extractor backing the service.
    pub extractor: &'static str,
}

impl VersionInfo {
    pub fn new(extractor: &'static str) -> Self {
        Self {
            pdfgate: PDFGATE_VERSION,
            extractor,
        }
    }
}
